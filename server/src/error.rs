//! Failure taxonomy for command handling.
//!
//! Lower layers return their own error enums; [`CommandError`] is what the
//! dispatcher turns into an `ERROR:<code>:<message>` reply.

use crate::registry::RegistryError;
use crate::room::RoomError;
use crate::services::ServiceError;
use shared::protocol::ParseError;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Command not permitted in the session's current state.
    Authorization,
    /// Request rejected by room or registry rules.
    Validation,
    /// Illegal move.
    RuleViolation,
    /// Capacity limit hit.
    ResourceExhausted,
    /// Collaborator failure or broken assumption; details are logged only.
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Authorization => "authorization",
            ErrorKind::Validation => "validation",
            ErrorKind::RuleViolation => "rule_violation",
            ErrorKind::ResourceExhausted => "resource_exhausted",
            ErrorKind::Internal => "internal",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error {code}: {message}")]
pub struct CommandError {
    pub kind: ErrorKind,
    pub code: &'static str,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            code,
            message: message.into(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authorization, "unauthorized", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "bad_request", message)
    }

    pub fn unrecognized(text: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, "unrecognized_command", text)
    }

    pub fn internal() -> Self {
        Self::new(ErrorKind::Internal, "internal", "internal server error")
    }

    /// Counts toward the consecutive-violation limit.
    pub fn is_violation(&self) -> bool {
        matches!(
            self.code,
            "unauthorized" | "unrecognized_command" | "bad_request"
        )
    }

    pub fn to_reply(&self) -> String {
        format!("ERROR:{}:{}", self.code, self.message)
    }
}

impl From<RoomError> for CommandError {
    fn from(err: RoomError) -> Self {
        let kind = match err {
            RoomError::NotYourTurn | RoomError::IllegalMove(_) => ErrorKind::RuleViolation,
            _ => ErrorKind::Validation,
        };
        Self::new(kind, err.code(), err.to_string())
    }
}

impl From<RegistryError> for CommandError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Room(room) => room.into(),
            RegistryError::RegistryFull => {
                Self::new(ErrorKind::ResourceExhausted, err.code(), err.to_string())
            }
            other => Self::new(ErrorKind::Validation, other.code(), other.to_string()),
        }
    }
}

impl From<ServiceError> for CommandError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::Unavailable(_) => Self::internal(),
            other => Self::new(ErrorKind::Validation, "auth_failed", other.to_string()),
        }
    }
}

impl From<ParseError> for CommandError {
    fn from(err: ParseError) -> Self {
        match err {
            ParseError::Empty => Self::bad_request("empty command"),
            ParseError::Unrecognized(text) => Self::unrecognized(text),
        }
    }
}
