//! Length-prefixed framing and colon-delimited command parsing.
//!
//! A frame is a little-endian `u32` byte count followed by that many bytes of
//! UTF-8. Inside a frame, the first token names the command; `room`, `game`,
//! `lobby` and `user` commands take a second token as their verb.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 4;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;
pub const DELIMITER: char = ':';

const NAMESPACES: [&str; 4] = ["room", "game", "lobby", "user"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
}

pub fn encode_frame(payload: &str) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload.as_bytes());
    buf.freeze()
}

/// Accumulates inbound bytes and yields complete frames only.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_len: usize,
}

impl FrameDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            max_len,
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Direct access for `AsyncReadExt::read_buf`.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Pops the next complete frame. An oversized length header is reported
    /// as soon as it is read, before the body arrives.
    pub fn next_frame(&mut self) -> Result<Option<String>, FrameError> {
        if self.buffer.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = &self.buffer[..HEADER_LEN];
        let len = header.get_u32_le() as usize;
        if len > self.max_len {
            return Err(FrameError::TooLarge {
                len,
                max: self.max_len,
            });
        }

        if self.buffer.len() < HEADER_LEN + len {
            self.buffer.reserve(HEADER_LEN + len - self.buffer.len());
            return Ok(None);
        }

        self.buffer.advance(HEADER_LEN);
        let payload = self.buffer.split_to(len);
        String::from_utf8(payload.to_vec())
            .map(Some)
            .map_err(|_| FrameError::InvalidUtf8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Ping,
    Auth,
    Register,
    Guest,
    Logout,
    Validate,
    RoomCreate,
    RoomJoin,
    RoomLeave,
    RoomList,
    RoomInfo,
    RoomReady,
    RoomStart,
    RoomEnd,
    RoomTransfer,
    RoomKick,
    RoomAddAi,
    RoomRemoveAi,
    GameMove,
    Chat,
    LobbyList,
    UserStats,
}

impl CommandKind {
    pub const ALL: [CommandKind; 22] = [
        CommandKind::Ping,
        CommandKind::Auth,
        CommandKind::Register,
        CommandKind::Guest,
        CommandKind::Logout,
        CommandKind::Validate,
        CommandKind::RoomCreate,
        CommandKind::RoomJoin,
        CommandKind::RoomLeave,
        CommandKind::RoomList,
        CommandKind::RoomInfo,
        CommandKind::RoomReady,
        CommandKind::RoomStart,
        CommandKind::RoomEnd,
        CommandKind::RoomTransfer,
        CommandKind::RoomKick,
        CommandKind::RoomAddAi,
        CommandKind::RoomRemoveAi,
        CommandKind::GameMove,
        CommandKind::Chat,
        CommandKind::LobbyList,
        CommandKind::UserStats,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::Auth => "auth",
            CommandKind::Register => "register",
            CommandKind::Guest => "guest",
            CommandKind::Logout => "logout",
            CommandKind::Validate => "validate",
            CommandKind::RoomCreate => "room:create",
            CommandKind::RoomJoin => "room:join",
            CommandKind::RoomLeave => "room:leave",
            CommandKind::RoomList => "room:list",
            CommandKind::RoomInfo => "room:info",
            CommandKind::RoomReady => "room:ready",
            CommandKind::RoomStart => "room:start",
            CommandKind::RoomEnd => "room:end",
            CommandKind::RoomTransfer => "room:transfer",
            CommandKind::RoomKick => "room:kick",
            CommandKind::RoomAddAi => "room:addai",
            CommandKind::RoomRemoveAi => "room:removeai",
            CommandKind::GameMove => "game:move",
            CommandKind::Chat => "chat",
            CommandKind::LobbyList => "lobby:list",
            CommandKind::UserStats => "user:stats",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("empty command")]
    Empty,
    #[error("{0}")]
    Unrecognized(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub kind: CommandKind,
    pub args: Vec<String>,
}

impl Command {
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let raw = raw.trim_end_matches(['\r', '\n']);
        let mut tokens = raw.split(DELIMITER);
        let head = tokens.next().unwrap_or_default().trim();
        if head.is_empty() {
            return Err(ParseError::Empty);
        }
        let rest: Vec<&str> = tokens.collect();

        let (name, skip) = if NAMESPACES.contains(&head) {
            match rest.first() {
                Some(verb) => (format!("{head}{DELIMITER}{}", verb.trim()), 1),
                None => return Err(ParseError::Unrecognized(raw.to_string())),
            }
        } else {
            (head.to_string(), 0)
        };

        let kind = CommandKind::from_name(&name)
            .ok_or_else(|| ParseError::Unrecognized(raw.to_string()))?;
        let args = rest[skip..].iter().map(|arg| arg.to_string()).collect();
        Ok(Self { kind, args })
    }

    /// Argument `index`, with empty tokens treated as absent.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args
            .get(index)
            .map(String::as_str)
            .filter(|arg| !arg.is_empty())
    }

    /// Arguments from `index` onward, rejoined with the delimiter.
    pub fn text_from(&self, index: usize) -> String {
        self.args
            .get(index..)
            .map(|rest| rest.join(&DELIMITER.to_string()))
            .unwrap_or_default()
    }
}

/// Builds `kind:arg1:arg2...`.
pub fn format_command(kind: CommandKind, args: &[&str]) -> String {
    let mut out = kind.as_str().to_string();
    for arg in args {
        out.push(DELIMITER);
        out.push_str(arg);
    }
    out
}
