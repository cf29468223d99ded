//! External collaborators: credential checks and result persistence.
//!
//! Both are async traits so real backends can do I/O. The in-memory versions
//! here let the server run standalone and give tests deterministic behavior.
//! They are always called outside any room lock.

use crate::room::{GameSummary, RoomId};
use async_trait::async_trait;
use log::{debug, info};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use thiserror::Error;

const TOKEN_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    #[error("invalid username or password")]
    InvalidCredentials,
    #[error("username is already taken")]
    UsernameTaken,
    #[error("username must be 3-20 letters, digits or underscores")]
    InvalidUsername,
    #[error("password must be at least 4 characters")]
    InvalidPassword,
    #[error("session token is not valid")]
    UnknownToken,
    #[error("service unavailable: {0}")]
    Unavailable(String),
}

/// Identity handed back by a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthGrant {
    pub user_id: String,
    pub display_name: String,
    pub token: String,
}

#[async_trait]
pub trait CredentialService: Send + Sync {
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, ServiceError>;
    async fn register(&self, username: &str, password: &str) -> Result<(), ServiceError>;
    async fn guest(&self, name: Option<&str>) -> Result<AuthGrant, ServiceError>;
    async fn validate(&self, token: &str) -> Result<AuthGrant, ServiceError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: String,
    pub games_played: u32,
    pub wins: u32,
    pub total_score: i64,
    pub best_score: Option<i32>,
}

#[async_trait]
pub trait PersistenceService: Send + Sync {
    async fn record_game_result(&self, summary: &GameSummary) -> Result<(), ServiceError>;
    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, ServiceError>;
}

pub fn is_valid_username(name: &str) -> bool {
    (3..=20).contains(&name.chars().count())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn new_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(char::from)
        .collect()
}

/// Plaintext username/password table with opaque random tokens.
#[derive(Debug, Default)]
pub struct InMemoryCredentials {
    users: Mutex<HashMap<String, String>>,
    tokens: Mutex<HashMap<String, AuthGrant>>,
    next_guest: AtomicU64,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    fn issue(&self, user_id: String, display_name: String) -> AuthGrant {
        let grant = AuthGrant {
            user_id,
            display_name,
            token: new_token(),
        };
        lock(&self.tokens).insert(grant.token.clone(), grant.clone());
        grant
    }
}

#[async_trait]
impl CredentialService for InMemoryCredentials {
    async fn login(&self, username: &str, password: &str) -> Result<AuthGrant, ServiceError> {
        let known = lock(&self.users).get(username).map(|stored| stored == password);
        match known {
            Some(true) => {
                info!("User {} logged in", username);
                Ok(self.issue(format!("user_{username}"), username.to_string()))
            }
            _ => Err(ServiceError::InvalidCredentials),
        }
    }

    async fn register(&self, username: &str, password: &str) -> Result<(), ServiceError> {
        if !is_valid_username(username) {
            return Err(ServiceError::InvalidUsername);
        }
        if password.chars().count() < 4 {
            return Err(ServiceError::InvalidPassword);
        }
        let mut users = lock(&self.users);
        if users.contains_key(username) {
            return Err(ServiceError::UsernameTaken);
        }
        users.insert(username.to_string(), password.to_string());
        info!("Registered user {}", username);
        Ok(())
    }

    async fn guest(&self, name: Option<&str>) -> Result<AuthGrant, ServiceError> {
        let n = self.next_guest.fetch_add(1, Ordering::Relaxed) + 1;
        let display_name = match name {
            Some(name) if is_valid_username(name) => name.to_string(),
            _ => format!("Guest{n}"),
        };
        debug!("Guest login {} as {}", n, display_name);
        Ok(self.issue(format!("guest_{n}"), display_name))
    }

    async fn validate(&self, token: &str) -> Result<AuthGrant, ServiceError> {
        lock(&self.tokens)
            .get(token)
            .cloned()
            .ok_or(ServiceError::UnknownToken)
    }
}

/// Per-user aggregate statistics kept in memory.
#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    profiles: Mutex<HashMap<String, Profile>>,
    games_recorded: Mutex<Vec<RoomId>>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rooms whose results were recorded, in order.
    pub fn recorded_rooms(&self) -> Vec<RoomId> {
        lock(&self.games_recorded).clone()
    }
}

#[async_trait]
impl PersistenceService for InMemoryPersistence {
    async fn record_game_result(&self, summary: &GameSummary) -> Result<(), ServiceError> {
        let mut profiles = lock(&self.profiles);
        for result in summary.results.iter().filter(|r| !r.is_ai) {
            let profile = profiles
                .entry(result.user_id.clone())
                .or_insert_with(|| Profile {
                    user_id: result.user_id.clone(),
                    ..Profile::default()
                });
            profile.games_played += 1;
            if result.is_winner {
                profile.wins += 1;
            }
            profile.total_score += i64::from(result.score);
            profile.best_score = Some(
                profile
                    .best_score
                    .map_or(result.score, |best| best.max(result.score)),
            );
        }
        lock(&self.games_recorded).push(summary.room_id);
        Ok(())
    }

    async fn fetch_profile(&self, user_id: &str) -> Result<Profile, ServiceError> {
        Ok(lock(&self.profiles)
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| Profile {
                user_id: user_id.to_string(),
                ..Profile::default()
            }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::room::PlayerResult;
    use shared::Color;

    #[tokio::test]
    async fn test_register_then_login() {
        let creds = InMemoryCredentials::new();
        creds.register("alice", "secret").await.unwrap();
        assert_eq!(
            creds.register("alice", "other").await,
            Err(ServiceError::UsernameTaken)
        );

        let grant = creds.login("alice", "secret").await.unwrap();
        assert_eq!(grant.user_id, "user_alice");
        assert_eq!(grant.display_name, "alice");
        assert_eq!(grant.token.len(), TOKEN_LEN);

        assert_eq!(
            creds.login("alice", "wrong").await,
            Err(ServiceError::InvalidCredentials)
        );
        assert_eq!(
            creds.login("bob", "secret").await,
            Err(ServiceError::InvalidCredentials)
        );
    }

    #[tokio::test]
    async fn test_register_validates_input() {
        let creds = InMemoryCredentials::new();
        assert_eq!(
            creds.register("a:b", "secret").await,
            Err(ServiceError::InvalidUsername)
        );
        assert_eq!(
            creds.register("carol", "123").await,
            Err(ServiceError::InvalidPassword)
        );
    }

    #[tokio::test]
    async fn test_guests_get_unique_ids() {
        let creds = InMemoryCredentials::new();
        let a = creds.guest(None).await.unwrap();
        let b = creds.guest(Some("Dave")).await.unwrap();
        let c = creds.guest(Some("no:colons")).await.unwrap();
        assert_ne!(a.user_id, b.user_id);
        assert_eq!(a.display_name, "Guest1");
        assert_eq!(b.display_name, "Dave");
        assert_eq!(c.display_name, "Guest3");
    }

    #[tokio::test]
    async fn test_validate_token() {
        let creds = InMemoryCredentials::new();
        let grant = creds.guest(Some("erin")).await.unwrap();
        assert_eq!(creds.validate(&grant.token).await, Ok(grant.clone()));
        assert_eq!(
            creds.validate("nope").await,
            Err(ServiceError::UnknownToken)
        );
    }

    #[tokio::test]
    async fn test_persistence_aggregates_results() {
        let store = InMemoryPersistence::new();
        let summary = GameSummary {
            room_id: 1001,
            results: vec![
                PlayerResult {
                    user_id: "user_a".into(),
                    display_name: "a".into(),
                    color: Color::Blue,
                    score: -10,
                    is_winner: true,
                    is_ai: false,
                },
                PlayerResult {
                    user_id: "user_b".into(),
                    display_name: "b".into(),
                    color: Color::Yellow,
                    score: -20,
                    is_winner: false,
                    is_ai: false,
                },
                PlayerResult {
                    user_id: "ai_1".into(),
                    display_name: "Bot1".into(),
                    color: Color::Red,
                    score: -30,
                    is_winner: false,
                    is_ai: true,
                },
            ],
            winners: vec!["a".into()],
        };
        store.record_game_result(&summary).await.unwrap();
        store.record_game_result(&summary).await.unwrap();

        let a = store.fetch_profile("user_a").await.unwrap();
        assert_eq!(a.games_played, 2);
        assert_eq!(a.wins, 2);
        assert_eq!(a.total_score, -20);
        assert_eq!(a.best_score, Some(-10));

        let ai = store.fetch_profile("ai_1").await.unwrap();
        assert_eq!(ai.games_played, 0);
        assert_eq!(store.recorded_rooms(), vec![1001, 1001]);
    }
}
