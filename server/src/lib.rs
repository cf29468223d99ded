//! # Blokus Room Server Library
//!
//! Authoritative server for four-player Blokus over TCP. Clients send
//! colon-delimited text commands inside length-prefixed frames; the server
//! owns every room, validates every placement and pushes events to the
//! players that need them.
//!
//! ## Core Responsibilities
//!
//! ### Session Lifecycle
//! Each connection becomes a session that moves through
//! Connected → InLobby → InRoom → InGame. Every command is checked against
//! the state it arrives in before any handler runs.
//!
//! ### Room Management
//! The registry creates rooms, tracks which room each user sits in and
//! reaps rooms that empty out or go idle. Rooms enforce host, ready and
//! seating rules.
//!
//! ### Authoritative Rules
//! Placements are validated by `shared::RuleEngine`. Turns advance past
//! colors that cannot move, AI seats play immediately, and the game ends
//! once nobody can place a piece.
//!
//! ## Architecture Design
//!
//! ### Task Per Connection
//! Every socket gets a reader task that dispatches frames in arrival order
//! and a writer task that drains the session's outbound queue. A client that
//! lets more than `max_queued_frames` replies pile up is disconnected.
//!
//! ### Lock Ordering
//! Registry (async `RwLock`) → room (`Mutex`) → session (`Mutex`). Room
//! mutations collect their messages and deliver them after the room lock is
//! released, under a per-room ordering lock, so broadcasts never run under
//! the state lock yet arrive in mutation order.
//!
//! ## Module Organization
//!
//! - `config`: CLI arguments and runtime limits
//! - `network`: listener, accept loop and periodic sweep
//! - `connection`: per-socket reader and writer tasks
//! - `dispatcher`: command parsing, authorization and replies
//! - `session`: connection state machine and the session table
//! - `registry`: rooms and user memberships
//! - `room`: one game room and its turn logic
//! - `ai`: move selection for AI seats
//! - `services`: credential and persistence collaborators
//! - `error`: failure taxonomy and `ERROR:` replies
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::network::Server;
//! use server::services::{InMemoryCredentials, InMemoryPersistence};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let server = Server::bind(
//!         ServerConfig::default(),
//!         Arc::new(InMemoryCredentials::new()),
//!         Arc::new(InMemoryPersistence::new()),
//!     )
//!     .await?;
//!
//!     // Accepts connections and sweeps idle sessions until killed
//!     server.run().await
//! }
//! ```

pub mod ai;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod network;
pub mod registry;
pub mod room;
pub mod services;
pub mod session;
