//! Process configuration.
//!
//! The binary parses [`ServerArgs`] with clap and converts them into a plain
//! [`ServerConfig`]; everything below `main` only ever sees the latter.

use clap::Parser;
use crate::session::DEFAULT_MAX_QUEUED_FRAMES;
use shared::protocol::DEFAULT_MAX_FRAME_LEN;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Runtime worker threads.
    pub workers: usize,
    pub max_sessions: usize,
    pub max_rooms: usize,
    pub max_frame_bytes: usize,
    /// Unwritten outbound frames tolerated before a session is closed.
    pub max_queued_frames: usize,
    /// Sessions silent for longer than this are disconnected.
    pub idle_timeout: Duration,
    /// Rooms with no activity for longer than this are reaped.
    pub room_idle_timeout: Duration,
    pub sweep_interval: Duration,
    /// Consecutive failing commands tolerated before the connection closes.
    pub max_violations: u32,
    pub chat_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 7777,
            workers: 4,
            max_sessions: 1000,
            max_rooms: 100,
            max_frame_bytes: DEFAULT_MAX_FRAME_LEN,
            max_queued_frames: DEFAULT_MAX_QUEUED_FRAMES,
            idle_timeout: Duration::from_secs(300),
            room_idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(10),
            max_violations: 5,
            chat_history: 50,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let checks = [
            ("workers", self.workers == 0),
            ("max-sessions", self.max_sessions == 0),
            ("max-rooms", self.max_rooms == 0),
            ("max-frame-bytes", self.max_frame_bytes == 0),
            ("max-queued-frames", self.max_queued_frames == 0),
            ("idle-timeout-secs", self.idle_timeout.is_zero()),
            ("room-idle-secs", self.room_idle_timeout.is_zero()),
            ("sweep-interval-secs", self.sweep_interval.is_zero()),
            ("max-violations", self.max_violations == 0),
        ];
        match checks.into_iter().find(|(_, bad)| *bad) {
            Some((name, _)) => Err(ConfigError::Zero(name)),
            None => Ok(()),
        }
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct ServerArgs {
    /// Server IP address to bind to
    #[clap(short = 'H', long, default_value = "127.0.0.1")]
    pub host: String,
    /// Server port to listen on
    #[clap(short, long, default_value = "7777")]
    pub port: u16,
    /// Worker threads for the async runtime
    #[clap(short, long, default_value = "4")]
    pub workers: usize,
    /// Maximum concurrent connections
    #[clap(long, default_value = "1000")]
    pub max_sessions: usize,
    /// Maximum concurrent rooms
    #[clap(long, default_value = "100")]
    pub max_rooms: usize,
    /// Largest accepted frame payload in bytes
    #[clap(long, default_value = "1048576")]
    pub max_frame_bytes: usize,
    /// Close sessions with this many frames waiting to be written
    #[clap(long, default_value = "1024")]
    pub max_queued_frames: usize,
    /// Disconnect sessions idle for this many seconds
    #[clap(long, default_value = "300")]
    pub idle_timeout_secs: u64,
    /// Reap rooms idle for this many seconds
    #[clap(long, default_value = "600")]
    pub room_idle_secs: u64,
    /// Seconds between idle sweeps
    #[clap(long, default_value = "10")]
    pub sweep_interval_secs: u64,
    /// Consecutive rejected commands before disconnect
    #[clap(long, default_value = "5")]
    pub max_violations: u32,
    /// Chat lines retained per room
    #[clap(long, default_value = "50")]
    pub chat_history: usize,
    /// Log filter used when RUST_LOG is unset
    #[clap(long, default_value = "info")]
    pub log_level: String,
}

impl From<&ServerArgs> for ServerConfig {
    fn from(args: &ServerArgs) -> Self {
        Self {
            host: args.host.clone(),
            port: args.port,
            workers: args.workers,
            max_sessions: args.max_sessions,
            max_rooms: args.max_rooms,
            max_frame_bytes: args.max_frame_bytes,
            max_queued_frames: args.max_queued_frames,
            idle_timeout: Duration::from_secs(args.idle_timeout_secs),
            room_idle_timeout: Duration::from_secs(args.room_idle_secs),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs),
            max_violations: args.max_violations,
            chat_history: args.chat_history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bind_addr(), "127.0.0.1:7777");
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = ServerConfig {
            max_frame_bytes: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("max-frame-bytes")));

        let config = ServerConfig {
            workers: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("workers")));

        let config = ServerConfig {
            max_queued_frames: 0,
            ..ServerConfig::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::Zero("max-queued-frames")));
    }

    #[test]
    fn test_args_defaults_match_config_defaults() {
        let args = ServerArgs::parse_from(["server"]);
        assert_eq!(ServerConfig::from(&args), ServerConfig::default());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_args_override() {
        let args = ServerArgs::parse_from([
            "server",
            "-H",
            "0.0.0.0",
            "--port",
            "9000",
            "--idle-timeout-secs",
            "30",
            "--max-rooms",
            "3",
            "--max-queued-frames",
            "64",
        ]);
        let config = ServerConfig::from(&args);
        assert_eq!(config.max_queued_frames, 64);
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
        assert_eq!(config.idle_timeout, Duration::from_secs(30));
        assert_eq!(config.max_rooms, 3);
    }
}
