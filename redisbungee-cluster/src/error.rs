//! Error types for the presence layer

use redisbungee_core::models::{PlayerId, ProxyId};
use thiserror::Error;

/// Presence layer error types
#[derive(Debug, Error)]
pub enum Error {
    /// Store unreachable, timed out, or rejected the command. Transient:
    /// callers retry with their own backoff.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Another live proxy already holds the player
    #[error("Player {player} is already claimed by live proxy {owner}")]
    ClaimConflict { player: PlayerId, owner: ProxyId },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The bus or node has already been shut down
    #[error("Presence layer is shut down")]
    Closed,
}

impl Error {
    /// Whether retrying the same call later can succeed
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_))
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<redisbungee_core::ConfigError> for Error {
    fn from(err: redisbungee_core::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

/// Result type for presence operations
pub type Result<T> = std::result::Result<T, Error>;
