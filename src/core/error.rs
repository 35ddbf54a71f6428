use std::io;
use thiserror::Error;

/// Custom error types for the clock synchronization node
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Peer error: {0}")]
    Peer(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Synchronization error: {0}")]
    Sync(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new network error
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Creates a new peer error
    pub fn peer(msg: impl Into<String>) -> Self {
        Error::Peer(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new synchronization error
    pub fn sync(msg: impl Into<String>) -> Self {
        Error::Sync(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Whether this error describes a dropped inbound message rather than
    /// a local failure
    pub fn is_violation(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::Peer(_) | Error::Sync(_) | Error::InvalidState(_)
        )
    }
}
