//! Error types for fieldsync-core

use thiserror::Error;

/// Result type alias using fieldsync-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in fieldsync-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Key-value storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// Request never produced a response (DNS, connect, timeout, TLS)
    #[error("Connection failed: {0}")]
    Transport(String),

    /// Server answered with a non-success status
    #[error("Server returned HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Payload rejected before entering a queue
    #[error("Invalid payload for {domain}: {reason}")]
    InvalidPayload { domain: String, reason: String },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Session storage error
    #[error("Session error: {0}")]
    Session(#[from] crate::auth::AuthError),

    /// Unknown resource or domain
    #[error("Not found: {0}")]
    NotFound(String),
}

impl Error {
    /// Whether the error means no response was received at all.
    pub const fn is_transport(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}
