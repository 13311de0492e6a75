//! Common error types for Wavry codec sessions.

use thiserror::Error;

/// Result type alias using Wavry's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type for codec session operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// A buffer pool could not produce a buffer
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// The underlying codec refused an operation
    #[error("codec rejected operation: {0}")]
    CodecRejected(String),

    /// Operation is not valid in the current state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Caller supplied malformed input
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Session was released; no further operations are accepted
    #[error("session ended")]
    SessionEnded,

    /// Connection to the session host was lost
    #[error("transport lost: {0}")]
    TransportLost(String),

    /// Resource not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }

    /// Create an allocation error from any displayable type.
    pub fn allocation(msg: impl std::fmt::Display) -> Self {
        Self::Allocation(msg.to_string())
    }

    /// Create a codec rejection from any displayable type.
    pub fn codec(msg: impl std::fmt::Display) -> Self {
        Self::CodecRejected(msg.to_string())
    }

    /// Create an invalid state error from any displayable type.
    pub fn invalid_state(msg: impl std::fmt::Display) -> Self {
        Self::InvalidState(msg.to_string())
    }

    /// Create an invalid argument error from any displayable type.
    pub fn invalid_argument(msg: impl std::fmt::Display) -> Self {
        Self::InvalidArgument(msg.to_string())
    }

    /// Create a transport error from any displayable type.
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::TransportLost(msg.to_string())
    }

    /// Create a not found error from any displayable type.
    pub fn not_found(msg: impl std::fmt::Display) -> Self {
        Self::NotFound(msg.to_string())
    }

    /// Create an internal error from any displayable type.
    pub fn internal(msg: impl std::fmt::Display) -> Self {
        Self::Internal(msg.to_string())
    }

    /// Whether the session that produced this error can no longer make progress.
    ///
    /// Allocation failures and bad arguments are local to a single call; the
    /// caller may retry once resources free up.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SessionEnded | Self::TransportLost(_) | Self::Config(_) | Self::Internal(_)
        )
    }
}
