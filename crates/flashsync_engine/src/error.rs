//! Error types for the sync engine.

use crate::store::StoreError;
use flashsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server rejected the host key (HTTP 403).
    #[error("authentication failed")]
    Unauthenticated,

    /// The server answered with a non-200 status.
    #[error("server error {code}: {reason}")]
    Server {
        /// HTTP status code.
        code: u16,
        /// Reason phrase.
        reason: String,
    },

    /// The server returned an error envelope.
    #[error("remote error: {0}")]
    Remote(String),

    /// Protocol error (unexpected or invalid response).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// JSON decoding failed.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Local store failure.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Local file I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed media archive.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Allocation failed while buffering.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Server { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Remote(message) => SyncError::Remote(message),
            ProtocolError::Malformed(e) => SyncError::Decode(e),
            other => SyncError::Protocol(other.to_string()),
        }
    }
}
