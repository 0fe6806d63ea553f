//! Typed result of a sync run.

use crate::error::SyncError;
use crate::progress::is_cancellation;
use std::fmt;

/// How a collection or media sync ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Both sides converged.
    Success,
    /// Nothing to exchange.
    NoChanges,
    /// Schemas differ; an incremental sync is impossible.
    FullSyncRequired,
    /// The server rejected the host key.
    BadAuth,
    /// Local and remote clocks differ by more than the tolerance.
    ClockOff {
        /// Absolute difference in seconds.
        delta_secs: i64,
    },
    /// Count vectors differ after the exchange.
    SanityCheckFailed(String),
    /// The server answered with an error status or error envelope.
    ServerError {
        /// HTTP status (200 for an error envelope).
        code: u16,
        /// Reason phrase or envelope text.
        reason: String,
    },
    /// The server asked the client to stop, with a message for the user.
    ServerAbort(String),
    /// Network failure or malformed response.
    TransportFailure(String),
    /// Allocation failed while buffering.
    ResourceExhausted(String),
    /// The caller cancelled the sync.
    Cancelled,
    /// The local store or local file I/O failed.
    LocalFailure(String),
}

impl SyncOutcome {
    /// Returns true for `Success` and `NoChanges`.
    pub fn is_success(&self) -> bool {
        matches!(self, SyncOutcome::Success | SyncOutcome::NoChanges)
    }

    /// Returns true if running the same sync again later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncOutcome::TransportFailure(_) => true,
            SyncOutcome::ServerError { code, .. } => *code >= 500,
            _ => false,
        }
    }
}

impl From<SyncError> for SyncOutcome {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Transport { message, .. } => SyncOutcome::TransportFailure(message),
            SyncError::Unauthenticated => SyncOutcome::BadAuth,
            SyncError::Server { code, reason } => SyncOutcome::ServerError { code, reason },
            SyncError::Remote(reason) => SyncOutcome::ServerError { code: 200, reason },
            SyncError::Protocol(message) => SyncOutcome::TransportFailure(message),
            SyncError::Decode(e) => SyncOutcome::TransportFailure(e.to_string()),
            SyncError::Zip(e) => SyncOutcome::TransportFailure(e.to_string()),
            SyncError::Store(e) => SyncOutcome::LocalFailure(e.to_string()),
            SyncError::Io(e) if is_cancellation(&e) => SyncOutcome::Cancelled,
            SyncError::Io(e) if e.kind() == std::io::ErrorKind::OutOfMemory => {
                SyncOutcome::ResourceExhausted(e.to_string())
            }
            SyncError::Io(e) => SyncOutcome::LocalFailure(e.to_string()),
            SyncError::Cancelled => SyncOutcome::Cancelled,
            SyncError::ResourceExhausted(message) => SyncOutcome::ResourceExhausted(message),
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::Success => f.write_str("success"),
            SyncOutcome::NoChanges => f.write_str("no changes"),
            SyncOutcome::FullSyncRequired => f.write_str("full sync required"),
            SyncOutcome::BadAuth => f.write_str("bad authentication"),
            SyncOutcome::ClockOff { delta_secs } => write!(f, "clock off by {delta_secs}s"),
            SyncOutcome::SanityCheckFailed(details) => write!(f, "sanity check failed: {details}"),
            SyncOutcome::ServerError { code, reason } => write!(f, "server error {code}: {reason}"),
            SyncOutcome::ServerAbort(message) => write!(f, "server aborted: {message}"),
            SyncOutcome::TransportFailure(message) => write!(f, "transport failure: {message}"),
            SyncOutcome::ResourceExhausted(message) => write!(f, "resource exhausted: {message}"),
            SyncOutcome::Cancelled => f.write_str("cancelled"),
            SyncOutcome::LocalFailure(message) => write!(f, "local failure: {message}"),
        }
    }
}
