//! Error taxonomy for the peer session layer.

use thiserror::Error;

/// Errors surfaced by handshakes, fetches and the per-peer read loop.
#[derive(Debug, Error)]
pub enum SyncError {
    /// No answer within the deadline. Recoverable; callers may retry.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Caller-initiated cancellation.
    #[error("request canceled")]
    Canceled,

    /// Remote claims a network we are not willing to represent.
    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    /// Malformed payload from the peer.
    #[error("decode error: {0}")]
    DecodeError(String),

    /// Frame exceeds the configured maximum size.
    #[error("message too large: {size} > {max}")]
    OversizeMessage { size: usize, max: usize },

    /// The peer's outbound queue is gone.
    #[error("request send failed: {0}")]
    RequestSendFailed(String),

    /// A message arrived that is not valid in the current state.
    #[error("unexpected message code {code:#04x}: {reason}")]
    UnexpectedMessage { code: u64, reason: String },

    #[error("peer disconnected")]
    Disconnected,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A downstream sink rejected a write. Never fatal to a session.
    #[error("sink {sink} failed: {reason}")]
    SinkFailure { sink: &'static str, reason: String },
}

impl SyncError {
    /// Whether the error must terminate the offending connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            SyncError::Timeout(_) | SyncError::Canceled | SyncError::SinkFailure { .. } => false,
            SyncError::HandshakeMismatch(_)
            | SyncError::DecodeError(_)
            | SyncError::OversizeMessage { .. }
            | SyncError::RequestSendFailed(_)
            | SyncError::UnexpectedMessage { .. }
            | SyncError::Disconnected
            | SyncError::Io(_) => true,
        }
    }
}

impl From<alloy_rlp::Error> for SyncError {
    fn from(e: alloy_rlp::Error) -> Self {
        SyncError::DecodeError(e.to_string())
    }
}

/// Failure reported by a downstream sink (store or broker).
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),

    #[error("write rejected: {0}")]
    Rejected(String),

    #[error("encode failed: {0}")]
    Encode(String),
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatality_follows_taxonomy() {
        assert!(!SyncError::Timeout(std::time::Duration::from_secs(1)).is_fatal());
        assert!(!SyncError::Canceled.is_fatal());
        assert!(!SyncError::SinkFailure { sink: "store", reason: "down".into() }.is_fatal());
        assert!(SyncError::HandshakeMismatch("net".into()).is_fatal());
        assert!(SyncError::OversizeMessage { size: 11, max: 10 }.is_fatal());
        assert!(SyncError::DecodeError("bad".into()).is_fatal());
    }
}
