//! Error types for the mxlink transport

use std::time::Duration;

use mxlink_protocol::{FaultCode, ProtocolError, RemoteFault};
use thiserror::Error;

/// Error returned by transport operations
///
/// Cloneable so that one connect outcome can be handed to every caller
/// that waited on the same attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection left (or never reached) the CONNECTED state
    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// No response arrived before the caller's deadline
    #[error("Request timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// The caller cancelled its wait
    #[error("Request interrupted")]
    Interrupted,

    /// The server's authorization checker rejected the operation
    #[error("Permission denied: {reason}")]
    PermissionDenied { reason: String },

    /// Malformed or out-of-sequence message
    #[error("Protocol violation: {message}")]
    ProtocolViolation { message: String },

    /// Dial, interceptor or handshake failure during connect
    #[error("Handshake failed: {reason}")]
    HandshakeFailed { reason: String },

    /// Application-level error returned by the remote operation
    #[error("Remote error: {0}")]
    Remote(RemoteFault),

    /// Operation not valid in the current connection state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Payload could not be encoded or decoded
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// An outgoing frame exceeds the peer's frame limit; nothing was sent
    #[error("Frame too large: {size} bytes (peer limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// Underlying stream error
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl TransportError {
    /// Creates a `ConnectionClosed` error
    pub fn closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed {
            reason: reason.into(),
        }
    }

    /// Creates a `HandshakeFailed` error
    pub fn handshake(reason: impl Into<String>) -> Self {
        Self::HandshakeFailed {
            reason: reason.into(),
        }
    }

    /// Creates a `ProtocolViolation` error
    pub fn violation(message: impl Into<String>) -> Self {
        Self::ProtocolViolation {
            message: message.into(),
        }
    }

    /// Creates an `InvalidState` error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Returns a stable error code
    pub fn code(&self) -> &'static str {
        match self {
            Self::ConnectionClosed { .. } => "CONNECTION_CLOSED",
            Self::Timeout { .. } => "TIMEOUT",
            Self::Interrupted => "INTERRUPTED",
            Self::PermissionDenied { .. } => "PERMISSION_DENIED",
            Self::ProtocolViolation { .. } => "PROTOCOL_VIOLATION",
            Self::HandshakeFailed { .. } => "HANDSHAKE_FAILED",
            Self::Remote(fault) => fault.code.as_str(),
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::Codec { .. } => "CODEC_ERROR",
            Self::FrameTooLarge { .. } => "FRAME_TOO_LARGE",
            Self::Io { .. } => "IO_ERROR",
        }
    }

    /// Returns whether re-issuing the request (after re-dialing, for a
    /// closed connection) may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. } | Self::Timeout { .. })
    }

    /// Returns `true` for `ConnectionClosed`
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed { .. })
    }
}

impl From<RemoteFault> for TransportError {
    fn from(fault: RemoteFault) -> Self {
        match fault.code {
            FaultCode::PermissionDenied => Self::PermissionDenied {
                reason: fault.message,
            },
            _ => Self::Remote(fault),
        }
    }
}

impl From<ProtocolError> for TransportError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::Codec { message } => Self::Codec { message },
            ProtocolError::FrameTooLarge { size, limit } => Self::FrameTooLarge { size, limit },
            ProtocolError::Io(e) => Self::Io {
                message: e.to_string(),
            },
            other => Self::ProtocolViolation {
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        Self::Codec {
            message: err.to_string(),
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn permission_denied_fault_maps_to_dedicated_variant() {
        let err: TransportError = RemoteFault::permission_denied("invoke on test:name=R1").into();
        assert_eq!(
            err,
            TransportError::PermissionDenied {
                reason: "invoke on test:name=R1".into()
            }
        );
        assert_eq!(err.code(), "PERMISSION_DENIED");
        assert!(!err.is_retryable());
    }

    #[test]
    fn other_faults_stay_remote() {
        let err: TransportError = RemoteFault::not_found("test:name=R9").into();
        assert!(matches!(err, TransportError::Remote(_)));
        assert_eq!(err.code(), "NOT_FOUND");
    }

    #[test]
    fn retryable_errors() {
        assert!(TransportError::closed("peer went away").is_retryable());
        assert!(TransportError::Timeout {
            elapsed: Duration::from_millis(10)
        }
        .is_retryable());
        assert!(!TransportError::Interrupted.is_retryable());
        assert!(!TransportError::handshake("rejected").is_retryable());
    }

    #[test]
    fn oversized_frame_keeps_its_sizes() {
        let err: TransportError = ProtocolError::FrameTooLarge {
            size: 4105,
            limit: 1024,
        }
        .into();
        assert_eq!(
            err,
            TransportError::FrameTooLarge {
                size: 4105,
                limit: 1024
            }
        );
        assert_eq!(err.code(), "FRAME_TOO_LARGE");
        assert!(!err.is_retryable());
        assert!(!err.is_connection_closed());
    }
}
