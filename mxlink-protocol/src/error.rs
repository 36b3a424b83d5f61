//! Error types for framing, codec and name parsing

use thiserror::Error;

/// Error raised while reading, writing or decoding wire data
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame length exceeds the configured maximum
    #[error("Frame too large: {size} bytes (limit {limit})")]
    FrameTooLarge { size: usize, limit: usize },

    /// Frame header carries an unknown kind byte
    #[error("Unknown frame kind: {kind:#04x}")]
    UnknownFrameKind { kind: u8 },

    /// Frame shorter than its fixed header
    #[error("Truncated frame: {length} bytes")]
    Truncated { length: usize },

    /// The peer did not send the expected channel token
    #[error("Bad channel token: {found:#010x}")]
    BadChannelToken { found: u32 },

    /// Payload could not be encoded or decoded
    #[error("Codec error: {message}")]
    Codec { message: String },

    /// Invalid resource name or pattern
    #[error("Invalid resource name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Underlying stream error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub(crate) fn invalid_name(name: &str, reason: &str) -> Self {
        Self::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Creates a codec error
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Returns `true` if the error means the peer closed the stream cleanly
    /// between two frames.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::codec(err.to_string())
    }
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
