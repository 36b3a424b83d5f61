//! Response payloads and remote faults.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Machine-readable fault codes carried in error responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FaultCode {
    PermissionDenied,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    OperationFailed,
    Unsupported,
    Internal,
}

impl FaultCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::NotFound => "NOT_FOUND",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::OperationFailed => "OPERATION_FAILED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Internal => "INTERNAL",
        }
    }
}

/// Per-operation error returned by the server in place of a result.
///
/// Faults never tear down the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFault {
    pub code: FaultCode,
    pub message: String,
}

impl RemoteFault {
    pub fn new(code: FaultCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(FaultCode::PermissionDenied, message)
    }

    pub fn not_found(what: impl fmt::Display) -> Self {
        Self::new(FaultCode::NotFound, format!("not found: {}", what))
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(FaultCode::InvalidArgument, message)
    }

    pub fn operation_failed(message: impl Into<String>) -> Self {
        Self::new(FaultCode::OperationFailed, message)
    }
}

impl fmt::Display for RemoteFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for RemoteFault {}

/// Body of a response frame.
///
/// `Failure` is listed first: a missing `result` field would otherwise
/// deserialize as `null` and swallow the error variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseBody {
    Failure { error: RemoteFault },
    Success { result: Value },
}

impl ResponseBody {
    pub fn ok(result: Value) -> Self {
        Self::Success { result }
    }

    pub fn fault(error: RemoteFault) -> Self {
        Self::Failure { error }
    }

    pub fn into_result(self) -> Result<Value, RemoteFault> {
        match self {
            Self::Success { result } => Ok(result),
            Self::Failure { error } => Err(error),
        }
    }
}

impl From<Result<Value, RemoteFault>> for ResponseBody {
    fn from(outcome: Result<Value, RemoteFault>) -> Self {
        match outcome {
            Ok(result) => Self::ok(result),
            Err(error) => Self::fault(error),
        }
    }
}
