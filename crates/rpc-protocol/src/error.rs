//! RPC error codes and the error value carried back to clients.

use std::panic::Location;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::envelope::ResponseEnvelope;

/// Response codes produced by the dispatch core itself.
///
/// Handlers may answer with any other integer through
/// [`RpcErrorCode::Custom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcErrorCode {
    /// Connecting IP is not in the allow-list.
    ConnectionNotPermitted,
    /// Missing or wrong request signature.
    SignatureFailed,
    /// Malformed payload, unknown class, unknown method.
    NotFound,
    /// Unexpected failure raised by a handler.
    Internal,
    /// Unexpected failure outside the handler (middleware, chain).
    Infrastructure,
    /// The access log could not be written.
    LoggingFailure,

    Custom(i64),
}

impl RpcErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            Self::ConnectionNotPermitted => 301,
            Self::SignatureFailed => 401,
            Self::NotFound => 404,
            Self::Internal => 500,
            Self::Infrastructure => 501,
            Self::LoggingFailure => 502,
            Self::Custom(c) => *c,
        }
    }
}

/// Debug detail attached to 500/501 responses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    #[serde(rename = "errMessage")]
    pub message: String,
    #[serde(rename = "errCode")]
    pub code: i64,
    #[serde(rename = "errFile")]
    pub file: String,
    #[serde(rename = "errLine")]
    pub line: u32,
}

impl ErrorDetail {
    /// Detail pointing at the caller's source location.
    #[track_caller]
    pub fn here(message: impl Into<String>) -> Self {
        let location = Location::caller();
        Self {
            message: message.into(),
            code: 0,
            file: location.file().to_string(),
            line: location.line(),
        }
    }

    pub fn at(message: impl Into<String>, file: impl Into<String>, line: u32) -> Self {
        Self {
            message: message.into(),
            code: 0,
            file: file.into(),
            line,
        }
    }
}

/// An error that is answered to the client as `{code, msg}`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("RPC error [{code}]: {msg}")]
pub struct RpcError {
    pub code: i64,
    pub msg: Value,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code: code.code(),
            msg: Value::String(msg.into()),
        }
    }

    pub fn connection_not_permitted() -> Self {
        Self::new(RpcErrorCode::ConnectionNotPermitted, "connection not permitted")
    }

    pub fn parameter_exception() -> Self {
        Self::new(RpcErrorCode::NotFound, "parameter exception")
    }

    pub fn class_not_found() -> Self {
        Self::new(RpcErrorCode::NotFound, "class not found")
    }

    pub fn method_not_found() -> Self {
        Self::new(RpcErrorCode::NotFound, "method not found")
    }

    pub fn signature_failed() -> Self {
        Self::new(RpcErrorCode::SignatureFailed, "signature verification failed")
    }

    /// A handler-raised error; code and message pass through untouched.
    pub fn business(code: i64, msg: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::Custom(code), msg)
    }

    pub fn internal(detail: ErrorDetail) -> Self {
        Self::with_detail(RpcErrorCode::Internal, detail)
    }

    pub fn infrastructure(detail: ErrorDetail) -> Self {
        Self::with_detail(RpcErrorCode::Infrastructure, detail)
    }

    pub fn logging_failure(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::LoggingFailure, message)
    }

    fn with_detail(code: RpcErrorCode, detail: ErrorDetail) -> Self {
        Self {
            code: code.code(),
            // ErrorDetail only holds strings and integers
            msg: serde_json::to_value(detail).unwrap_or(Value::Null),
        }
    }

    pub fn into_response(self) -> ResponseEnvelope {
        ResponseEnvelope {
            code: self.code,
            msg: self.msg,
        }
    }
}

impl From<RpcError> for ResponseEnvelope {
    fn from(err: RpcError) -> Self {
        err.into_response()
    }
}
