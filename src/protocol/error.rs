//! Closed error-code taxonomy and the structured error payload.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Closed set of protocol error codes.
///
/// Serialized as the integer wire code so that peers can branch on the kind
/// of failure without parsing message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ErrorCode {
    /// Payload was not valid JSON.
    ParseError,
    /// Envelope is structurally invalid (missing id, duplicate live id).
    InvalidRequest,
    /// Unknown method or tool name.
    MethodNotFound,
    /// Params or tool arguments failed validation.
    InvalidParams,
    /// Unexpected failure inside the router or server.
    InternalError,
    /// Connection-level failure; the only transient code.
    TransportError,
    /// The call deadline elapsed before a response arrived.
    DeadlineExceeded,
    /// The call was cancelled by the caller.
    Cancelled,
    /// The target sidecar is not healthy.
    UpstreamUnavailable,
    /// The tool handler returned an error.
    ToolExecutionError,
}

impl ErrorCode {
    /// All codes, in wire-table order.
    pub const ALL: [Self; 10] = [
        Self::ParseError,
        Self::InvalidRequest,
        Self::MethodNotFound,
        Self::InvalidParams,
        Self::InternalError,
        Self::TransportError,
        Self::DeadlineExceeded,
        Self::UpstreamUnavailable,
        Self::ToolExecutionError,
        Self::Cancelled,
    ];

    /// Integer code used on the wire.
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::MethodNotFound => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::TransportError => -32000,
            Self::DeadlineExceeded => -32001,
            Self::UpstreamUnavailable => -32002,
            Self::ToolExecutionError => -32003,
            Self::Cancelled => -32800,
        }
    }

    /// Reverse lookup of [`ErrorCode::as_i32`].
    #[must_use]
    pub fn from_i32(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_i32() == code)
    }

    /// Stable upper-case name used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ParseError => "PARSE_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::InvalidParams => "INVALID_PARAMS",
            Self::InternalError => "INTERNAL_ERROR",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Cancelled => "CANCELLED",
            Self::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            Self::ToolExecutionError => "TOOL_EXECUTION_ERROR",
        }
    }

    /// Whether the router may retry a call that failed with this code.
    ///
    /// Only connection-level failures qualify. A failing tool is never
    /// considered transient.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::TransportError)
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<ErrorCode> for i32 {
    fn from(code: ErrorCode) -> Self {
        code.as_i32()
    }
}

impl TryFrom<i32> for ErrorCode {
    type Error = String;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Self::from_i32(value).ok_or_else(|| format!("unknown error code {value}"))
    }
}

/// Structured protocol error carried in a response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpError {
    /// Classified failure kind.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Optional structured detail (handler payload, offending field, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    /// Create an error with no structured payload.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// Shorthand for [`ErrorCode::ParseError`].
    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ParseError, message)
    }

    /// Shorthand for [`ErrorCode::InvalidRequest`].
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidRequest, message)
    }

    /// Shorthand for [`ErrorCode::MethodNotFound`].
    #[must_use]
    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::MethodNotFound, message)
    }

    /// Shorthand for [`ErrorCode::InvalidParams`].
    #[must_use]
    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, message)
    }

    /// Shorthand for [`ErrorCode::InternalError`].
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    /// Shorthand for [`ErrorCode::TransportError`].
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TransportError, message)
    }

    /// Shorthand for [`ErrorCode::DeadlineExceeded`].
    #[must_use]
    pub fn deadline_exceeded(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DeadlineExceeded, message)
    }

    /// Shorthand for [`ErrorCode::Cancelled`].
    #[must_use]
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, message)
    }

    /// Shorthand for [`ErrorCode::UpstreamUnavailable`].
    #[must_use]
    pub fn upstream_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::UpstreamUnavailable, message)
    }

    /// Shorthand for [`ErrorCode::ToolExecutionError`].
    #[must_use]
    pub fn tool_execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ToolExecutionError, message)
    }

    /// Whether the router may retry after this error.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

impl Display for McpError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for McpError {}
