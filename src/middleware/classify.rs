//! Mapping from crate errors to protocol error codes, plus user-facing hints.

use serde_json::Value;

use crate::protocol::{ErrorCode, McpError};
use crate::AppError;

/// Protocol code for a crate-level error.
#[must_use]
pub fn classify(err: &AppError) -> ErrorCode {
    match err {
        AppError::Protocol(msg) if msg.starts_with("invalid json") => ErrorCode::ParseError,
        AppError::Protocol(_) => ErrorCode::InvalidRequest,
        AppError::Transport(_) | AppError::Io(_) => ErrorCode::TransportError,
        AppError::Tool(_) => ErrorCode::ToolExecutionError,
        AppError::Sidecar(_) => ErrorCode::UpstreamUnavailable,
        AppError::NotFound(_) => ErrorCode::MethodNotFound,
        AppError::Config(_) => ErrorCode::InternalError,
    }
}

/// Suggested next step for someone reading the error.
#[must_use]
pub const fn suggestion(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::ParseError => "Check the input format and try again.",
        ErrorCode::InvalidRequest => "Verify the request structure and id.",
        ErrorCode::MethodNotFound => "The requested tool or operation is not available.",
        ErrorCode::InvalidParams => "Check the parameters against the tool schema.",
        ErrorCode::InternalError => "An unexpected error occurred. Try again or contact support.",
        ErrorCode::TransportError => "The tool server could not be reached. Try again shortly.",
        ErrorCode::DeadlineExceeded => "The operation took too long. Try a narrower request.",
        ErrorCode::UpstreamUnavailable => "The tool server is unhealthy. Try again later.",
        ErrorCode::ToolExecutionError => {
            "The tool reported an error. Check the input or try a different approach."
        }
        ErrorCode::Cancelled => "The operation was cancelled.",
    }
}

/// Structured `data` payload: retryability and a suggestion, merged with
/// any existing object payload.
#[must_use]
pub fn enrich_data(code: ErrorCode, data: Option<Value>) -> Value {
    let mut merged = match data {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("detail".into(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    merged
        .entry("retryable")
        .or_insert_with(|| Value::Bool(code.is_transient()));
    merged
        .entry("suggestion")
        .or_insert_with(|| Value::String(suggestion(code).to_owned()));
    Value::Object(merged)
}

/// Convert a crate error into a protocol error with enriched `data`.
#[must_use]
pub fn to_mcp_error(err: &AppError) -> McpError {
    let code = classify(err);
    McpError::new(code, err.to_string()).with_data(enrich_data(code, None))
}

/// Render an error for an end user: message, suggestion, retry hint.
#[must_use]
pub fn format_for_user(err: &McpError) -> String {
    let mut out = format!("Error: {}", err.message);
    let data = err.data.as_ref();
    let hint = data
        .and_then(|d| d.get("suggestion"))
        .and_then(Value::as_str)
        .unwrap_or_else(|| suggestion(err.code));
    out.push_str("\nSuggestion: ");
    out.push_str(hint);
    let retryable = data
        .and_then(|d| d.get("retryable"))
        .and_then(Value::as_bool)
        .unwrap_or_else(|| err.is_transient());
    if retryable {
        out.push_str("\nThis error may be temporary. Please try again.");
    }
    out
}

/// Merge retry and suggestion hints into an error's `data`.
#[must_use]
pub fn enrich(err: McpError) -> McpError {
    let data = enrich_data(err.code, err.data);
    McpError {
        data: Some(data),
        ..err
    }
}
