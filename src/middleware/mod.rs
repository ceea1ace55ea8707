//! Cross-cutting concerns around calls: error classification, transition
//! logging, metrics, and HTTP request-id propagation.

pub mod classify;
pub mod metrics;
pub mod request_id;

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::protocol::ErrorCode;
use crate::router::CallState;

pub use classify::{classify, enrich, format_for_user, suggestion, to_mcp_error};
pub use metrics::{CallMetrics, MetricsSnapshot, ToolStats, UNKNOWN_TARGET};
pub use request_id::{propagate_request_id, RequestId, REQUEST_ID_HEADER};

/// Log a non-terminal state transition.
pub fn log_transition(request_id: &str, tool: &str, from: CallState, to: CallState) {
    debug!(
        request_id,
        tool,
        from = from.as_str(),
        to = to.as_str(),
        "call transition"
    );
}

/// Log a call's terminal state with its outcome.
pub fn log_outcome(
    request_id: &str,
    tool: &str,
    state: CallState,
    code: Option<ErrorCode>,
    retries: u32,
    elapsed: Duration,
) {
    let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
    match code {
        None => info!(
            request_id,
            tool,
            outcome = state.as_str(),
            retries,
            elapsed_ms,
            "call finished"
        ),
        Some(code) => warn!(
            request_id,
            tool,
            outcome = state.as_str(),
            error_code = code.as_str(),
            retries,
            elapsed_ms,
            "call failed"
        ),
    }
}
