//! Internal client used by agent code to invoke tools.
//!
//! [`InternalClient::call_tool`] never fails: every outcome, including a
//! malformed request, comes back as a [`ToolCallResult`] with `ok` set
//! accordingly.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::middleware::enrich;
use crate::protocol::{McpError, Request, Response, ResponseBody, Tool};
use crate::router::{CallOptions, Router};
use crate::transport::CallStream;

/// Per-call settings and correlation fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallContext {
    /// Request id; a UUID v4 is generated when absent.
    pub request_id: Option<String>,
    /// Deadline override.
    pub timeout: Option<Duration>,
    /// Retry budget override.
    pub max_retries: Option<u32>,
    /// Caller identity, logged with the call.
    pub user_id: Option<String>,
    /// Caller group, logged with the call.
    pub user_group: Option<String>,
}

impl CallContext {
    /// Context with an explicit request id.
    #[must_use]
    pub fn with_request_id(id: impl Into<String>) -> Self {
        Self {
            request_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Same context with a deadline override.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Same context with a retry budget override.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    const fn options(&self) -> CallOptions {
        CallOptions {
            timeout: self.timeout,
            max_retries: self.max_retries,
        }
    }
}

/// Uniform result of a tool call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCallResult {
    /// Whether the tool produced a result.
    pub ok: bool,
    /// Tool output when `ok`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure when not `ok`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
    /// Correlation id of the call.
    pub request_id: String,
    /// Retries performed by the router.
    pub retries: u32,
}

impl ToolCallResult {
    fn from_response(response: Response, retries: u32) -> Self {
        let request_id = response.id().to_owned();
        match response.body() {
            ResponseBody::Result(value) => Self {
                ok: true,
                result: Some(value.clone()),
                error: None,
                request_id,
                retries,
            },
            ResponseBody::Error(err) => Self::failed(request_id, err.clone(), retries),
        }
    }

    fn failed(request_id: String, err: McpError, retries: u32) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(enrich(err)),
            request_id,
            retries,
        }
    }
}

/// Façade over the [`Router`] for in-process callers.
#[derive(Debug, Clone)]
pub struct InternalClient {
    router: Arc<Router>,
}

impl InternalClient {
    /// Client routing through `router`.
    #[must_use]
    pub const fn new(router: Arc<Router>) -> Self {
        Self { router }
    }

    /// The underlying router.
    #[must_use]
    pub const fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Invoke `name` with `arguments`.
    pub async fn call_tool(&self, name: &str, arguments: Value, ctx: CallContext) -> ToolCallResult {
        let request_id = ctx
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let request = match build_request(name, arguments, &request_id) {
            Ok(request) => request,
            Err(err) => return ToolCallResult::failed(request_id, err, 0),
        };

        let span = info_span!(
            "tool_call",
            request_id = %request_id,
            tool = name,
            user_id = ctx.user_id.as_deref().unwrap_or("-"),
            user_group = ctx.user_group.as_deref().unwrap_or("-"),
        );
        let outcome = self
            .router
            .call(request, ctx.options())
            .instrument(span)
            .await;
        ToolCallResult::from_response(outcome.response, outcome.retries)
    }

    /// Invoke `name` and stream its progress events.
    ///
    /// A malformed request yields a stream with a single error event.
    #[must_use]
    pub fn call_tool_streaming(&self, name: &str, arguments: Value, ctx: &CallContext) -> CallStream {
        let request_id = ctx
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        match build_request(name, arguments, &request_id) {
            Ok(request) => self.router.open_stream(request, ctx.options()),
            Err(err) => CallStream::ready(enrich(err).into_response(request_id)),
        }
    }

    /// Cancel a live call.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.router.cancel(request_id)
    }

    /// Every routable tool.
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        self.router.list_tools()
    }
}

fn build_request(name: &str, arguments: Value, request_id: &str) -> Result<Request, McpError> {
    Request::tools_call(name, arguments)?.with_id(request_id)
}
