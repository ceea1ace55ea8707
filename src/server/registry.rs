//! Tool handler contract and the name-keyed tool registry.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::protocol::{Progress, Tool};

/// Boxed future returned by [`ToolHandler::call`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<Value, ToolError>> + Send + 'a>>;

/// Opaque tool implementation.
///
/// Handlers receive validated arguments and a [`ToolContext`]; they should
/// observe `ctx.cancel` at their own suspension points. Any async closure of
/// the right shape implements this trait.
pub trait ToolHandler: Send + Sync {
    /// Execute the tool.
    fn call(&self, arguments: Map<String, Value>, ctx: ToolContext) -> HandlerFuture<'_>;
}

impl<F, Fut> ToolHandler for F
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, ToolError>> + Send + 'static,
{
    fn call(&self, arguments: Map<String, Value>, ctx: ToolContext) -> HandlerFuture<'_> {
        Box::pin(self(arguments, ctx))
    }
}

/// Failure reported by a tool handler.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolError {
    /// Human-readable failure description.
    pub message: String,
    /// Whether the failure is connection-like and worth retrying.
    pub transient: bool,
    /// Optional structured payload forwarded as error `data`.
    pub data: Option<Value>,
}

impl ToolError {
    /// Permanent execution failure, surfaced as `TOOL_EXECUTION_ERROR`.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
            data: None,
        }
    }

    /// Transient failure, surfaced as `TRANSPORT_ERROR` so the router retries.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
            data: None,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl Display for ToolError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ToolError {}

/// Per-invocation context handed to a handler.
#[derive(Debug, Clone)]
pub struct ToolContext {
    /// Id of the request being served.
    pub request_id: String,
    /// Fires when the caller cancels or the deadline passes.
    pub cancel: CancellationToken,
    /// Sink for partial progress; `None` when the caller is not streaming.
    pub progress: Option<mpsc::Sender<Progress>>,
    /// Free-form correlation fields (user id, group, ...).
    pub metadata: Map<String, Value>,
}

impl ToolContext {
    /// Context with a fresh cancellation token and no progress sink.
    #[must_use]
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            cancel: CancellationToken::new(),
            progress: None,
            metadata: Map::new(),
        }
    }

    /// Use `cancel` as the invocation's cancellation token.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Attach a progress sink.
    #[must_use]
    pub fn with_progress(mut self, progress: mpsc::Sender<Progress>) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Whether the invocation has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Emit a progress event. Dropped silently when nobody is listening.
    pub async fn report(&self, progress: Progress) {
        if let Some(tx) = &self.progress {
            if tx.send(progress).await.is_err() {
                debug!(request_id = %self.request_id, "progress receiver dropped");
            }
        }
    }
}

/// Registered tool: definition plus shared handler.
#[derive(Clone)]
pub struct RegisteredTool {
    /// Public definition.
    pub tool: Tool,
    /// Implementation.
    pub handler: Arc<dyn ToolHandler>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("tool", &self.tool.name)
            .finish_non_exhaustive()
    }
}

/// Name-keyed tool table for one logical server.
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `tool`, replacing any tool with the same name.
    ///
    /// Returns `true` when an existing registration was replaced.
    pub fn register(&mut self, tool: Tool, handler: Arc<dyn ToolHandler>) -> bool {
        let name = tool.name.clone();
        let replaced = self
            .tools
            .insert(name.clone(), RegisteredTool { tool, handler })
            .is_some();
        if replaced {
            warn!(tool = %name, "tool re-registered; previous definition replaced");
        }
        replaced
    }

    /// Remove `name`. Returns `true` when it was present.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Look up a tool by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RegisteredTool> {
        self.tools.get(name)
    }

    /// Snapshot of all definitions, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<Tool> {
        let mut tools: Vec<Tool> = self.tools.values().map(|r| r.tool.clone()).collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Number of registered tools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether no tools are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
