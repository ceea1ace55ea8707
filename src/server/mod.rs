//! Tool server: registry, argument validation, and request dispatch.
//!
//! A [`ToolServer`] is one logical MCP server. It can be reached in-process
//! (wrapped in [`Transport::InProcess`](crate::transport::Transport)) or
//! exported over stdio with [`stdio::serve_stdio`] when running as a
//! sidecar.

pub mod registry;
pub mod schema;
pub mod stdio;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::{
    create_error_response, Capability, ErrorCode, McpError, Method, Request, Resource,
    ResourceContents, Response, ServerInfo, Tool,
};

pub use registry::{HandlerFuture, ToolContext, ToolError, ToolHandler, ToolRegistry};

/// One logical MCP server.
pub struct ToolServer {
    info: ServerInfo,
    registry: RwLock<ToolRegistry>,
    resources: RwLock<BTreeMap<String, (Resource, ResourceContents)>>,
    running: Mutex<HashMap<String, CancellationToken>>,
}

impl std::fmt::Debug for ToolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolServer")
            .field("name", &self.info.name)
            .finish_non_exhaustive()
    }
}

impl ToolServer {
    /// Create a server advertising tools and cancellation.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        let info = ServerInfo::new(name, version)
            .with_capability(Capability::Tools)
            .with_capability(Capability::Cancellation)
            .with_capability(Capability::Streaming);
        Self {
            info,
            registry: RwLock::new(ToolRegistry::new()),
            resources: RwLock::new(BTreeMap::new()),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Server identity. Includes `resources` once a resource is registered.
    #[must_use]
    pub fn info(&self) -> ServerInfo {
        let mut info = self.info.clone();
        if !self.read_resources().is_empty() {
            info.capabilities.insert(Capability::Resources);
        }
        info
    }

    /// Register a tool, replacing any previous tool with the same name.
    pub fn register_tool(&self, tool: Tool, handler: impl ToolHandler + 'static) {
        self.register_shared(tool, Arc::new(handler));
    }

    /// Register a tool with an already-shared handler.
    pub fn register_shared(&self, tool: Tool, handler: Arc<dyn ToolHandler>) {
        let name = tool.name.clone();
        let replaced = self
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register(tool, handler);
        if !replaced {
            debug!(server = %self.info.name, tool = %name, "tool registered");
        }
    }

    /// Remove a tool. Returns `true` when it existed.
    pub fn unregister_tool(&self, name: &str) -> bool {
        self.registry
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .unregister(name)
    }

    /// Publish a static resource.
    pub fn register_resource(&self, resource: Resource, contents: ResourceContents) {
        self.resources
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(resource.uri.clone(), (resource, contents));
    }

    /// Sorted snapshot of tool definitions.
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .list()
    }

    /// Resource descriptors, sorted by URI.
    #[must_use]
    pub fn list_resources(&self) -> Vec<Resource> {
        self.read_resources().values().map(|(r, _)| r.clone()).collect()
    }

    /// Number of tool executions currently running.
    #[must_use]
    pub fn running_count(&self) -> usize {
        self.lock_running().len()
    }

    /// Serve one request.
    ///
    /// Never fails: every outcome, including handler errors and
    /// cancellation, is expressed as a [`Response`].
    pub async fn handle(&self, request: Request, ctx: ToolContext) -> Response {
        let id = request.id().to_owned();
        match request.method() {
            Method::Initialize => to_response(&id, &self.info()),
            Method::ToolsList => Response::success(id, json!({ "tools": self.list_tools() })),
            Method::ToolsCall => self.call_tool(&request, ctx).await,
            Method::ResourcesList => {
                Response::success(id, json!({ "resources": self.list_resources() }))
            }
            Method::ResourcesRead => self.read_resource(&request),
            Method::Cancel => {
                let target = request.cancel_target().unwrap_or_default();
                let cancelled = self.cancel(target);
                Response::success(id, json!({ "cancelled": cancelled }))
            }
        }
    }

    /// Cancel a running execution by request id.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.lock_running().remove(request_id) {
            Some(token) => {
                token.cancel();
                info!(server = %self.info.name, request_id, "tool execution cancelled");
                true
            }
            None => false,
        }
    }

    // ── Private helpers ──────────────────────────────────────────────────────

    async fn call_tool(&self, request: &Request, ctx: ToolContext) -> Response {
        let id = request.id();
        let name = request.tool_name().unwrap_or_default();

        let entry = self
            .registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned();
        let Some(entry) = entry else {
            return create_error_response(
                id,
                ErrorCode::MethodNotFound,
                format!("unknown tool: {name}"),
                Some(json!({ "tool": name })),
            );
        };

        let arguments = request.arguments().cloned().unwrap_or_default();
        if let Err(violation) = schema::validate_arguments(&entry.tool.parameter_schema, &arguments)
        {
            return create_error_response(
                id,
                ErrorCode::InvalidParams,
                format!("invalid arguments for {name}: {violation}"),
                Some(json!({ "path": violation.path, "tool": name })),
            );
        }

        let token = ctx.cancel.child_token();
        let _tracked = RunningGuard::insert(&self.running, id, token.clone());
        let ctx = ToolContext {
            cancel: token.clone(),
            ..ctx
        };

        tokio::select! {
            biased;

            () = token.cancelled() => {
                create_error_response(id, ErrorCode::Cancelled, "tool execution cancelled", None)
            }

            outcome = entry.handler.call(arguments, ctx) => match outcome {
                Ok(value) => Response::success(id, value),
                Err(err) => {
                    let code = if err.transient {
                        ErrorCode::TransportError
                    } else {
                        ErrorCode::ToolExecutionError
                    };
                    warn!(server = %self.info.name, tool = name, error = %err, %code, "tool failed");
                    create_error_response(id, code, err.message, err.data)
                }
            },
        }
    }

    fn read_resource(&self, request: &Request) -> Response {
        let id = request.id();
        let uri = request.resource_uri().unwrap_or_default();
        match self.read_resources().get(uri) {
            Some((_, contents)) => to_response(id, contents),
            None => create_error_response(
                id,
                ErrorCode::InvalidParams,
                format!("unknown resource: {uri}"),
                Some(json!({ "uri": uri })),
            ),
        }
    }

    fn read_resources(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, (Resource, ResourceContents)>> {
        self.resources.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_running(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes a running-execution entry when the call finishes or is dropped.
struct RunningGuard<'a> {
    table: &'a Mutex<HashMap<String, CancellationToken>>,
    id: String,
}

impl<'a> RunningGuard<'a> {
    fn insert(
        table: &'a Mutex<HashMap<String, CancellationToken>>,
        id: &str,
        token: CancellationToken,
    ) -> Self {
        table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), token);
        Self {
            table,
            id: id.to_owned(),
        }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.table
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}

fn to_response<T: serde::Serialize>(id: &str, value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(v) => Response::success(id, v),
        Err(err) => McpError::internal(format!("failed to encode result: {err}")).into_response(id),
    }
}
