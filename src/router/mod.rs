//! Tool-call router.
//!
//! The [`Router`] keeps a registry of servers reachable over a
//! [`Transport`], resolves each `tools/call` or `resources/read` to the
//! server that owns the name, and drives the call through
//! `CREATED → DISPATCHED → IN_FLIGHT → terminal` while enforcing the
//! deadline, the retry budget, caller cancellation, and the sidecar health
//! gate.

pub mod pending;
pub mod retry;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::config::{GlobalConfig, RouterConfig};
use crate::middleware::{
    enrich, log_outcome, log_transition, CallMetrics, MetricsSnapshot, UNKNOWN_TARGET,
};
use crate::protocol::{
    Capability, ClientInfo, ErrorCode, McpError, Method, Request, Resource, ResourceContents,
    Response, ResponseBody, ServerInfo, Tool,
};
use crate::sidecar::SidecarStatus;
use crate::transport::{CallStream, StreamEvent, Transport, TransportKind, STREAM_CAPACITY};

pub use pending::{CallState, PendingCall, PendingGuard, PendingSnapshot, PendingTable};
pub use retry::RetryPolicy;

// ── Registrations ────────────────────────────────────────────────────

/// Options for [`Router::register_server`].
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    /// Higher wins when two servers expose the same tool name.
    pub priority: i32,
    /// Health feed of a supervised sidecar; `None` means always available.
    pub health: Option<watch::Receiver<SidecarStatus>>,
}

/// One server known to the router.
#[derive(Debug)]
pub struct ServerRegistration {
    /// Registration name.
    pub name: String,
    /// How the server is reached.
    pub transport: Arc<Transport>,
    /// Info returned by `initialize`.
    pub info: ServerInfo,
    /// Tools discovered at registration.
    pub tools: Vec<Tool>,
    /// Resources discovered at registration.
    pub resources: Vec<Resource>,
    /// Resolution priority.
    pub priority: i32,
    health: Option<watch::Receiver<SidecarStatus>>,
    seq: u64,
}

impl ServerRegistration {
    /// Current sidecar status, if supervised.
    #[must_use]
    pub fn status(&self) -> Option<SidecarStatus> {
        self.health.as_ref().map(|rx| *rx.borrow())
    }

    /// Whether calls may be dispatched right now.
    #[must_use]
    pub fn is_available(&self) -> bool {
        !self.transport.is_closed()
            && !matches!(self.status(), Some(status) if status != SidecarStatus::Healthy)
    }

    fn exposes_tool(&self, name: &str) -> bool {
        self.tools.iter().any(|t| t.name == name)
    }

    fn exposes_resource(&self, uri: &str) -> bool {
        self.resources.iter().any(|r| r.uri == uri)
    }
}

/// Serializable view of a [`ServerRegistration`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerSummary {
    /// Registration name.
    pub name: String,
    /// Transport variant.
    pub transport: TransportKind,
    /// Resolution priority.
    pub priority: i32,
    /// Sidecar status, if supervised.
    pub status: Option<SidecarStatus>,
    /// Whether calls may be dispatched.
    pub available: bool,
    /// Advertised capabilities.
    pub capabilities: Vec<Capability>,
    /// Exposed tool names.
    pub tools: Vec<String>,
}

impl From<&ServerRegistration> for ServerSummary {
    fn from(reg: &ServerRegistration) -> Self {
        Self {
            name: reg.name.clone(),
            transport: reg.transport.kind(),
            priority: reg.priority,
            status: reg.status(),
            available: reg.is_available(),
            capabilities: reg.info.capabilities.iter().copied().collect(),
            tools: reg.tools.iter().map(|t| t.name.clone()).collect(),
        }
    }
}

/// Body of `GET /mcp/health`.
#[derive(Debug, Clone, Serialize)]
pub struct RouterHealth {
    /// `ok` when every server is available, otherwise `degraded`.
    pub status: &'static str,
    /// Router name.
    pub name: String,
    /// Router version.
    pub version: String,
    /// Seconds since the router was built.
    pub uptime_seconds: i64,
    /// Registered servers.
    pub servers: Vec<ServerSummary>,
    /// Calls currently in the pending table.
    pub pending_calls: usize,
    /// Call counters.
    pub metrics: MetricsSnapshot,
}

// ── Calls ────────────────────────────────────────────────────────────

/// Per-call overrides.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Deadline; defaults to the configured one, clamped to the maximum.
    pub timeout: Option<Duration>,
    /// Retry budget; defaults to the configured one.
    pub max_retries: Option<u32>,
}

/// Result of [`Router::call`].
#[derive(Debug, Clone, PartialEq)]
pub struct CallOutcome {
    /// Final envelope, keyed by the request id.
    pub response: Response,
    /// Terminal state.
    pub state: CallState,
    /// Retries performed.
    pub retries: u32,
    /// Wall time from acceptance to terminal state.
    pub elapsed: Duration,
}

/// Bookkeeping for one accepted call; consumed by [`CallRun::finish`].
struct CallRun<'a> {
    metrics: &'a CallMetrics,
    guard: PendingGuard,
    target: String,
    /// Metrics key: `target` once it resolves, [`UNKNOWN_TARGET`] otherwise.
    label: String,
    state: CallState,
    retries: u32,
    started: Instant,
}

impl CallRun<'_> {
    fn id(&self) -> &str {
        self.guard.id()
    }

    fn token(&self) -> &CancellationToken {
        self.guard.token()
    }

    fn advance(&mut self, to: CallState) {
        log_transition(self.guard.id(), &self.target, self.state, to);
        self.guard.set_state(to);
        self.state = to;
    }

    fn record_retry(&mut self) {
        self.retries += 1;
        self.guard.record_retry();
        self.metrics.record_retry(&self.label);
    }

    fn fail(self, state: CallState, err: McpError) -> CallOutcome {
        let response = err.into_response(self.id());
        self.finish(state, response)
    }

    fn finish(mut self, state: CallState, response: Response) -> CallOutcome {
        let response = enrich_response(response);
        let code = response.error_code();
        let elapsed = self.started.elapsed();
        self.advance(state);
        self.metrics.record_finish(&self.label, state, code, elapsed);
        log_outcome(self.guard.id(), &self.target, state, code, self.retries, elapsed);
        CallOutcome {
            response,
            state,
            retries: self.retries,
            elapsed,
        }
    }
}

/// A call that passed admission: target resolved, permit held.
struct Admitted<'a> {
    run: CallRun<'a>,
    target: Arc<ServerRegistration>,
    deadline: Instant,
    policy: RetryPolicy,
    _permit: OwnedSemaphorePermit,
}

// ── Router ───────────────────────────────────────────────────────────

/// Transport-agnostic request router.
#[derive(Debug)]
pub struct Router {
    info: ServerInfo,
    default_timeout: Duration,
    max_timeout: Duration,
    retry: RetryPolicy,
    servers: RwLock<HashMap<String, Arc<ServerRegistration>>>,
    pending: Arc<PendingTable>,
    metrics: CallMetrics,
    permits: Arc<Semaphore>,
    seq: AtomicU64,
    shutdown: CancellationToken,
    started_at: DateTime<Utc>,
}

impl Router {
    /// Build a router that identifies itself with `name`/`version`.
    #[must_use]
    pub fn new(name: &str, version: &str, config: &RouterConfig) -> Self {
        let info = ServerInfo::new(name, version)
            .with_capability(Capability::Tools)
            .with_capability(Capability::Resources)
            .with_capability(Capability::Streaming)
            .with_capability(Capability::Cancellation)
            .with_capability(Capability::Logging);
        Self {
            info,
            default_timeout: config.default_timeout(),
            max_timeout: config.max_timeout().max(config.default_timeout()),
            retry: RetryPolicy::from_config(&config.retry),
            servers: RwLock::new(HashMap::new()),
            pending: Arc::new(PendingTable::new()),
            metrics: CallMetrics::new(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_calls.max(1))),
            seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            started_at: Utc::now(),
        }
    }

    /// Build from the global configuration.
    #[must_use]
    pub fn from_config(config: &GlobalConfig) -> Self {
        Self::new(&config.server.name, &config.server.version, &config.router)
    }

    /// The router's own server info.
    #[must_use]
    pub const fn info(&self) -> &ServerInfo {
        &self.info
    }

    // ── Registry ─────────────────────────────────────────────────────

    /// Initialize a server, discover its tools and resources, and make
    /// them routable. Replaces any registration with the same name.
    ///
    /// # Errors
    ///
    /// Returns the discovery failure; nothing is registered in that case.
    pub async fn register_server(
        &self,
        name: &str,
        transport: Arc<Transport>,
        opts: RegisterOptions,
    ) -> Result<ServerInfo, McpError> {
        let bound = self.default_timeout;
        let info = bounded(bound, "initialize", transport.initialize(&ClientInfo::router())).await?;
        let tools: Vec<Tool> = if info.supports(Capability::Tools) {
            fetch_list(&transport, Request::tools_list(), "tools", bound).await?
        } else {
            Vec::new()
        };
        let resources: Vec<Resource> = if info.supports(Capability::Resources) {
            fetch_list(&transport, Request::resources_list(), "resources", bound).await?
        } else {
            Vec::new()
        };

        let registration = ServerRegistration {
            name: name.to_owned(),
            transport,
            info: info.clone(),
            tools,
            resources,
            priority: opts.priority,
            health: opts.health,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        info!(
            server = name,
            transport = %registration.transport.kind(),
            tools = registration.tools.len(),
            resources = registration.resources.len(),
            priority = registration.priority,
            "server registered"
        );
        let replaced = self
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_owned(), Arc::new(registration));
        if replaced.is_some() {
            info!(server = name, "previous registration replaced");
        }
        Ok(info)
    }

    /// Remove a server. Calls already dispatched to it run to completion.
    pub fn unregister_server(&self, name: &str) -> bool {
        let removed = self
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some();
        if removed {
            info!(server = name, "server unregistered");
        }
        removed
    }

    /// Registration by name.
    #[must_use]
    pub fn server(&self, name: &str) -> Option<Arc<ServerRegistration>> {
        self.read_servers().get(name).cloned()
    }

    /// Summaries of every registration, sorted by name.
    #[must_use]
    pub fn servers(&self) -> Vec<ServerSummary> {
        let mut out: Vec<ServerSummary> = self
            .read_servers()
            .values()
            .map(|reg| ServerSummary::from(reg.as_ref()))
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Every routable tool, one per name, sorted by name.
    ///
    /// When several servers expose a name the entry of the server that
    /// would serve the call is returned.
    #[must_use]
    pub fn list_tools(&self) -> Vec<Tool> {
        let mut seen = HashSet::new();
        let mut tools: Vec<Tool> = self
            .ranked_servers()
            .iter()
            .flat_map(|reg| reg.tools.iter())
            .filter(|tool| seen.insert(tool.name.clone()))
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Every routable resource, one per URI, sorted by URI.
    #[must_use]
    pub fn list_resources(&self) -> Vec<Resource> {
        let mut seen = HashSet::new();
        let mut resources: Vec<Resource> = self
            .ranked_servers()
            .iter()
            .flat_map(|reg| reg.resources.iter())
            .filter(|res| seen.insert(res.uri.clone()))
            .cloned()
            .collect();
        resources.sort_by(|a, b| a.uri.cmp(&b.uri));
        resources
    }

    /// Name of the server that would serve `tool`.
    #[must_use]
    pub fn find_tool(&self, tool: &str) -> Option<String> {
        self.pick(|reg| reg.exposes_tool(tool))
            .map(|reg| reg.name.clone())
    }

    /// Fetch one resource through its owning server.
    ///
    /// # Errors
    ///
    /// Returns the routed call's error, or `TRANSPORT_ERROR` when the
    /// server's reply is not resource contents.
    pub async fn read_resource(&self, uri: &str) -> Result<ResourceContents, McpError> {
        let request = Request::resources_read(uri)?;
        let value = self
            .call(request, CallOptions::default())
            .await
            .response
            .into_result()?;
        serde_json::from_value(value)
            .map_err(|err| McpError::transport(format!("malformed resource contents: {err}")))
    }

    // ── Dispatch ─────────────────────────────────────────────────────

    /// Serve any request on behalf of the router's own surface.
    pub async fn handle(&self, request: Request) -> Response {
        let id = request.id().to_owned();
        match request.method() {
            Method::Initialize => to_success(&id, &self.info),
            Method::ToolsList => Response::success(id, json!({ "tools": self.list_tools() })),
            Method::ResourcesList => {
                Response::success(id, json!({ "resources": self.list_resources() }))
            }
            Method::ToolsCall | Method::ResourcesRead => {
                self.call(request, CallOptions::default()).await.response
            }
            Method::Cancel => {
                let target = request.cancel_target().unwrap_or_default();
                let cancelled = self.cancel(target);
                Response::success(id, json!({ "cancelled": cancelled, "request_id": target }))
            }
        }
    }

    /// Route a `tools/call` or `resources/read` request to its server.
    ///
    /// The pending entry is released when this future completes or is
    /// dropped.
    pub async fn call(&self, request: Request, opts: CallOptions) -> CallOutcome {
        let target = call_target(&request);
        let span = info_span!("call", request_id = %request.id(), tool = %target);
        self.run_call(request, target, opts).instrument(span).await
    }

    /// Route a call and stream its progress events.
    ///
    /// Exactly one [`StreamEvent::Final`] is yielded. Dropping the stream
    /// abandons the call.
    #[must_use]
    pub fn open_stream(self: &Arc<Self>, request: Request, opts: CallOptions) -> CallStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let router = Arc::clone(self);
        let target = call_target(&request);
        let span = info_span!("stream", request_id = %request.id(), tool = %target);
        tokio::spawn(
            async move {
                let outcome = router.run_stream(request, target, opts, &tx).await;
                let _ = tx.send(StreamEvent::Final(outcome.response)).await;
            }
            .instrument(span),
        );
        CallStream::new(rx)
    }

    /// Cancel a live call. Returns `false` when `id` is not live.
    pub fn cancel(&self, id: &str) -> bool {
        let cancelled = self.pending.cancel(id);
        if cancelled {
            info!(request_id = id, "call cancelled");
        }
        cancelled
    }

    /// Number of live calls.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of one live call.
    #[must_use]
    pub fn pending(&self, id: &str) -> Option<PendingSnapshot> {
        self.pending.get(id)
    }

    /// Snapshots of every live call.
    #[must_use]
    pub fn pending_calls(&self) -> Vec<PendingSnapshot> {
        self.pending.list()
    }

    /// Call counters.
    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Health summary for `GET /mcp/health`.
    #[must_use]
    pub fn health(&self) -> RouterHealth {
        let servers = self.servers();
        let status = if servers.iter().all(|s| s.available) {
            "ok"
        } else {
            "degraded"
        };
        RouterHealth {
            status,
            name: self.info.name.clone(),
            version: self.info.version.clone(),
            uptime_seconds: (Utc::now() - self.started_at).num_seconds(),
            servers,
            pending_calls: self.pending.len(),
            metrics: self.metrics.snapshot(),
        }
    }

    /// Cancel every live call, refuse new ones, and close every transport.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.pending.cancel_all();
        self.permits.close();
        let drained: Vec<Arc<ServerRegistration>> = self
            .servers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, reg)| reg)
            .collect();
        for reg in drained {
            reg.transport.close().await;
        }
        info!("router closed");
    }

    // ── Internals ────────────────────────────────────────────────────

    fn read_servers(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<ServerRegistration>>> {
        self.servers.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registrations in resolution order: priority descending, then
    /// registration order.
    fn ranked_servers(&self) -> Vec<Arc<ServerRegistration>> {
        let mut ranked: Vec<Arc<ServerRegistration>> =
            self.read_servers().values().cloned().collect();
        ranked.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));
        ranked
    }

    /// Best available match, or the best unavailable one so the caller
    /// gets `UPSTREAM_UNAVAILABLE` rather than `METHOD_NOT_FOUND`.
    fn pick(&self, matches: impl Fn(&ServerRegistration) -> bool) -> Option<Arc<ServerRegistration>> {
        let candidates: Vec<Arc<ServerRegistration>> = self
            .ranked_servers()
            .into_iter()
            .filter(|reg| matches(reg))
            .collect();
        candidates
            .iter()
            .find(|reg| reg.is_available())
            .or_else(|| candidates.first())
            .cloned()
    }

    fn resolve(&self, request: &Request) -> Result<Arc<ServerRegistration>, McpError> {
        match request.method() {
            Method::ToolsCall => {
                let name = request.tool_name().unwrap_or_default();
                self.pick(|reg| reg.exposes_tool(name)).ok_or_else(|| {
                    McpError::method_not_found(format!("unknown tool: {name}"))
                        .with_data(json!({ "tool": name }))
                })
            }
            Method::ResourcesRead => {
                let uri = request.resource_uri().unwrap_or_default();
                self.pick(|reg| reg.exposes_resource(uri)).ok_or_else(|| {
                    McpError::invalid_params(format!("unknown resource: {uri}"))
                        .with_data(json!({ "uri": uri }))
                })
            }
            other => Err(McpError::invalid_request(format!(
                "{other} is not a routable call"
            ))),
        }
    }

    fn metric_label(&self, request: &Request, target: &str) -> String {
        if self.resolve(request).is_ok() {
            target.to_owned()
        } else {
            UNKNOWN_TARGET.to_owned()
        }
    }

    fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested.unwrap_or(self.default_timeout).min(self.max_timeout)
    }

    /// Insert the pending entry, resolve the target, and take a permit.
    #[allow(clippy::result_large_err)] // The error arm is the finished call.
    async fn admit(
        &self,
        request: &Request,
        target: String,
        opts: CallOptions,
    ) -> Result<Admitted<'_>, CallOutcome> {
        let started = Instant::now();
        let timeout = self.effective_timeout(opts.timeout);
        let deadline = started + timeout;
        let id = request.id();

        let label = self.metric_label(request, &target);
        self.metrics.record_start(&label);
        let guard = match self
            .pending
            .insert(id, &target, deadline, self.shutdown.child_token())
        {
            Ok(guard) => guard,
            Err(err) => {
                let response = enrich_response(err.into_response(id));
                let code = response.error_code();
                let elapsed = started.elapsed();
                self.metrics
                    .record_finish(&label, CallState::Errored, code, elapsed);
                log_outcome(id, &target, CallState::Errored, code, 0, elapsed);
                return Err(CallOutcome {
                    response,
                    state: CallState::Errored,
                    retries: 0,
                    elapsed,
                });
            }
        };
        let run = CallRun {
            metrics: &self.metrics,
            guard,
            target,
            label,
            state: CallState::Created,
            retries: 0,
            started,
        };

        if timeout.is_zero() {
            return Err(run.fail(
                CallState::TimedOut,
                McpError::deadline_exceeded("deadline elapsed before dispatch"),
            ));
        }
        let server = match self.resolve(request) {
            Ok(server) => server,
            Err(err) => return Err(run.fail(CallState::Errored, err)),
        };

        let permit = tokio::select! {
            biased;
            () = run.token().cancelled() => {
                return Err(run.fail(CallState::Cancelled, McpError::cancelled("call cancelled")));
            }
            () = sleep_until(deadline) => {
                return Err(run.fail(
                    CallState::TimedOut,
                    deadline_error(timeout, "waiting for a call slot"),
                ));
            }
            permit = Arc::clone(&self.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    return Err(run.fail(
                        CallState::Errored,
                        McpError::internal("router is shutting down"),
                    ));
                }
            },
        };

        let policy = opts
            .max_retries
            .map_or_else(|| self.retry.clone(), |n| self.retry.clone().with_max_retries(n));
        Ok(Admitted {
            run,
            target: server,
            deadline,
            policy,
            _permit: permit,
        })
    }

    async fn run_call(&self, request: Request, target: String, opts: CallOptions) -> CallOutcome {
        let timeout = self.effective_timeout(opts.timeout);
        let Admitted {
            mut run,
            target: server,
            deadline,
            policy,
            _permit,
        } = match self.admit(&request, target, opts).await {
            Ok(admitted) => admitted,
            Err(outcome) => return outcome,
        };
        run.advance(CallState::Dispatched);

        loop {
            if !server.is_available() {
                return run.fail(CallState::Errored, unavailable(&server));
            }
            run.advance(CallState::InFlight);

            let attempt = run.token().child_token();
            let response = tokio::select! {
                biased;
                () = run.token().cancelled() => {
                    abandon(&server, &attempt, run.id());
                    return run.fail(CallState::Cancelled, McpError::cancelled("call cancelled"));
                }
                () = sleep_until(deadline) => {
                    abandon(&server, &attempt, run.id());
                    return run.fail(CallState::TimedOut, deadline_error(timeout, "call in flight"));
                }
                () = left_healthy(server.health.clone()) => {
                    abandon(&server, &attempt, run.id());
                    return run.fail(CallState::Errored, unavailable(&server));
                }
                response = server.transport.send(&request, &attempt) => response,
            };

            match response.error_code() {
                None => return run.finish(CallState::Completed, response),
                Some(code) if code.is_transient() && policy.allows(run.retries) => {
                    let retry = run.retries + 1;
                    let delay = policy.delay(retry);
                    warn!(
                        request_id = run.id(),
                        tool = %run.target,
                        server = %server.name,
                        retry,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = response.error().map(|e| e.message.as_str()).unwrap_or_default(),
                        "transient failure, retrying"
                    );
                    run.record_retry();
                    tokio::select! {
                        biased;
                        () = run.token().cancelled() => {
                            return run.fail(
                                CallState::Cancelled,
                                McpError::cancelled("call cancelled during backoff"),
                            );
                        }
                        () = sleep_until(deadline) => {
                            return run.fail(
                                CallState::TimedOut,
                                deadline_error(timeout, "backoff"),
                            );
                        }
                        () = sleep(delay) => {}
                    }
                    run.advance(CallState::Dispatched);
                }
                Some(code) => return run.finish(terminal_state(code), response),
            }
        }
    }

    async fn run_stream(
        &self,
        request: Request,
        target: String,
        opts: CallOptions,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> CallOutcome {
        let timeout = self.effective_timeout(opts.timeout);
        let Admitted {
            mut run,
            target: server,
            deadline,
            _permit,
            ..
        } = match self.admit(&request, target, opts).await {
            Ok(admitted) => admitted,
            Err(outcome) => return outcome,
        };
        run.advance(CallState::Dispatched);
        if !server.is_available() {
            return run.fail(CallState::Errored, unavailable(&server));
        }
        run.advance(CallState::InFlight);

        let attempt = run.token().child_token();
        let mut upstream = server.transport.open_stream(request, attempt.clone());
        loop {
            tokio::select! {
                biased;
                () = run.token().cancelled() => {
                    abandon(&server, &attempt, run.id());
                    return run.fail(CallState::Cancelled, McpError::cancelled("call cancelled"));
                }
                () = sleep_until(deadline) => {
                    abandon(&server, &attempt, run.id());
                    return run.fail(CallState::TimedOut, deadline_error(timeout, "stream open"));
                }
                () = left_healthy(server.health.clone()) => {
                    abandon(&server, &attempt, run.id());
                    return run.fail(CallState::Errored, unavailable(&server));
                }
                () = tx.closed() => {
                    abandon(&server, &attempt, run.id());
                    return run.fail(CallState::Cancelled, McpError::cancelled("stream dropped"));
                }
                event = upstream.recv() => match event {
                    Some(StreamEvent::Progress(progress)) => {
                        let _ = tx.send(StreamEvent::Progress(progress)).await;
                    }
                    Some(StreamEvent::Final(response)) => {
                        let state = response.error_code().map_or(CallState::Completed, terminal_state);
                        return run.finish(state, response);
                    }
                    None => {
                        return run.fail(
                            CallState::Errored,
                            McpError::transport("stream ended without a response"),
                        );
                    }
                },
            }
        }
    }
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Name recorded against a call: the tool, the resource URI, or the method.
fn call_target(request: &Request) -> String {
    request
        .tool_name()
        .or_else(|| request.resource_uri())
        .unwrap_or_else(|| request.method().as_str())
        .to_owned()
}

const fn terminal_state(code: ErrorCode) -> CallState {
    match code {
        ErrorCode::DeadlineExceeded => CallState::TimedOut,
        ErrorCode::Cancelled => CallState::Cancelled,
        _ => CallState::Errored,
    }
}

fn enrich_response(response: Response) -> Response {
    match response.body() {
        ResponseBody::Result(_) => response,
        ResponseBody::Error(err) => enrich(err.clone()).into_response(response.id()),
    }
}

fn deadline_error(timeout: Duration, phase: &str) -> McpError {
    let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
    McpError::deadline_exceeded(format!("deadline of {timeout_ms}ms exceeded ({phase})"))
        .with_data(json!({ "timeout_ms": timeout_ms }))
}

fn unavailable(server: &ServerRegistration) -> McpError {
    let status = server
        .status()
        .map_or_else(|| "closed".to_owned(), |s| s.as_str().to_owned());
    McpError::upstream_unavailable(format!("server {} is {status}", server.name))
        .with_data(json!({ "server": server.name, "status": status }))
}

fn abandon(server: &ServerRegistration, attempt: &CancellationToken, id: &str) {
    attempt.cancel();
    server.transport.abandon(id);
}

/// Resolves once the watched sidecar is no longer healthy (or its
/// supervisor is gone). Never resolves for unsupervised servers.
async fn left_healthy(health: Option<watch::Receiver<SidecarStatus>>) {
    let Some(mut rx) = health else {
        return std::future::pending().await;
    };
    let _ = rx.wait_for(|status| !status.is_healthy()).await;
}

fn to_success(id: &str, value: &impl Serialize) -> Response {
    match serde_json::to_value(value) {
        Ok(value) => Response::success(id, value),
        Err(err) => McpError::internal(format!("serialization failed: {err}")).into_response(id),
    }
}

async fn bounded<T>(
    limit: Duration,
    phase: &str,
    fut: impl std::future::Future<Output = Result<T, McpError>>,
) -> Result<T, McpError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| deadline_error(limit, phase))?
}

async fn fetch_list<T: DeserializeOwned>(
    transport: &Transport,
    request: Request,
    field: &str,
    limit: Duration,
) -> Result<Vec<T>, McpError> {
    let send = async {
        transport
            .send(&request, &CancellationToken::new())
            .await
            .into_result()
    };
    let value = bounded(limit, request.method().as_str(), send).await?;
    match value.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(items) => serde_json::from_value(items.clone())
            .map_err(|err| McpError::transport(format!("malformed {field} list: {err}"))),
    }
}
