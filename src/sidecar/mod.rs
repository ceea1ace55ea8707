//! Supervision of out-of-process MCP servers.
//!
//! Each configured sidecar gets one supervisor task that owns its
//! transport, probes its health, and restarts it within a budget. Status
//! changes are published on a `watch` channel; the router holds a
//! receiver so calls fail fast while a sidecar is not `HEALTHY`.

pub mod spawner;
mod supervisor;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{SidecarConfig, SidecarEndpoint};
use crate::router::Router;
use crate::transport::TransportKind;

use self::supervisor::Supervisor;

/// Lifecycle of a supervised sidecar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SidecarStatus {
    /// Transport being built or first `initialize` outstanding.
    Starting,
    /// Registered and answering probes.
    Healthy,
    /// Missed `failure_threshold` consecutive probes.
    Unhealthy,
    /// Waiting out `restart_delay` before the next start.
    Restarting,
    /// Terminal: stopped by request or out of restarts.
    Stopped,
}

impl SidecarStatus {
    /// Upper-case label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::Healthy => "HEALTHY",
            Self::Unhealthy => "UNHEALTHY",
            Self::Restarting => "RESTARTING",
            Self::Stopped => "STOPPED",
        }
    }

    /// Whether calls may be dispatched.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }
}

impl std::fmt::Display for SidecarStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one sidecar.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SidecarInfo {
    /// Sidecar name.
    pub name: String,
    /// Transport variant.
    pub transport: TransportKind,
    /// Current status.
    pub status: SidecarStatus,
    /// Restarts performed so far.
    pub restart_count: u32,
}

struct SidecarHandle {
    transport: TransportKind,
    status: watch::Receiver<SidecarStatus>,
    restarts: Arc<AtomicU32>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owner of every supervisor task.
pub struct SidecarManager {
    router: Arc<Router>,
    sidecars: Mutex<HashMap<String, SidecarHandle>>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SidecarManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SidecarManager")
            .field("sidecars", &self.list())
            .finish_non_exhaustive()
    }
}

impl SidecarManager {
    /// Manager with no sidecars.
    #[must_use]
    pub fn new(router: Arc<Router>) -> Self {
        Self {
            router,
            sidecars: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        }
    }

    /// Build a manager and launch a supervisor for each config.
    #[must_use]
    pub fn start(router: Arc<Router>, configs: &[SidecarConfig]) -> Self {
        let manager = Self::new(router);
        for config in configs {
            manager.launch(config.clone());
        }
        manager
    }

    /// Launch a supervisor for `config`.
    ///
    /// Returns `false` (and launches nothing) when a sidecar with the same
    /// name is already supervised.
    pub fn launch(&self, config: SidecarConfig) -> bool {
        let mut sidecars = self.lock();
        if sidecars.contains_key(&config.name) {
            warn!(sidecar = %config.name, "sidecar already supervised");
            return false;
        }

        let (status_tx, status_rx) = watch::channel(SidecarStatus::Starting);
        let restarts = Arc::new(AtomicU32::new(0));
        let cancel = self.shutdown.child_token();
        let transport = endpoint_kind(&config.endpoint);
        let name = config.name.clone();

        let supervisor = Supervisor::new(
            config,
            Arc::clone(&self.router),
            status_tx,
            Arc::clone(&restarts),
            cancel.clone(),
        );
        let task = tokio::spawn(supervisor.run());
        info!(sidecar = %name, %transport, "sidecar supervisor started");

        sidecars.insert(
            name,
            SidecarHandle {
                transport,
                status: status_rx,
                restarts,
                cancel,
                task,
            },
        );
        true
    }

    /// Stop one sidecar and wait for its supervisor to finish.
    pub async fn stop(&self, name: &str) -> bool {
        let handle = self.lock().remove(name);
        let Some(handle) = handle else {
            return false;
        };
        handle.cancel.cancel();
        if let Err(err) = handle.task.await {
            warn!(sidecar = name, %err, "sidecar supervisor panicked");
        }
        true
    }

    /// Stop every sidecar.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<(String, SidecarHandle)> = self.lock().drain().collect();
        for (name, handle) in handles {
            if let Err(err) = handle.task.await {
                warn!(sidecar = %name, %err, "sidecar supervisor panicked");
            }
        }
        info!("sidecars stopped");
    }

    /// Current status of one sidecar.
    #[must_use]
    pub fn status(&self, name: &str) -> Option<SidecarStatus> {
        self.lock().get(name).map(|h| *h.status.borrow())
    }

    /// Status feed of one sidecar.
    #[must_use]
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<SidecarStatus>> {
        self.lock().get(name).map(|h| h.status.clone())
    }

    /// Snapshots of every sidecar, sorted by name.
    #[must_use]
    pub fn list(&self) -> Vec<SidecarInfo> {
        let mut out: Vec<SidecarInfo> = self
            .lock()
            .iter()
            .map(|(name, h)| SidecarInfo {
                name: name.clone(),
                transport: h.transport,
                status: *h.status.borrow(),
                restart_count: h.restarts.load(Ordering::Relaxed),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, SidecarHandle>> {
        self.sidecars.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

const fn endpoint_kind(endpoint: &SidecarEndpoint) -> TransportKind {
    match endpoint {
        SidecarEndpoint::Stdio { .. } => TransportKind::Stdio,
        SidecarEndpoint::Http { .. } => TransportKind::Http,
        SidecarEndpoint::Sse { .. } => TransportKind::Sse,
    }
}
