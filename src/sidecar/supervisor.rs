//! Per-sidecar supervisor task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{sleep, timeout, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

use crate::config::{SidecarConfig, SidecarEndpoint};
use crate::protocol::{ClientInfo, McpError};
use crate::router::{RegisterOptions, Router};
use crate::transport::{HttpTransport, SseTransport, StdioTransport, Transport};
use crate::{AppError, Result};

use super::spawner::{spawn_sidecar, SpawnSpec};
use super::SidecarStatus;

/// Why a monitoring pass ended.
enum Exit {
    /// Stop requested; do not restart.
    Stopped,
    /// Failed; restart if the budget allows.
    Failed(String),
}

pub(super) struct Supervisor {
    config: SidecarConfig,
    router: Arc<Router>,
    status: watch::Sender<SidecarStatus>,
    restarts: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl Supervisor {
    pub(super) fn new(
        config: SidecarConfig,
        router: Arc<Router>,
        status: watch::Sender<SidecarStatus>,
        restarts: Arc<AtomicU32>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            router,
            status,
            restarts,
            cancel,
        }
    }

    pub(super) async fn run(self) {
        let span = info_span!("sidecar", name = %self.config.name);
        self.supervise().instrument(span).await;
    }

    async fn supervise(self) {
        loop {
            self.publish(SidecarStatus::Starting);
            let exit = match self.start_once().await {
                Ok(Some(transport)) => self.monitor(&transport).await,
                Ok(None) => Exit::Stopped,
                Err(err) => Exit::Failed(err.to_string()),
            };

            let reason = match exit {
                Exit::Stopped => break,
                Exit::Failed(reason) => reason,
            };
            let restarts = self.restarts.load(Ordering::Relaxed);
            if restarts >= self.config.max_restarts {
                error!(restarts, %reason, "sidecar out of restarts, stopping");
                break;
            }

            warn!(restart = restarts + 1, %reason, "restarting sidecar");
            self.publish(SidecarStatus::Restarting);
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                () = sleep(self.config.restart_delay()) => {}
            }
            self.restarts.fetch_add(1, Ordering::Relaxed);
        }

        self.router.unregister_server(&self.config.name);
        self.publish(SidecarStatus::Stopped);
        info!("sidecar stopped");
    }

    /// Build the transport and register it within the startup grace.
    /// `Ok(None)` means a stop was requested meanwhile.
    async fn start_once(&self) -> Result<Option<Arc<Transport>>> {
        let transport = Arc::new(build_transport(&self.config)?);
        let grace = self.config.startup_grace();

        let registered = tokio::select! {
            biased;
            () = self.cancel.cancelled() => None,
            result = timeout(grace, self.register(&transport)) => Some(result),
        };
        let failure = match registered {
            None => {
                transport.close().await;
                return Ok(None);
            }
            Some(Ok(Ok(()))) => {
                self.publish(SidecarStatus::Healthy);
                info!("sidecar healthy");
                return Ok(Some(transport));
            }
            Some(Ok(Err(err))) => format!("initialize failed: {err}"),
            Some(Err(_)) => format!(
                "no initialize response within {}ms",
                self.config.startup_grace_ms
            ),
        };
        transport.close().await;
        Err(AppError::Sidecar(format!("{}: {failure}", self.config.name)))
    }

    async fn register(&self, transport: &Arc<Transport>) -> std::result::Result<(), McpError> {
        let opts = RegisterOptions {
            priority: self.config.priority,
            health: Some(self.status.subscribe()),
        };
        self.router
            .register_server(&self.config.name, Arc::clone(transport), opts)
            .await
            .map(|_| ())
    }

    /// Probe until stopped or out of patience.
    async fn monitor(&self, transport: &Arc<Transport>) -> Exit {
        let threshold = self.config.failure_threshold.max(1);
        let mut failures = 0_u32;
        let mut ticker = tokio::time::interval(self.config.probe_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    self.retire(transport).await;
                    return Exit::Stopped;
                }
                () = transport_closed(transport) => {
                    self.retire(transport).await;
                    return Exit::Failed("transport closed".into());
                }
                _ = ticker.tick() => {}
            }

            if self.probe(transport).await {
                failures = 0;
                if *self.status.borrow() == SidecarStatus::Unhealthy {
                    match self.register(transport).await {
                        Ok(()) => {
                            self.publish(SidecarStatus::Healthy);
                            info!("sidecar recovered");
                        }
                        Err(err) => warn!(%err, "re-registration failed"),
                    }
                }
                continue;
            }

            failures += 1;
            warn!(failures, threshold, "health probe failed");
            if failures < threshold {
                continue;
            }
            failures = 0;
            if *self.status.borrow() == SidecarStatus::Healthy {
                self.publish(SidecarStatus::Unhealthy);
                warn!("sidecar unhealthy");
            } else {
                self.retire(transport).await;
                return Exit::Failed(format!("{threshold} probe failures while unhealthy"));
            }
        }
    }

    async fn probe(&self, transport: &Transport) -> bool {
        let client = ClientInfo::router();
        let probe = transport.initialize(&client);
        matches!(timeout(self.config.probe_timeout(), probe).await, Ok(Ok(_)))
    }

    /// Close the transport. The registration stays until STOPPED so calls
    /// during a restart are gated with `UPSTREAM_UNAVAILABLE`.
    async fn retire(&self, transport: &Transport) {
        transport.close().await;
    }

    fn publish(&self, status: SidecarStatus) {
        self.status.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }
}

fn build_transport(config: &SidecarConfig) -> Result<Transport> {
    match &config.endpoint {
        SidecarEndpoint::Stdio {
            command,
            args,
            env,
            cwd,
        } => {
            let child = spawn_sidecar(&SpawnSpec {
                name: &config.name,
                command,
                args,
                env,
                cwd: cwd.as_deref(),
            })?;
            Ok(StdioTransport::from_child(config.name.clone(), child)?.into())
        }
        SidecarEndpoint::Http { base_url } => Ok(HttpTransport::new(base_url)?.into()),
        SidecarEndpoint::Sse { base_url } => Ok(SseTransport::new(base_url)?.into()),
    }
}

/// Resolves when a stdio child goes away. Network transports have no
/// passive signal and rely on probes.
async fn transport_closed(transport: &Transport) {
    match transport {
        Transport::Stdio(t) => t.closed().await,
        _ => std::future::pending().await,
    }
}
