//! Sidecar process spawner.
//!
//! Launches stdio sidecars with:
//! - `kill_on_drop(true)` so an abandoned child never outlives its handle;
//! - `env_clear()` plus a small allowlist so router secrets are not
//!   inherited, with the sidecar's configured `env` layered on top;
//! - stderr captured and forwarded line by line into `tracing`.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, warn};

use crate::{AppError, Result};

// ── Environment allowlist ────────────────────────────────────────────────────

/// Variables inherited from the router's environment.
pub const ALLOWED_ENV_VARS: &[&str] = &[
    "PATH",
    "HOME",
    "LANG",
    "RUST_LOG",
    "TZ",
    // Windows-specific variables.
    "USERPROFILE",
    "SystemRoot",
    "TEMP",
    "TMP",
    "COMSPEC",
];

/// What to run.
#[derive(Debug, Clone, Copy)]
pub struct SpawnSpec<'a> {
    /// Sidecar name; exported as `MCP_SIDECAR_NAME`.
    pub name: &'a str,
    /// Executable.
    pub command: &'a str,
    /// Arguments.
    pub args: &'a [String],
    /// Extra variables set after the allowlist.
    pub env: &'a HashMap<String, String>,
    /// Working directory; inherited when `None`.
    pub cwd: Option<&'a Path>,
}

/// Spawn a sidecar with piped stdio.
///
/// The caller wraps the child in a
/// [`StdioTransport`](crate::transport::StdioTransport) and performs the
/// `initialize` handshake; readiness is not awaited here.
///
/// # Errors
///
/// Returns [`AppError::Sidecar`] when the OS refuses to start the process.
pub fn spawn_sidecar(spec: &SpawnSpec<'_>) -> Result<Child> {
    let mut cmd = Command::new(spec.command);
    cmd.args(spec.args);

    cmd.env_clear();
    for &key in ALLOWED_ENV_VARS {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(spec.env);
    cmd.env("MCP_SIDECAR_NAME", spec.name);

    if let Some(cwd) = spec.cwd {
        cmd.current_dir(cwd);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let child = cmd.spawn().map_err(|err| {
        AppError::Sidecar(format!("{}: failed to spawn {}: {err}", spec.name, spec.command))
    })?;

    info!(sidecar = spec.name, pid = child.id(), command = spec.command, "sidecar spawned");
    Ok(child)
}

/// Forward a child's stderr into the log, one event per line.
pub fn forward_stderr(label: String, stderr: ChildStderr) {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!(sidecar = %label, "{line}"),
                Ok(None) => break,
                Err(err) => {
                    debug!(sidecar = %label, %err, "stderr read failed");
                    break;
                }
            }
        }
    });
}

/// Stop a child: SIGTERM, wait up to `grace`, then kill.
pub async fn terminate(child: &mut Child, grace: Duration) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{self, Signal};
        use nix::unistd::Pid;

        if let Some(raw) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(err) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                warn!(pid = raw, %err, "failed to send SIGTERM to sidecar");
            }
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "sidecar exited"),
        Ok(Err(err)) => warn!(%err, "error waiting for sidecar exit"),
        Err(_elapsed) => {
            warn!("sidecar ignored SIGTERM, killing");
            if let Err(err) = child.kill().await {
                warn!(%err, "failed to kill sidecar");
            }
        }
    }
}
