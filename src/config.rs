//! Global configuration parsing and validation.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

fn default_server_name() -> String {
    "bibot-mcp".into()
}

fn default_server_version() -> String {
    env!("CARGO_PKG_VERSION").into()
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_http_port() -> u16 {
    8765
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_timeout_ms() -> u64 {
    300_000
}

fn default_max_concurrent_calls() -> usize {
    100
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_startup_grace_ms() -> u64 {
    10_000
}

fn default_probe_interval_ms() -> u64 {
    5_000
}

fn default_probe_timeout_ms() -> u64 {
    2_000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_delay_ms() -> u64 {
    1_000
}

/// Identity and HTTP binding of this router instance.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ServerConfig {
    /// Name reported in `initialize` and `/mcp/health`.
    #[serde(default = "default_server_name")]
    pub name: String,
    /// Version reported in `initialize`.
    #[serde(default = "default_server_version")]
    pub version: String,
    /// HTTP bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP port; `0` picks an ephemeral port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_server_name(),
            version: default_server_version(),
            host: default_host(),
            http_port: default_http_port(),
        }
    }
}

/// Retry policy for transient (`TRANSPORT_ERROR`) failures.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Upper bound on any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Growth factor per retry; at least 1.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Relative jitter in `[0, 1]` applied symmetrically to each delay.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryConfig {
    /// Delay before the first retry.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Upper bound on any single delay.
    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Call routing limits.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RouterConfig {
    /// Deadline applied when the caller gives none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Ceiling for caller-supplied deadlines.
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    /// Calls allowed in flight at once.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    /// Transient-failure retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
            max_timeout_ms: default_max_timeout_ms(),
            max_concurrent_calls: default_max_concurrent_calls(),
            retry: RetryConfig::default(),
        }
    }
}

impl RouterConfig {
    /// Deadline applied when the caller gives none.
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Ceiling for caller-supplied deadlines.
    #[must_use]
    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }
}

/// How to reach a sidecar.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SidecarEndpoint {
    /// Child process speaking NDJSON on stdin/stdout.
    Stdio {
        /// Executable.
        command: String,
        /// Arguments.
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables on top of the allowlist.
        #[serde(default)]
        env: HashMap<String, String>,
        /// Working directory.
        #[serde(default)]
        cwd: Option<PathBuf>,
    },
    /// Remote or loopback HTTP server.
    Http {
        /// Base URL; requests go to `{base_url}/mcp`.
        base_url: String,
    },
    /// Remote or loopback SSE server.
    Sse {
        /// Base URL; requests go to `{base_url}/mcp/sse`.
        base_url: String,
    },
}

/// One supervised sidecar.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SidecarConfig {
    /// Unique sidecar name; also its server name in the router.
    pub name: String,
    /// Connection details.
    #[serde(flatten)]
    pub endpoint: SidecarEndpoint,
    /// Higher priority wins when two servers expose the same tool.
    #[serde(default)]
    pub priority: i32,
    /// Time allowed for the first `initialize` after start.
    #[serde(default = "default_startup_grace_ms")]
    pub startup_grace_ms: u64,
    /// Interval between health probes.
    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
    /// Timeout for one health probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
    /// Consecutive probe failures before a state change.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Restarts allowed before the sidecar is stopped for good.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// Pause before each restart.
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
}

impl SidecarConfig {
    /// Config for an HTTP sidecar with default supervision settings.
    #[must_use]
    pub fn http(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self::with_endpoint(
            name,
            SidecarEndpoint::Http {
                base_url: base_url.into(),
            },
        )
    }

    /// Config for a stdio sidecar with default supervision settings.
    #[must_use]
    pub fn stdio(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self::with_endpoint(
            name,
            SidecarEndpoint::Stdio {
                command: command.into(),
                args,
                env: HashMap::new(),
                cwd: None,
            },
        )
    }

    fn with_endpoint(name: impl Into<String>, endpoint: SidecarEndpoint) -> Self {
        Self {
            name: name.into(),
            endpoint,
            priority: 0,
            startup_grace_ms: default_startup_grace_ms(),
            probe_interval_ms: default_probe_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            max_restarts: default_max_restarts(),
            restart_delay_ms: default_restart_delay_ms(),
        }
    }

    /// Time allowed for the first `initialize`.
    #[must_use]
    pub fn startup_grace(&self) -> Duration {
        Duration::from_millis(self.startup_grace_ms)
    }

    /// Interval between probes.
    #[must_use]
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    /// Timeout for one probe.
    #[must_use]
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Pause before a restart.
    #[must_use]
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(AppError::Config("sidecar name must not be empty".into()));
        }
        let name = &self.name;
        match &self.endpoint {
            SidecarEndpoint::Stdio { command, .. } if command.trim().is_empty() => {
                return Err(AppError::Config(format!(
                    "sidecar {name}: command must not be empty"
                )));
            }
            SidecarEndpoint::Http { base_url } | SidecarEndpoint::Sse { base_url }
                if base_url.trim().is_empty() =>
            {
                return Err(AppError::Config(format!(
                    "sidecar {name}: base_url must not be empty"
                )));
            }
            _ => {}
        }
        for (field, value) in [
            ("startup_grace_ms", self.startup_grace_ms),
            ("probe_interval_ms", self.probe_interval_ms),
            ("probe_timeout_ms", self.probe_timeout_ms),
            ("failure_threshold", u64::from(self.failure_threshold)),
        ] {
            if value == 0 {
                return Err(AppError::Config(format!(
                    "sidecar {name}: {field} must be greater than zero"
                )));
            }
        }
        Ok(())
    }
}

/// Global configuration parsed from `config.toml`.
///
/// Every section is optional; an empty file yields the defaults.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Identity and HTTP binding.
    #[serde(default)]
    pub server: ServerConfig,
    /// Routing limits and retry policy.
    #[serde(default)]
    pub router: RouterConfig,
    /// Supervised sidecars.
    #[serde(default)]
    pub sidecars: Vec<SidecarConfig>,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        let router = &self.router;
        if router.default_timeout_ms == 0 {
            return Err(AppError::Config(
                "router.default_timeout_ms must be greater than zero".into(),
            ));
        }
        if router.max_timeout_ms < router.default_timeout_ms {
            return Err(AppError::Config(
                "router.max_timeout_ms must not be below default_timeout_ms".into(),
            ));
        }
        if router.max_concurrent_calls == 0 {
            return Err(AppError::Config(
                "router.max_concurrent_calls must be greater than zero".into(),
            ));
        }

        let retry = &router.retry;
        if !retry.multiplier.is_finite() || retry.multiplier < 1.0 {
            return Err(AppError::Config(
                "router.retry.multiplier must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            return Err(AppError::Config(
                "router.retry.jitter must be within [0, 1]".into(),
            ));
        }
        if retry.max_delay_ms < retry.base_delay_ms {
            return Err(AppError::Config(
                "router.retry.max_delay_ms must not be below base_delay_ms".into(),
            ));
        }

        let mut seen = HashSet::new();
        for sidecar in &self.sidecars {
            sidecar.validate()?;
            if !seen.insert(sidecar.name.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate sidecar name: {}",
                    sidecar.name
                )));
            }
        }

        Ok(())
    }

    /// `host:port` for the HTTP listener.
    #[must_use]
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.http_port)
    }
}
