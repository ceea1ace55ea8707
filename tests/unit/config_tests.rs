use std::io::Write;

use bibot_mcp::config::{GlobalConfig, SidecarEndpoint};
use bibot_mcp::AppError;

fn sample_toml() -> &'static str {
    r#"
[server]
name = "bibot-mcp-staging"
host = "0.0.0.0"
http_port = 9100

[router]
default_timeout_ms = 10000
max_timeout_ms = 60000
max_concurrent_calls = 16

[router.retry]
max_retries = 5
base_delay_ms = 200
max_delay_ms = 5000
multiplier = 3.0
jitter = 0.2

[[sidecars]]
name = "warehouse"
kind = "stdio"
command = "warehouse-mcp"
args = ["--readonly"]
env = { WAREHOUSE_DSN = "postgres://reporting" }
priority = 10

[[sidecars]]
name = "charts"
kind = "http"
base_url = "http://127.0.0.1:9200"
probe_interval_ms = 1000

[[sidecars]]
name = "exports"
kind = "sse"
base_url = "http://127.0.0.1:9300"
"#
}

fn expect_config_error(raw: &str, needle: &str) {
    match GlobalConfig::from_toml_str(raw) {
        Err(AppError::Config(msg)) => assert!(msg.contains(needle), "{msg}"),
        other => panic!("expected config error containing {needle:?}, got {other:?}"),
    }
}

#[test]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.server.name, "bibot-mcp-staging");
    assert_eq!(config.bind_address(), "0.0.0.0:9100");
    assert_eq!(config.router.default_timeout_ms, 10_000);
    assert_eq!(config.router.max_concurrent_calls, 16);
    assert_eq!(config.router.retry.max_retries, 5);
    assert!((config.router.retry.multiplier - 3.0).abs() < f64::EPSILON);

    assert_eq!(config.sidecars.len(), 3);
    let warehouse = &config.sidecars[0];
    assert_eq!(warehouse.priority, 10);
    match &warehouse.endpoint {
        SidecarEndpoint::Stdio {
            command, args, env, ..
        } => {
            assert_eq!(command, "warehouse-mcp");
            assert_eq!(args, &vec!["--readonly".to_owned()]);
            assert_eq!(env["WAREHOUSE_DSN"], "postgres://reporting");
        }
        other => panic!("expected stdio endpoint, got {other:?}"),
    }
    assert_eq!(config.sidecars[1].probe_interval_ms, 1_000);
    assert!(matches!(config.sidecars[2].endpoint, SidecarEndpoint::Sse { .. }));
}

#[test]
fn empty_file_yields_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("defaults");
    assert_eq!(config, GlobalConfig::default());
    assert_eq!(config.bind_address(), "127.0.0.1:8765");
    assert_eq!(config.router.default_timeout_ms, 30_000);
    assert_eq!(config.router.retry.max_retries, 3);
    assert!(config.sidecars.is_empty());
}

#[test]
fn sidecar_defaults_apply() {
    let config = GlobalConfig::from_toml_str(
        r#"
[[sidecars]]
name = "charts"
kind = "http"
base_url = "http://localhost:9200"
"#,
    )
    .expect("valid config");
    let sidecar = &config.sidecars[0];
    assert_eq!(sidecar.priority, 0);
    assert_eq!(sidecar.failure_threshold, 3);
    assert_eq!(sidecar.max_restarts, 3);
    assert_eq!(sidecar.startup_grace_ms, 10_000);
}

#[test]
fn rejects_max_timeout_below_default() {
    expect_config_error(
        "[router]\ndefault_timeout_ms = 5000\nmax_timeout_ms = 1000\n",
        "max_timeout_ms",
    );
}

#[test]
fn rejects_zero_concurrency() {
    expect_config_error("[router]\nmax_concurrent_calls = 0\n", "max_concurrent_calls");
}

#[test]
fn rejects_out_of_range_retry_settings() {
    expect_config_error("[router.retry]\nmultiplier = 0.5\n", "multiplier");
    expect_config_error("[router.retry]\njitter = 1.5\n", "jitter");
    expect_config_error(
        "[router.retry]\nbase_delay_ms = 100\nmax_delay_ms = 10\n",
        "max_delay_ms",
    );
}

#[test]
fn rejects_duplicate_sidecar_names() {
    expect_config_error(
        r#"
[[sidecars]]
name = "charts"
kind = "http"
base_url = "http://a"

[[sidecars]]
name = "charts"
kind = "sse"
base_url = "http://b"
"#,
        "duplicate sidecar name",
    );
}

#[test]
fn rejects_empty_command_and_zero_probe_interval() {
    expect_config_error(
        "[[sidecars]]\nname = \"x\"\nkind = \"stdio\"\ncommand = \" \"\n",
        "command must not be empty",
    );
    expect_config_error(
        "[[sidecars]]\nname = \"x\"\nkind = \"http\"\nbase_url = \"http://a\"\nprobe_interval_ms = 0\n",
        "probe_interval_ms",
    );
}

#[test]
fn rejects_unknown_sidecar_kind() {
    expect_config_error(
        "[[sidecars]]\nname = \"x\"\nkind = \"carrier-pigeon\"\n",
        "invalid config",
    );
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write config");

    let config = GlobalConfig::load_from_path(file.path()).expect("load");
    assert_eq!(config.sidecars[0].name, "warehouse");
}

#[test]
fn missing_file_is_a_config_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    let result = GlobalConfig::load_from_path(dir.path().join("absent.toml"));
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("failed to read config")));
}
