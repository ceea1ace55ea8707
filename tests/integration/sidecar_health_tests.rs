//! Sidecar supervision: startup, health probing, fail-fast routing while
//! unhealthy, restart budget, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use bibot_mcp::client::{CallContext, InternalClient};
use bibot_mcp::config::SidecarConfig;
use bibot_mcp::http::serve_http;
use bibot_mcp::protocol::ErrorCode;
use bibot_mcp::router::Router;
use bibot_mcp::sidecar::{SidecarManager, SidecarStatus};
use serde_json::json;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::test_helpers::{fast_config, router_with_builtin};

/// Serve a second router with the built-in tools, standing in for a
/// remote MCP server.
async fn spawn_remote() -> (String, CancellationToken) {
    let remote = router_with_builtin(&fast_config()).await;
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral");
    let url = format!("http://{}", listener.local_addr().expect("local addr"));
    let ct = CancellationToken::new();
    let serve_ct = ct.clone();
    tokio::spawn(async move {
        let _ = serve_http(remote, listener, serve_ct).await;
    });
    (url, ct)
}

fn fast_probing(mut config: SidecarConfig) -> SidecarConfig {
    config.startup_grace_ms = 2_000;
    config.probe_interval_ms = 100;
    config.probe_timeout_ms = 200;
    config.failure_threshold = 3;
    config.max_restarts = 0;
    config.restart_delay_ms = 10;
    config
}

async fn wait_for_status(
    rx: &mut watch::Receiver<SidecarStatus>,
    want: SidecarStatus,
    limit: Duration,
) {
    tokio::time::timeout(limit, rx.wait_for(|status| *status == want))
        .await
        .unwrap_or_else(|_| panic!("no {want} within {limit:?}"))
        .expect("status feed open");
}

#[tokio::test]
async fn http_sidecar_goes_healthy_then_fails_fast_when_unreachable() {
    let (url, remote_ct) = spawn_remote().await;
    let router = Arc::new(Router::new("front", "0.0.0", &fast_config()));
    let manager = SidecarManager::start(
        Arc::clone(&router),
        &[fast_probing(SidecarConfig::http("remote", url))],
    );
    let mut status = manager.subscribe("remote").expect("supervised");
    wait_for_status(&mut status, SidecarStatus::Healthy, Duration::from_secs(3)).await;

    let client = InternalClient::new(Arc::clone(&router));
    let result = client
        .call_tool("echo", json!({ "via": "http" }), CallContext::default())
        .await;
    assert!(result.ok, "{result:?}");
    assert_eq!(result.result, Some(json!({ "via": "http" })));

    remote_ct.cancel();
    wait_for_status(&mut status, SidecarStatus::Unhealthy, Duration::from_secs(3)).await;

    let started = tokio::time::Instant::now();
    let result = client
        .call_tool("echo", json!({}), CallContext::default())
        .await;
    assert!(!result.ok);
    let error = result.error.expect("error present");
    assert_eq!(error.code, ErrorCode::UpstreamUnavailable);
    assert!(started.elapsed() < Duration::from_secs(1));

    // Still failing while unhealthy with no restart budget: retired.
    wait_for_status(&mut status, SidecarStatus::Stopped, Duration::from_secs(3)).await;
    assert!(router.find_tool("echo").is_none());
    assert!(router.server("remote").is_none());

    manager.shutdown().await;
}

#[tokio::test]
async fn restarting_sidecar_keeps_its_tools_gated_as_unavailable() {
    let (url, remote_ct) = spawn_remote().await;
    let router = Arc::new(Router::new("front", "0.0.0", &fast_config()));
    let mut config = fast_probing(SidecarConfig::http("remote", url));
    config.max_restarts = 1;
    config.restart_delay_ms = 5_000;
    let manager = SidecarManager::start(Arc::clone(&router), &[config]);
    let mut status = manager.subscribe("remote").expect("supervised");
    wait_for_status(&mut status, SidecarStatus::Healthy, Duration::from_secs(3)).await;

    remote_ct.cancel();
    wait_for_status(&mut status, SidecarStatus::Restarting, Duration::from_secs(5)).await;

    assert_eq!(router.find_tool("echo").as_deref(), Some("remote"));
    let client = InternalClient::new(Arc::clone(&router));
    let result = client
        .call_tool("echo", json!({}), CallContext::default())
        .await;
    let error = result.error.expect("error present");
    assert_eq!(error.code, ErrorCode::UpstreamUnavailable);

    manager.shutdown().await;
    assert!(router.server("remote").is_none());
}

#[tokio::test]
async fn duplicate_sidecar_names_are_rejected() {
    let router = router_with_builtin(&fast_config()).await;
    let manager = SidecarManager::new(router);
    let config = fast_probing(SidecarConfig::http("dup", "http://127.0.0.1:9"));
    assert!(manager.launch(config.clone()));
    assert!(!manager.launch(config));
    assert_eq!(manager.list().len(), 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn stop_unregisters_and_publishes_stopped() {
    let (url, remote_ct) = spawn_remote().await;
    let router = Arc::new(Router::new("front", "0.0.0", &fast_config()));
    let manager = SidecarManager::start(
        Arc::clone(&router),
        &[fast_probing(SidecarConfig::http("remote", url))],
    );
    let mut status = manager.subscribe("remote").expect("supervised");
    wait_for_status(&mut status, SidecarStatus::Healthy, Duration::from_secs(3)).await;
    assert!(router.find_tool("wait").is_some());

    assert!(manager.stop("remote").await);
    assert_eq!(*status.borrow(), SidecarStatus::Stopped);
    assert!(router.find_tool("wait").is_none());
    assert!(manager.status("remote").is_none());
    assert!(!manager.stop("remote").await);

    remote_ct.cancel();
}

#[cfg(unix)]
#[tokio::test]
async fn stdio_sidecar_runs_the_router_binary() {
    let router = Arc::new(Router::new("front", "0.0.0", &fast_config()));
    let mut config = fast_probing(SidecarConfig::stdio(
        "child",
        env!("CARGO_BIN_EXE_bibot-mcp"),
        vec!["--transport".into(), "stdio".into()],
    ));
    config.startup_grace_ms = 10_000;
    let manager = SidecarManager::start(Arc::clone(&router), &[config]);
    let mut status = manager.subscribe("child").expect("supervised");
    wait_for_status(&mut status, SidecarStatus::Healthy, Duration::from_secs(10)).await;

    let client = InternalClient::new(Arc::clone(&router));
    let result = client
        .call_tool("echo", json!({ "via": "stdio" }), CallContext::default())
        .await;
    assert!(result.ok, "{result:?}");
    assert_eq!(result.result, Some(json!({ "via": "stdio" })));

    let info = manager.list();
    assert_eq!(info[0].name, "child");
    assert_eq!(info[0].status, SidecarStatus::Healthy);
    assert_eq!(info[0].restart_count, 0);

    manager.shutdown().await;
    assert!(router.server("child").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn crashing_sidecar_uses_up_its_restart_budget() {
    let router = Arc::new(Router::new("front", "0.0.0", &fast_config()));
    let mut config = fast_probing(SidecarConfig::stdio(
        "broken",
        "sh",
        vec!["-c".into(), "exit 3".into()],
    ));
    config.max_restarts = 2;
    let manager = SidecarManager::start(Arc::clone(&router), &[config]);
    let mut status = manager.subscribe("broken").expect("supervised");

    wait_for_status(&mut status, SidecarStatus::Stopped, Duration::from_secs(10)).await;
    let info = manager.list();
    assert_eq!(info[0].restart_count, 2);
    assert!(router.server("broken").is_none());

    manager.shutdown().await;
}
