use std::collections::HashMap;
use std::time::Duration;

use bibot_mcp::sidecar::spawner::{spawn_sidecar, terminate, SpawnSpec, ALLOWED_ENV_VARS};
use bibot_mcp::AppError;
use serial_test::serial;
use tokio::io::AsyncReadExt;

#[test]
fn allowlist_covers_path_and_log_filter() {
    assert!(ALLOWED_ENV_VARS.contains(&"PATH"));
    assert!(ALLOWED_ENV_VARS.contains(&"RUST_LOG"));
}

#[tokio::test]
async fn missing_executable_is_a_sidecar_error() {
    let env = HashMap::new();
    let result = spawn_sidecar(&SpawnSpec {
        name: "ghost",
        command: "/nonexistent/bibot-sidecar",
        args: &[],
        env: &env,
        cwd: None,
    });
    match result {
        Err(AppError::Sidecar(msg)) => assert!(msg.starts_with("ghost:"), "{msg}"),
        Err(other) => panic!("expected sidecar error, got {other}"),
        Ok(_) => panic!("spawn should fail"),
    }
}

#[cfg(unix)]
#[tokio::test]
#[serial]
async fn child_sees_allowlist_and_configured_env_only() {
    std::env::set_var("BIBOT_TEST_SECRET", "hunter2");
    let env = HashMap::from([("EXTRA".to_owned(), "configured".to_owned())]);
    let args = vec![
        "-c".to_owned(),
        "printf '%s|%s|%s' \"$MCP_SIDECAR_NAME\" \"$BIBOT_TEST_SECRET\" \"$EXTRA\"".to_owned(),
    ];

    let mut child = spawn_sidecar(&SpawnSpec {
        name: "env-check",
        command: "sh",
        args: &args,
        env: &env,
        cwd: None,
    })
    .expect("spawn sh");
    std::env::remove_var("BIBOT_TEST_SECRET");

    let mut out = String::new();
    child
        .stdout
        .take()
        .expect("piped stdout")
        .read_to_string(&mut out)
        .await
        .expect("read stdout");
    assert_eq!(out, "env-check||configured");
    assert!(child.wait().await.expect("wait").success());
}

#[cfg(unix)]
#[tokio::test]
async fn working_directory_is_applied() {
    let dir = tempfile::tempdir().expect("temp dir");
    let env = HashMap::new();
    let args = vec!["-c".to_owned(), "pwd".to_owned()];
    let mut child = spawn_sidecar(&SpawnSpec {
        name: "cwd-check",
        command: "sh",
        args: &args,
        env: &env,
        cwd: Some(dir.path()),
    })
    .expect("spawn sh");

    let mut out = String::new();
    child
        .stdout
        .take()
        .expect("piped stdout")
        .read_to_string(&mut out)
        .await
        .expect("read stdout");
    let reported = std::fs::canonicalize(out.trim()).expect("canonical pwd");
    let expected = std::fs::canonicalize(dir.path()).expect("canonical dir");
    assert_eq!(reported, expected);
}

#[cfg(unix)]
#[tokio::test]
async fn terminate_stops_a_long_running_child() {
    let env = HashMap::new();
    let args = vec!["30".to_owned()];
    let mut child = spawn_sidecar(&SpawnSpec {
        name: "sleeper",
        command: "sleep",
        args: &args,
        env: &env,
        cwd: None,
    })
    .expect("spawn sleep");

    let started = std::time::Instant::now();
    terminate(&mut child, Duration::from_secs(2)).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(child.try_wait().expect("try_wait").is_some());
}
