//! `InternalClient`: uniform results, correlation ids, and overrides.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bibot_mcp::client::{CallContext, InternalClient};
use bibot_mcp::protocol::ErrorCode;
use serde_json::json;

use super::test_helpers::{eventually, fast_config, flaky_server, register, router_with_builtin, slow_server};

#[tokio::test]
async fn successful_call_carries_result_and_generated_id() {
    let client = InternalClient::new(router_with_builtin(&fast_config()).await);

    let result = client
        .call_tool("echo", json!({ "region": "emea" }), CallContext::default())
        .await;

    assert!(result.ok);
    assert_eq!(result.result, Some(json!({ "region": "emea" })));
    assert!(result.error.is_none());
    assert_eq!(result.retries, 0);
    assert!(uuid::Uuid::parse_str(&result.request_id).is_ok());
}

#[tokio::test]
async fn caller_request_id_is_preserved() {
    let client = InternalClient::new(router_with_builtin(&fast_config()).await);
    let result = client
        .call_tool("echo", json!({}), CallContext::with_request_id("report-7"))
        .await;
    assert_eq!(result.request_id, "report-7");
}

#[tokio::test]
async fn unknown_tool_is_an_enriched_failure() {
    let client = InternalClient::new(router_with_builtin(&fast_config()).await);
    let result = client
        .call_tool("sql_query", json!({}), CallContext::default())
        .await;

    assert!(!result.ok);
    assert!(result.result.is_none());
    let error = result.error.expect("error present");
    assert_eq!(error.code, ErrorCode::MethodNotFound);
    let data = error.data.expect("enriched data");
    assert_eq!(data["retryable"], false);
    assert!(data["suggestion"].is_string());
    assert_eq!(data["tool"], "sql_query");
}

#[tokio::test]
async fn non_object_arguments_fail_without_dispatch() {
    let router = router_with_builtin(&fast_config()).await;
    let client = InternalClient::new(Arc::clone(&router));
    let result = client
        .call_tool("echo", json!([1, 2, 3]), CallContext::with_request_id("bad-args"))
        .await;

    assert!(!result.ok);
    assert_eq!(result.request_id, "bad-args");
    assert_eq!(result.error.expect("error").code, ErrorCode::InvalidParams);
    assert_eq!(router.metrics().total_calls, 0);
}

#[tokio::test]
async fn retry_and_timeout_overrides_apply() {
    let router = router_with_builtin(&fast_config()).await;
    let flaky_calls = Arc::new(AtomicU32::new(0));
    register(&router, "flaky", flaky_server(1, Arc::clone(&flaky_calls))).await;
    register(
        &router,
        "slow",
        slow_server(Duration::from_secs(10), Arc::new(AtomicU32::new(0))),
    )
    .await;
    let client = InternalClient::new(router);

    let no_retry = client
        .call_tool("flaky", json!({}), CallContext::default().max_retries(0))
        .await;
    assert!(!no_retry.ok);
    assert_eq!(no_retry.retries, 0);
    let error = no_retry.error.expect("error");
    assert_eq!(error.code, ErrorCode::TransportError);
    assert_eq!(error.data.expect("data")["retryable"], true);

    let timed_out = client
        .call_tool(
            "slow",
            json!({}),
            CallContext::default().timeout(Duration::from_millis(30)),
        )
        .await;
    assert_eq!(timed_out.error.expect("error").code, ErrorCode::DeadlineExceeded);
}

#[tokio::test]
async fn cancel_through_the_client() {
    let router = router_with_builtin(&fast_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    register(&router, "slow", slow_server(Duration::from_secs(10), Arc::clone(&calls))).await;
    let client = InternalClient::new(router);

    let background = client.clone();
    let handle = tokio::spawn(async move {
        background
            .call_tool("slow", json!({}), CallContext::with_request_id("to-cancel"))
            .await
    });
    assert!(eventually(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1).await);

    assert!(client.cancel("to-cancel"));
    assert!(!client.cancel("to-cancel"));
    let result = handle.await.expect("join");
    assert_eq!(result.error.expect("error").code, ErrorCode::Cancelled);
}

#[tokio::test]
async fn list_tools_matches_router() {
    let client = InternalClient::new(router_with_builtin(&fast_config()).await);
    let names: Vec<String> = client.list_tools().into_iter().map(|t| t.name).collect();
    assert_eq!(names, vec!["echo", "wait"]);
    assert_eq!(client.router().list_tools().len(), 2);
}

#[tokio::test]
async fn result_serializes_without_absent_fields() {
    let client = InternalClient::new(router_with_builtin(&fast_config()).await);
    let result = client
        .call_tool("echo", json!({ "a": 1 }), CallContext::with_request_id("s1"))
        .await;
    let value = serde_json::to_value(&result).expect("serialize");
    assert_eq!(
        value,
        json!({ "ok": true, "result": { "a": 1 }, "request_id": "s1", "retries": 0 })
    );
}
