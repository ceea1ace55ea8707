//! Streamed calls: progress ordering, a single final event, and
//! cancellation by drop or by id.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bibot_mcp::client::{CallContext, InternalClient};
use bibot_mcp::protocol::{ErrorCode, Request};
use bibot_mcp::router::CallOptions;
use bibot_mcp::transport::{CallStream, StreamEvent};
use futures_util::StreamExt;
use serde_json::json;

use super::test_helpers::{eventually, fast_config, register, router_with_builtin, slow_server};

/// Collect every event until the stream ends.
async fn drain(stream: CallStream) -> Vec<StreamEvent> {
    tokio::time::timeout(Duration::from_secs(5), stream.collect::<Vec<_>>())
        .await
        .expect("stream finished in time")
}

#[tokio::test]
async fn wait_streams_ordered_progress_then_one_final() {
    let router = router_with_builtin(&fast_config()).await;
    let request = Request::tools_call("wait", json!({ "ms": 100 })).unwrap();

    let events = drain(router.open_stream(request, CallOptions::default())).await;

    let (last, progress) = events.split_last().expect("at least one event");
    let StreamEvent::Final(response) = last else {
        panic!("last event must be final: {last:?}");
    };
    assert_eq!(response.result(), Some(&json!({ "waited_ms": 100 })));

    let values: Vec<f64> = progress
        .iter()
        .map(|event| match event {
            StreamEvent::Progress(p) => p.progress,
            StreamEvent::Final(_) => panic!("final before the end"),
        })
        .collect();
    assert_eq!(values.len(), 10);
    assert!(values.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(router.pending_count(), 0);
}

#[tokio::test]
async fn unknown_tool_stream_is_a_single_error_event() {
    let router = router_with_builtin(&fast_config()).await;
    let request = Request::tools_call("nope", json!({})).unwrap();

    let events = drain(router.open_stream(request, CallOptions::default())).await;

    assert_eq!(events.len(), 1);
    let StreamEvent::Final(response) = &events[0] else {
        panic!("expected final event");
    };
    assert_eq!(response.error_code(), Some(ErrorCode::MethodNotFound));
}

#[tokio::test]
async fn dropping_the_stream_cancels_the_call() {
    let router = router_with_builtin(&fast_config()).await;
    let calls = Arc::new(AtomicU32::new(0));
    let server = slow_server(Duration::from_secs(10), Arc::clone(&calls));
    register(&router, "slow", Arc::clone(&server)).await;

    let request = Request::tools_call("slow", json!({})).unwrap().with_id("dropped").unwrap();
    let stream = router.open_stream(request, CallOptions::default());
    assert!(eventually(Duration::from_secs(2), || calls.load(Ordering::SeqCst) == 1).await);
    assert!(router.pending("dropped").is_some());

    drop(stream);
    assert!(eventually(Duration::from_secs(2), || router.pending("dropped").is_none()).await);
    assert!(eventually(Duration::from_secs(2), || server.running_count() == 0).await);
    assert_eq!(router.metrics().cancelled, 1);
}

#[tokio::test]
async fn cancel_by_id_ends_the_stream_with_cancelled() {
    let router = router_with_builtin(&fast_config()).await;
    let request = Request::tools_call("wait", json!({ "ms": 10_000 }))
        .unwrap()
        .with_id("long-wait")
        .unwrap();
    let mut stream = router.open_stream(request, CallOptions::default());
    assert!(eventually(Duration::from_secs(2), || router.pending("long-wait").is_some()).await);

    assert!(router.cancel("long-wait"));
    let response = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match stream.recv().await.expect("final event") {
                StreamEvent::Progress(_) => {}
                StreamEvent::Final(response) => break response,
            }
        }
    })
    .await
    .expect("final in time");

    assert_eq!(response.id(), "long-wait");
    assert_eq!(response.error_code(), Some(ErrorCode::Cancelled));
    assert!(stream.recv().await.is_none());
}

#[tokio::test]
async fn stream_deadline_reports_timed_out() {
    let router = router_with_builtin(&fast_config()).await;
    let request = Request::tools_call("wait", json!({ "ms": 5_000 })).unwrap();
    let opts = CallOptions {
        timeout: Some(Duration::from_millis(100)),
        ..CallOptions::default()
    };
    let id = request.id().to_owned();

    let response = router.open_stream(request, opts).into_final(&id).await;
    assert_eq!(response.error_code(), Some(ErrorCode::DeadlineExceeded));
    assert_eq!(router.metrics().timed_out, 1);
}

#[tokio::test]
async fn client_streaming_rejects_bad_arguments_immediately() {
    let client = InternalClient::new(router_with_builtin(&fast_config()).await);
    let ctx = CallContext::with_request_id("bad-stream");

    let events = drain(client.call_tool_streaming("wait", json!("ten"), &ctx)).await;

    assert_eq!(events.len(), 1);
    let StreamEvent::Final(response) = &events[0] else {
        panic!("expected final event");
    };
    assert_eq!(response.id(), "bad-stream");
    assert_eq!(response.error_code(), Some(ErrorCode::InvalidParams));
}

#[tokio::test]
async fn client_streaming_yields_progress() {
    let client = InternalClient::new(router_with_builtin(&fast_config()).await);
    let ctx = CallContext::with_request_id("stream-ok");

    let events = drain(client.call_tool_streaming("wait", json!({ "ms": 20 }), &ctx)).await;

    assert!(events.iter().any(|e| matches!(e, StreamEvent::Progress(_))));
    let Some(StreamEvent::Final(response)) = events.last() else {
        panic!("expected final event");
    };
    assert_eq!(response.id(), "stream-ok");
    assert!(!response.is_error());
}
