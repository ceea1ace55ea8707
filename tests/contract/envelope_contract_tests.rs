//! Wire shape of request and response envelopes.

use bibot_mcp::protocol::{Request, Response, PROTOCOL_VERSION};
use serde_json::{json, Value};

#[test]
fn request_serializes_with_all_four_fields() {
    let request = Request::tools_call("sql_query", json!({ "sql": "select 1" }))
        .unwrap()
        .with_id("req-1")
        .unwrap();

    let value: Value = serde_json::from_str(&request.to_json()).unwrap();
    assert_eq!(
        value,
        json!({
            "protocol_version": PROTOCOL_VERSION,
            "id": "req-1",
            "method": "tools/call",
            "params": { "name": "sql_query", "arguments": { "sql": "select 1" } }
        })
    );
}

#[test]
fn request_text_is_a_single_line() {
    let request = Request::tools_call("echo", json!({ "text": "a\nb" })).unwrap();
    assert!(!request.to_json().contains('\n'));
}

#[test]
fn protocol_version_defaults_when_absent_and_is_kept_when_present() {
    let request = Request::from_json(r#"{"id":"1","method":"tools/list"}"#).unwrap();
    assert_eq!(request.protocol_version(), PROTOCOL_VERSION);

    let request =
        Request::from_json(r#"{"protocol_version":"2025-01-01","id":"1","method":"tools/list"}"#)
            .unwrap();
    assert_eq!(request.protocol_version(), "2025-01-01");
}

#[test]
fn request_deserializes_through_serde_with_validation() {
    let request: Request =
        serde_json::from_value(json!({ "id": "x", "method": "cancel", "params": { "request_id": "y" } }))
            .unwrap();
    assert_eq!(request.cancel_target(), Some("y"));

    let rejected = serde_json::from_value::<Request>(json!({ "id": "x", "method": "cancel" }));
    assert!(rejected.is_err());
}

#[test]
fn success_response_has_no_error_key() {
    let value: Value =
        serde_json::from_str(&Response::success("1", json!({ "rows": [] })).to_json()).unwrap();
    assert_eq!(value, json!({ "id": "1", "result": { "rows": [] } }));
}

#[test]
fn error_response_has_no_result_key() {
    let response = bibot_mcp::protocol::create_error_response(
        "2",
        bibot_mcp::protocol::ErrorCode::InvalidParams,
        "limit must be positive",
        Some(json!({ "field": "limit" })),
    );
    let value: Value = serde_json::from_str(&response.to_json()).unwrap();
    assert_eq!(
        value,
        json!({
            "id": "2",
            "error": { "code": -32602, "message": "limit must be positive", "data": { "field": "limit" } }
        })
    );
}

#[test]
fn explicit_null_result_is_a_success() {
    let response: Response = serde_json::from_str(r#"{"id":"3","result":null}"#).unwrap();
    assert!(!response.is_error());
    assert_eq!(response.result(), Some(&Value::Null));
}

#[test]
fn responses_survive_the_wire() {
    let original = Response::success("4", json!({ "chart": { "kind": "bar" } }));
    let parsed: Response = serde_json::from_str(&original.to_json()).unwrap();
    assert_eq!(parsed, original);
}
