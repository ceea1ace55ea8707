use bibot_mcp::protocol::{ClientInfo, ErrorCode, McpError, Method, Request, Response};
use serde_json::json;

#[test]
fn generated_ids_are_unique_and_non_empty() {
    let a = Request::tools_list();
    let b = Request::tools_list();
    assert!(!a.id().is_empty());
    assert_ne!(a.id(), b.id());
}

#[test]
fn tools_call_defaults_missing_arguments_to_empty_object() {
    let request = Request::new("1", "tools/call", json!({ "name": "echo" })).unwrap();
    assert_eq!(request.tool_name(), Some("echo"));
    assert_eq!(request.arguments().map(serde_json::Map::len), Some(0));
}

#[test]
fn numeric_ids_are_accepted_as_strings() {
    let request = Request::from_json(r#"{"id": 42, "method": "tools/list"}"#).unwrap();
    assert_eq!(request.id(), "42");
    assert_eq!(request.method(), Method::ToolsList);
}

#[test]
fn rejects_empty_and_missing_ids() {
    let err = Request::new("  ", "tools/list", json!({})).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);

    let err = Request::from_json(r#"{"method": "tools/list"}"#).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);

    let err = Request::tools_list().with_id("").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[test]
fn rejects_non_object_envelopes_and_params() {
    let err = Request::from_json("[1,2]").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);

    let err = Request::new("1", "tools/list", json!("x")).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);
}

#[test]
fn method_specific_params_are_required() {
    let err = Request::new("1", "tools/call", json!({})).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);

    let err = Request::resources_read("").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);

    let err = Request::cancel("").unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);

    let err = Request::tools_call("echo", json!(5)).unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidParams);
    assert_eq!(err.data, Some(json!({ "field": "arguments" })));
}

#[test]
fn unknown_method_carries_its_name() {
    let err = Request::new("1", "prompts/list", json!({})).unwrap_err();
    assert_eq!(err.code, ErrorCode::MethodNotFound);
    assert_eq!(err.data, Some(json!({ "method": "prompts/list" })));
}

#[test]
fn method_names_round_trip() {
    for method in [
        Method::Initialize,
        Method::ToolsList,
        Method::ToolsCall,
        Method::ResourcesList,
        Method::ResourcesRead,
        Method::Cancel,
    ] {
        assert_eq!(method.as_str().parse::<Method>().unwrap(), method);
    }
}

#[test]
fn accessors_expose_targets() {
    let read = Request::resources_read("report://q3").unwrap();
    assert_eq!(read.resource_uri(), Some("report://q3"));
    assert_eq!(read.tool_name(), None);

    let cancel = Request::cancel("abc").unwrap();
    assert_eq!(cancel.cancel_target(), Some("abc"));

    let init = Request::initialize(&ClientInfo::router());
    assert_eq!(init.method(), Method::Initialize);
    assert_eq!(init.params()["name"], "bibot-mcp-router");
}

#[test]
fn response_has_exactly_one_of_result_or_error() {
    let ok = Response::success("1", json!({ "rows": 3 }));
    assert!(!ok.is_error());
    assert!(ok.error().is_none());
    assert_eq!(ok.clone().into_result().unwrap(), json!({ "rows": 3 }));

    let failed = McpError::internal("boom").into_response("1");
    assert!(failed.is_error());
    assert!(failed.result().is_none());
    assert_eq!(failed.error_code(), Some(ErrorCode::InternalError));
    assert_eq!(failed.into_result().unwrap_err().message, "boom");
}

#[test]
fn response_with_both_fields_is_rejected() {
    let raw = r#"{"id":"1","result":{},"error":{"code":-32603,"message":"x"}}"#;
    assert!(serde_json::from_str::<Response>(raw).is_err());

    let raw = r#"{"id":"1"}"#;
    assert!(serde_json::from_str::<Response>(raw).is_err());
}

#[test]
fn response_id_can_be_rewritten() {
    let response = Response::success("inner", json!(null)).with_id("outer");
    assert_eq!(response.id(), "outer");
}
