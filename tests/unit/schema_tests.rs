use bibot_mcp::builtin::builtin_server;
use bibot_mcp::protocol::{ErrorCode, Request};
use bibot_mcp::server::schema::{validate, validate_arguments};
use bibot_mcp::server::ToolContext;
use serde_json::{json, Map, Value};

fn report_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "metric": { "type": "string", "enum": ["revenue", "churn"] },
            "filters": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "column": { "type": "string" },
                        "value": { "type": ["string", "number"] }
                    },
                    "required": ["column"]
                }
            }
        },
        "required": ["metric"]
    })
}

#[test]
fn nested_violation_reports_full_path() {
    let args = json!({
        "metric": "revenue",
        "filters": [ { "column": "region", "value": "emea" }, { "column": 7 } ]
    });
    let err = validate(&report_schema(), &args).expect_err("column must be a string");
    assert_eq!(err.path, "$.filters[1].column");
    assert!(err.message.contains("expected string"), "{}", err.message);
    assert_eq!(err.to_string(), format!("$.filters[1].column: {}", err.message));
}

#[test]
fn union_types_accept_any_member() {
    let args = json!({ "metric": "churn", "filters": [ { "column": "age", "value": 30 } ] });
    assert!(validate(&report_schema(), &args).is_ok());

    let args = json!({ "metric": "churn", "filters": [ { "column": "age", "value": true } ] });
    let err = validate(&report_schema(), &args).expect_err("bool not allowed");
    assert_eq!(err.path, "$.filters[0].value");
}

#[test]
fn missing_nested_required_property() {
    let args = json!({ "metric": "churn", "filters": [ {} ] });
    let err = validate(&report_schema(), &args).expect_err("column required");
    assert_eq!(err.path, "$.filters[0].column");
}

#[test]
fn open_schemas_accept_anything() {
    let mut args = Map::new();
    args.insert("anything".into(), json!([1, "two", null]));
    assert!(validate_arguments(&json!({ "type": "object" }), &args).is_ok());
    assert!(validate_arguments(&json!(true), &args).is_ok());
}

#[tokio::test]
async fn server_rejects_arguments_failing_the_schema() {
    let server = builtin_server();
    let request = Request::tools_call("wait", json!({ "ms": "soon" })).unwrap();

    let response = server.handle(request, ToolContext::new("schema")).await;

    assert_eq!(response.error_code(), Some(ErrorCode::InvalidParams));
    let error = response.error().unwrap();
    assert!(error.message.contains("$.ms"), "{}", error.message);
}

#[tokio::test]
async fn server_rejects_unexpected_properties_on_closed_schema() {
    let server = builtin_server();
    let request = Request::tools_call("wait", json!({ "ms": 1, "extra": 1 })).unwrap();
    let response = server.handle(request, ToolContext::new("schema")).await;
    assert_eq!(response.error_code(), Some(ErrorCode::InvalidParams));
}
