//! Shape of `initialize`, `tools/list`, and `resources/list` results as
//! seen by clients of the router.

use std::sync::Arc;

use bibot_mcp::builtin::{builtin_server, BUILTIN_SERVER};
use bibot_mcp::config::RouterConfig;
use bibot_mcp::protocol::{
    ClientInfo, Request, Resource, ResourceContents, ServerInfo, Tool, PROTOCOL_VERSION,
};
use bibot_mcp::router::{RegisterOptions, Router};
use bibot_mcp::server::{ToolContext, ToolError, ToolServer};
use bibot_mcp::transport::{InProcessTransport, Transport};
use serde_json::{json, Map, Value};

fn transport(server: ToolServer) -> Arc<Transport> {
    Arc::new(InProcessTransport::new(Arc::new(server)).into())
}

fn lookup_server(name: &str, description: &str) -> ToolServer {
    let server = ToolServer::new(name, "1.0.0");
    let owner = name.to_owned();
    server.register_tool(
        Tool::new("lookup", description, json!({ "type": "object" })).with_tag("search"),
        move |_args: Map<String, Value>, _ctx: ToolContext| {
            let owner = owner.clone();
            async move { Ok::<_, ToolError>(json!({ "served_by": owner })) }
        },
    );
    server
}

async fn router() -> Router {
    let router = Router::new("contract-router", "9.9.9", &RouterConfig::default());
    router
        .register_server(BUILTIN_SERVER, transport(builtin_server()), RegisterOptions::default())
        .await
        .unwrap();
    router
}

#[tokio::test]
async fn tools_list_entries_have_the_published_fields() {
    let router = router().await;
    let response = router.handle(Request::tools_list()).await;
    let tools = response.result().unwrap()["tools"].as_array().unwrap().clone();

    assert_eq!(tools.len(), 2);
    let wait = tools.iter().find(|t| t["name"] == "wait").unwrap();
    assert!(wait["description"].is_string());
    assert_eq!(wait["parameter_schema"]["required"], json!(["ms"]));
    assert_eq!(wait["capability_tags"], json!(["diagnostics"]));

    let parsed: Vec<Tool> = serde_json::from_value(Value::Array(tools)).unwrap();
    assert_eq!(parsed, router.list_tools());
}

#[tokio::test]
async fn higher_priority_definition_shadows_lower() {
    let router = router().await;
    router
        .register_server(
            "secondary",
            transport(lookup_server("secondary", "fallback lookup")),
            RegisterOptions::default(),
        )
        .await
        .unwrap();
    router
        .register_server(
            "primary",
            transport(lookup_server("primary", "preferred lookup")),
            RegisterOptions {
                priority: 10,
                ..RegisterOptions::default()
            },
        )
        .await
        .unwrap();

    let lookups: Vec<Tool> = router
        .list_tools()
        .into_iter()
        .filter(|t| t.name == "lookup")
        .collect();
    assert_eq!(lookups.len(), 1);
    assert_eq!(lookups[0].description, "preferred lookup");
    assert_eq!(router.find_tool("lookup").as_deref(), Some("primary"));

    let response = router
        .handle(Request::tools_call("lookup", json!({})).unwrap())
        .await;
    assert_eq!(response.result(), Some(&json!({ "served_by": "primary" })));
}

#[tokio::test]
async fn initialize_reports_router_identity() {
    let router = router().await;
    let response = router.handle(Request::initialize(&ClientInfo::router())).await;
    let info: ServerInfo = serde_json::from_value(response.result().unwrap().clone()).unwrap();

    assert_eq!(info.name, "contract-router");
    assert_eq!(info.version, "9.9.9");
    assert_eq!(info.protocol_version, PROTOCOL_VERSION);
    assert_eq!(info.capabilities.len(), 5);
}

#[tokio::test]
async fn resources_are_listed_and_read_through_their_owner() {
    let router = router().await;
    let docs = ToolServer::new("docs", "1.0.0");
    docs.register_resource(
        Resource {
            uri: "docs://glossary".into(),
            name: "Glossary".into(),
            description: Some("Business terms".into()),
            mime_type: Some("text/markdown".into()),
        },
        ResourceContents {
            uri: "docs://glossary".into(),
            mime_type: Some("text/markdown".into()),
            text: "# ARR\nAnnual recurring revenue".into(),
        },
    );
    router
        .register_server("docs", transport(docs), RegisterOptions::default())
        .await
        .unwrap();

    let response = router.handle(Request::resources_list()).await;
    assert_eq!(
        response.result().unwrap()["resources"],
        json!([{
            "uri": "docs://glossary",
            "name": "Glossary",
            "description": "Business terms",
            "mime_type": "text/markdown"
        }])
    );

    let contents = router.read_resource("docs://glossary").await.unwrap();
    assert!(contents.text.starts_with("# ARR"));

    let err = router.read_resource("docs://missing").await.unwrap_err();
    assert_eq!(err.code, bibot_mcp::protocol::ErrorCode::InvalidParams);
}
