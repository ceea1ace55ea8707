//! HTTP surface of the router.
//!
//! | Route | Purpose |
//! |---|---|
//! | `POST /mcp` | one request envelope in, one response envelope out |
//! | `GET\|POST /mcp/sse` | tool call streamed as `progress` events then a `response` event |
//! | `POST /mcp/cancel/{request_id}` | cancel a live call |
//! | `GET /mcp/health` | router, server, and call summary |
//!
//! Protocol failures are reported inside the envelope with HTTP 200 so
//! that clients only need one decoding path.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{middleware, Extension, Json};
use futures_util::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::middleware::{propagate_request_id, RequestId};
use crate::protocol::{McpError, Method, Request, Response};
use crate::router::{CallOptions, Router};
use crate::transport::{CallStream, StreamEvent};
use crate::{AppError, Result};

/// Build the axum application.
pub fn app(router: Arc<Router>) -> axum::Router {
    axum::Router::new()
        .route("/mcp", post(post_mcp))
        .route("/mcp/sse", get(get_sse).post(post_sse))
        .route("/mcp/cancel/{request_id}", post(post_cancel))
        .route("/mcp/health", get(get_health))
        .layer(middleware::from_fn(propagate_request_id))
        .with_state(router)
}

/// Serve [`app`] on `listener` until `ct` is cancelled.
///
/// # Errors
///
/// Returns `AppError::Transport` if the server fails.
pub async fn serve_http(
    router: Arc<Router>,
    listener: TcpListener,
    ct: CancellationToken,
) -> Result<()> {
    let local = listener
        .local_addr()
        .map_err(|err| AppError::Transport(format!("listener has no address: {err}")))?;
    info!(%local, "http surface listening");

    axum::serve(listener, app(router))
        .with_graceful_shutdown(async move { ct.cancelled().await })
        .await
        .map_err(|err| AppError::Transport(format!("http server error: {err}")))?;

    info!("http surface shut down");
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────────

async fn post_mcp(
    State(router): State<Arc<Router>>,
    Extension(RequestId(http_id)): Extension<RequestId>,
    body: Bytes,
) -> Json<Response> {
    let request = match decode(&body) {
        Ok(request) => request,
        Err(response) => return Json(response),
    };
    debug!(%http_id, request_id = request.id(), method = %request.method(), "mcp request");
    Json(router.handle(request).await)
}

async fn post_sse(State(router): State<Arc<Router>>, body: Bytes) -> HttpResponse {
    match decode(&body) {
        Ok(request) => stream_response(&router, request).await,
        Err(response) => {
            let id = response.id().to_owned();
            sse(CallStream::ready(response), id)
        }
    }
}

/// Query form of a streamed tool call.
#[derive(Debug, Deserialize)]
struct SseQuery {
    tool: String,
    #[serde(default)]
    arguments: Option<String>,
    #[serde(default)]
    id: Option<String>,
}

async fn get_sse(State(router): State<Arc<Router>>, Query(query): Query<SseQuery>) -> HttpResponse {
    let request = query_request(&query);
    match request {
        Ok(request) => stream_response(&router, request).await,
        Err(err) => {
            let id = query.id.unwrap_or_default();
            sse(CallStream::ready(err.into_response(id.clone())), id)
        }
    }
}

async fn post_cancel(
    State(router): State<Arc<Router>>,
    Path(request_id): Path<String>,
) -> Json<Value> {
    let cancelled = router.cancel(&request_id);
    Json(json!({ "cancelled": cancelled, "request_id": request_id }))
}

async fn get_health(State(router): State<Arc<Router>>) -> HttpResponse {
    Json(router.health()).into_response()
}

// ── Helpers ──────────────────────────────────────────────────────────

/// Parse a body into a request, or the error envelope to send back.
fn decode(body: &[u8]) -> std::result::Result<Request, Response> {
    let value: Value = serde_json::from_slice(body).map_err(|err| {
        McpError::parse_error(format!("invalid json: {err}")).into_response("")
    })?;
    let id = salvage_id(&value);
    Request::from_value(value).map_err(|err| err.into_response(id))
}

/// Best-effort id of a rejected envelope, so the error can be correlated.
fn salvage_id(value: &Value) -> String {
    match value.get("id") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn query_request(query: &SseQuery) -> std::result::Result<Request, McpError> {
    let arguments = match query.arguments.as_deref() {
        None | Some("") => json!({}),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|err| McpError::parse_error(format!("invalid json in arguments: {err}")))?,
    };
    let request = Request::tools_call(&query.tool, arguments)?;
    match &query.id {
        Some(id) => request.with_id(id.clone()),
        None => Ok(request),
    }
}

async fn stream_response(router: &Arc<Router>, request: Request) -> HttpResponse {
    let id = request.id().to_owned();
    let stream = match request.method() {
        Method::ToolsCall | Method::ResourcesRead => {
            router.open_stream(request, CallOptions::default())
        }
        _ => CallStream::ready(router.handle(request).await),
    };
    sse(stream, id)
}

fn sse(stream: CallStream, id: String) -> HttpResponse {
    let events = stream.map(move |event| Ok::<_, Infallible>(to_event(&id, &event)));
    Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response()
}

fn to_event(id: &str, event: &StreamEvent) -> Event {
    match event {
        StreamEvent::Progress(progress) => Event::default()
            .event("progress")
            .data(json!({ "id": id, "progress": progress }).to_string()),
        StreamEvent::Final(response) => Event::default()
            .event("response")
            .data(response.to_json()),
    }
}
