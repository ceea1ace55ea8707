//! HTTP request-id propagation.
//!
//! Every request gets an id: the inbound `X-Request-ID` header when present
//! and sane, otherwise a fresh UUID. The id is stored as a request
//! extension, attached to the request's tracing span, and echoed on the
//! response.

use std::time::Instant;

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use tracing::{info, info_span, Instrument};

/// Header carrying the correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest inbound id accepted verbatim.
const MAX_INBOUND_LEN: usize = 128;

/// Correlation id of the current HTTP request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

/// `axum::middleware::from_fn` layer: assign, log, and echo the request id.
pub async fn propagate_request_id(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty() && s.len() <= MAX_INBOUND_LEN)
        .map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned);

    request.extensions_mut().insert(RequestId(id.clone()));
    let span = info_span!(
        "http",
        request_id = %id,
        method = %request.method(),
        path = %request.uri().path()
    );

    let started = Instant::now();
    let mut response = next.run(request).instrument(span.clone()).await;

    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    span.in_scope(|| {
        info!(
            status = response.status().as_u16(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "http request served"
        );
    });
    response
}
