//! HTTP transport: one `POST {base}/mcp` per request.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{McpError, Request, Response};
use crate::{AppError, Result};

/// Connect timeout applied to every HTTP and SSE client.
pub(crate) const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Transport speaking the JSON envelope over plain HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    closed: Arc<AtomicBool>,
}

impl HttpTransport {
    /// Create a transport for the server rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] for an empty URL or when the HTTP client
    /// cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: join_url(base_url, "mcp")?,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Full endpoint URL.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(super) async fn send(&self, request: &Request, cancel: &CancellationToken) -> Response {
        let id = request.id();
        tokio::select! {
            biased;
            // Dropping the request future closes the connection.
            () = cancel.cancelled() => McpError::cancelled("call cancelled by caller").into_response(id),
            response = self.post(request) => response.unwrap_or_else(|err| err.into_response(id)),
        }
    }

    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn post(&self, request: &Request) -> std::result::Result<Response, McpError> {
        debug!(endpoint = %self.endpoint, request_id = request.id(), method = %request.method(), "http send");
        let reply = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|err| McpError::transport(format!("http request failed: {err}")))?;

        let status = reply.status();
        let body = reply
            .bytes()
            .await
            .map_err(|err| McpError::transport(format!("http body read failed: {err}")))?;

        // Error envelopes may arrive with a non-2xx status; prefer the envelope.
        match serde_json::from_slice::<Response>(&body) {
            Ok(response) => Ok(response),
            Err(_) if !status.is_success() => {
                Err(McpError::transport(format!("http status {status}")))
            }
            Err(err) => Err(McpError::transport(format!("undecodable response: {err}"))),
        }
    }
}

pub(crate) fn build_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|err| AppError::Config(format!("failed to build http client: {err}")))
}

pub(crate) fn join_url(base_url: &str, path: &str) -> Result<String> {
    let base = base_url.trim().trim_end_matches('/');
    if base.is_empty() {
        return Err(AppError::Config("base url must not be empty".into()));
    }
    Ok(format!("{base}/{path}"))
}
