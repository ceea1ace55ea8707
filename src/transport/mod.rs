//! Envelope delivery across process and network boundaries.
//!
//! [`Transport`] is a closed set of four variants sharing one contract:
//! deliver a [`Request`], await its [`Response`], and honour cancellation.
//! No variant ever surfaces an I/O error directly: connection-level
//! failures come back as `TRANSPORT_ERROR` responses so the router can
//! decide whether to retry.

pub mod codec;
pub mod http;
pub mod in_process;
pub mod sse;
pub mod stdio;

use std::fmt::{Display, Formatter};
use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::protocol::{ClientInfo, McpError, Progress, Request, Response, ServerInfo};

pub use self::http::HttpTransport;
pub use in_process::InProcessTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;

/// Buffered events per open stream.
pub(crate) const STREAM_CAPACITY: usize = 64;

/// Transport variant tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Same process.
    InProcess,
    /// Loopback or remote HTTP.
    Http,
    /// HTTP with server-sent events.
    Sse,
    /// NDJSON over a child's stdin/stdout.
    Stdio,
}

impl Display for TransportKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::InProcess => "in_process",
            Self::Http => "http",
            Self::Sse => "sse",
            Self::Stdio => "stdio",
        })
    }
}

/// Item yielded by a [`CallStream`].
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Partial progress; zero or more precede the final event.
    Progress(Progress),
    /// Terminal response; exactly one per stream.
    Final(Response),
}

/// Stream of [`StreamEvent`]s for one call.
#[derive(Debug)]
pub struct CallStream {
    rx: mpsc::Receiver<StreamEvent>,
}

impl CallStream {
    /// Wrap a receiver fed by a transport task.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<StreamEvent>) -> Self {
        Self { rx }
    }

    /// Stream that yields `response` and ends.
    #[must_use]
    pub fn ready(response: Response) -> Self {
        let (tx, rx) = mpsc::channel(1);
        // Capacity 1 and a fresh receiver: cannot fail.
        let _ = tx.try_send(StreamEvent::Final(response));
        Self { rx }
    }

    /// Receive the next event.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.rx.recv().await
    }

    /// Drain the stream, discarding progress, and return the final response.
    ///
    /// A stream that ends without a final event yields a `TRANSPORT_ERROR`
    /// response keyed by `id`.
    pub async fn into_final(mut self, id: &str) -> Response {
        while let Some(event) = self.rx.recv().await {
            if let StreamEvent::Final(response) = event {
                return response;
            }
        }
        McpError::transport("stream ended without a response").into_response(id)
    }
}

impl Stream for CallStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// One way of reaching an MCP server.
#[derive(Debug, Clone)]
pub enum Transport {
    /// Direct call into a [`ToolServer`](crate::server::ToolServer).
    InProcess(InProcessTransport),
    /// `POST {base}/mcp`.
    Http(HttpTransport),
    /// `POST {base}/mcp/sse` with an event-stream response.
    Sse(SseTransport),
    /// NDJSON over a reader/writer pair.
    Stdio(StdioTransport),
}

impl Transport {
    /// Negotiate capabilities with the server.
    ///
    /// # Errors
    ///
    /// Returns the server's error, or `TRANSPORT_ERROR` when the reply is
    /// not a valid [`ServerInfo`].
    pub async fn initialize(&self, client: &ClientInfo) -> Result<ServerInfo, McpError> {
        let request = Request::initialize(client);
        let value = self
            .send(&request, &CancellationToken::new())
            .await
            .into_result()?;
        serde_json::from_value(value)
            .map_err(|err| McpError::transport(format!("malformed initialize result: {err}")))
    }

    /// Deliver `request` and await its response.
    ///
    /// When `cancel` fires the in-flight operation is abandoned and a
    /// `CANCELLED` response is returned.
    pub async fn send(&self, request: &Request, cancel: &CancellationToken) -> Response {
        if self.is_closed() {
            return McpError::transport(format!("{} transport is closed", self.kind()))
                .into_response(request.id());
        }
        match self {
            Self::InProcess(t) => t.send(request, cancel).await,
            Self::Http(t) => t.send(request, cancel).await,
            Self::Sse(t) => t.send(request, cancel).await,
            Self::Stdio(t) => t.send(request, cancel).await,
        }
    }

    /// Deliver `request` and stream progress followed by the final response.
    ///
    /// Transports without native streaming yield a single final event.
    #[must_use]
    pub fn open_stream(&self, request: Request, cancel: CancellationToken) -> CallStream {
        match self {
            Self::InProcess(t) => t.open_stream(request, cancel),
            Self::Sse(t) => t.open_stream(request, cancel),
            Self::Http(_) | Self::Stdio(_) => {
                let (tx, rx) = mpsc::channel(1);
                let transport = self.clone();
                tokio::spawn(async move {
                    let response = transport.send(&request, &cancel).await;
                    let _ = tx.send(StreamEvent::Final(response)).await;
                });
                CallStream::new(rx)
            }
        }
    }

    /// Tell the peer that call `id` was abandoned.
    ///
    /// Only stdio needs an explicit envelope; the other variants stop the
    /// work by dropping the in-flight operation.
    pub fn abandon(&self, id: &str) {
        if let Self::Stdio(t) = self {
            t.send_cancel(id);
        }
    }

    /// Whether progress events are delivered before the final response.
    #[must_use]
    pub const fn supports_streaming(&self) -> bool {
        matches!(self, Self::InProcess(_) | Self::Sse(_))
    }

    /// Variant tag.
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::InProcess(_) => TransportKind::InProcess,
            Self::Http(_) => TransportKind::Http,
            Self::Sse(_) => TransportKind::Sse,
            Self::Stdio(_) => TransportKind::Stdio,
        }
    }

    /// Release the underlying connection or process.
    pub async fn close(&self) {
        match self {
            Self::InProcess(t) => t.close(),
            Self::Http(t) => t.close(),
            Self::Sse(t) => t.close(),
            Self::Stdio(t) => t.close().await,
        }
    }

    /// Whether [`Transport::close`] was called or the peer went away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::InProcess(t) => t.is_closed(),
            Self::Http(t) => t.is_closed(),
            Self::Sse(t) => t.is_closed(),
            Self::Stdio(t) => t.is_closed(),
        }
    }
}

impl From<InProcessTransport> for Transport {
    fn from(t: InProcessTransport) -> Self {
        Self::InProcess(t)
    }
}

impl From<HttpTransport> for Transport {
    fn from(t: HttpTransport) -> Self {
        Self::Http(t)
    }
}

impl From<SseTransport> for Transport {
    fn from(t: SseTransport) -> Self {
        Self::Sse(t)
    }
}

impl From<StdioTransport> for Transport {
    fn from(t: StdioTransport) -> Self {
        Self::Stdio(t)
    }
}
