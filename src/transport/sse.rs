//! SSE transport: `POST {base}/mcp/sse`, response body is an event stream.
//!
//! Frames follow the event-stream format: `event:` and `data:` lines
//! terminated by a blank line. `progress` events carry
//! `{"id", "progress": {...}}`; the single `response` event carries the
//! response envelope and ends the call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::http::{build_client, join_url};
use super::{CallStream, StreamEvent, STREAM_CAPACITY};
use crate::protocol::{McpError, Progress, Request, Response};
use crate::Result;

/// Transport speaking the envelope over HTTP with server-sent events.
#[derive(Debug, Clone)]
pub struct SseTransport {
    client: reqwest::Client,
    endpoint: String,
    closed: Arc<AtomicBool>,
}

impl SseTransport {
    /// Create a transport for the server rooted at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`](crate::AppError::Config) for an empty URL
    /// or when the HTTP client cannot be built.
    pub fn new(base_url: &str) -> Result<Self> {
        Ok(Self {
            client: build_client()?,
            endpoint: join_url(base_url, "mcp/sse")?,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub(super) async fn send(&self, request: &Request, cancel: &CancellationToken) -> Response {
        self.open_stream(request.clone(), cancel.clone())
            .into_final(request.id())
            .await
    }

    pub(super) fn open_stream(&self, request: Request, cancel: CancellationToken) -> CallStream {
        let (tx, rx) = mpsc::channel(STREAM_CAPACITY);
        let this = self.clone();
        tokio::spawn(async move {
            let id = request.id().to_owned();
            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    McpError::cancelled("call cancelled by caller").into_response(&id)
                }
                outcome = this.run(&request, &tx) => {
                    outcome.unwrap_or_else(|err| err.into_response(&id))
                }
            };
            let _ = tx.send(StreamEvent::Final(response)).await;
        });
        CallStream::new(rx)
    }

    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn run(
        &self,
        request: &Request,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> std::result::Result<Response, McpError> {
        debug!(endpoint = %self.endpoint, request_id = request.id(), "sse open");
        let reply = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|err| McpError::transport(format!("sse request failed: {err}")))?;

        if !reply.status().is_success() {
            return Err(McpError::transport(format!("sse status {}", reply.status())));
        }

        let mut body = reply.bytes_stream();
        let mut parser = FrameParser::default();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|err| McpError::transport(format!("sse read failed: {err}")))?;
            for frame in parser.push(&chunk) {
                match frame.event.as_str() {
                    "progress" => match serde_json::from_str::<ProgressFrame>(&frame.data) {
                        Ok(p) => {
                            let _ = tx.send(StreamEvent::Progress(p.progress)).await;
                        }
                        Err(err) => warn!(error = %err, "sse: malformed progress frame"),
                    },
                    "response" => {
                        return serde_json::from_str::<Response>(&frame.data).map_err(|err| {
                            McpError::transport(format!("malformed response frame: {err}"))
                        });
                    }
                    other => debug!(event = other, "sse: ignoring event"),
                }
            }
        }

        Err(McpError::transport("sse stream ended before response"))
    }
}

#[derive(Debug, Deserialize)]
struct ProgressFrame {
    progress: Progress,
}

/// One decoded event-stream frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    /// `event:` field; `message` when absent.
    pub event: String,
    /// Concatenated `data:` lines.
    pub data: String,
}

/// Incremental event-stream frame parser.
///
/// Bytes are buffered raw and only complete blocks are decoded, so a
/// character split across chunks survives intact.
#[derive(Debug, Default)]
pub struct FrameParser {
    buf: BytesMut,
}

impl FrameParser {
    /// Feed bytes; return every frame completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buf.extend_from_slice(chunk);
        if self.buf.contains(&b'\r') {
            self.buf = strip_crlf(&self.buf);
        }

        let mut frames = Vec::new();
        while let Some(end) = self.buf.windows(2).position(|w| w == b"\n\n") {
            let block = self.buf.split_to(end + 2);
            match std::str::from_utf8(&block) {
                Ok(text) => frames.extend(parse_block(text)),
                Err(err) => warn!(error = %err, "sse: dropping non-UTF-8 frame"),
            }
        }
        frames
    }
}

/// Turn `\r\n` into `\n`. A trailing `\r` is kept until its `\n` arrives.
fn strip_crlf(buf: &[u8]) -> BytesMut {
    let mut out = BytesMut::with_capacity(buf.len());
    for (i, &byte) in buf.iter().enumerate() {
        if byte == b'\r' && buf.get(i + 1) == Some(&b'\n') {
            continue;
        }
        out.put_u8(byte);
    }
    out
}

fn parse_block(block: &str) -> Option<SseFrame> {
    let mut event = None;
    let mut data: Vec<&str> = Vec::new();
    for line in block.lines() {
        if line.starts_with(':') {
            continue;
        }
        let (field, value) = line.split_once(':').unwrap_or((line, ""));
        let value = value.strip_prefix(' ').unwrap_or(value);
        match field {
            "event" => event = Some(value.to_owned()),
            "data" => data.push(value),
            _ => {}
        }
    }
    if event.is_none() && data.is_empty() {
        return None;
    }
    Some(SseFrame {
        event: event.unwrap_or_else(|| "message".to_owned()),
        data: data.join("\n"),
    })
}
