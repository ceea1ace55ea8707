//! Serve a [`ToolServer`] over newline-delimited JSON on a reader/writer pair.
//!
//! This is the sidecar side of the stdio transport: the router spawns the
//! sidecar binary and talks to it through its stdin/stdout. Requests are
//! served concurrently; responses are written in completion order and
//! correlated by id. A `cancel` envelope cancels the targeted execution.

use std::sync::Arc;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ToolContext, ToolServer};
use crate::protocol::{Method, Request};
use crate::transport::codec::FrameCodec;
use crate::{AppError, Result};

/// Outbound queue depth between request tasks and the writer.
const OUTBOUND_CAPACITY: usize = 256;

/// Serve `server` until `reader` reaches EOF or `ct` is cancelled.
///
/// On exit, executions still running are cancelled and their (cancelled)
/// responses are flushed before the writer stops.
///
/// # Errors
///
/// Returns [`AppError::Transport`] when the writer fails.
pub async fn serve_stdio<R, W>(
    server: Arc<ToolServer>,
    reader: R,
    writer: W,
    ct: CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, out_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let writer_task = tokio::spawn(write_frames(writer, out_rx));

    let calls_ct = ct.child_token();
    let mut calls = JoinSet::new();
    let mut framed = FramedRead::new(reader, FrameCodec::new());

    info!(server = %server.info().name, "stdio server ready");

    loop {
        tokio::select! {
            biased;

            () = ct.cancelled() => {
                debug!("stdio server: cancellation received, stopping");
                break;
            }

            Some(_) = calls.join_next(), if !calls.is_empty() => {}

            item = framed.next() => match item {
                None => {
                    debug!("stdio server: input closed");
                    break;
                }
                Some(Err(err)) => {
                    warn!(%err, "stdio server: read failed, stopping");
                    break;
                }
                Some(Ok(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Request::from_json(&line) {
                        Ok(request) if request.method() == Method::Cancel => {
                            let id = request.id().to_owned();
                            let response = server.handle(request, ToolContext::new(id)).await;
                            if out_tx.send(response.to_json()).await.is_err() {
                                break;
                            }
                        }
                        Ok(request) => {
                            let server = Arc::clone(&server);
                            let tx = out_tx.clone();
                            let token = calls_ct.child_token();
                            calls.spawn(async move {
                                let ctx = ToolContext::new(request.id()).with_cancel(token);
                                let response = server.handle(request, ctx).await;
                                if tx.send(response.to_json()).await.is_err() {
                                    debug!("stdio server: writer gone, dropping response");
                                }
                            });
                        }
                        Err(err) => {
                            let id = salvage_id(&line);
                            warn!(request_id = %id, error = %err, "stdio server: rejected frame");
                            if out_tx.send(err.into_response(id).to_json()).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            },
        }
    }

    calls_ct.cancel();
    while calls.join_next().await.is_some() {}
    drop(out_tx);

    match writer_task.await {
        Ok(result) => result,
        Err(err) => Err(AppError::Transport(format!("stdio writer task failed: {err}"))),
    }
}

// ── Private helpers ───────────────────────────────────────────────────────────

async fn write_frames<W>(mut writer: W, mut rx: mpsc::Receiver<String>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(mut line) = rx.recv().await {
        line.push('\n');
        writer
            .write_all(line.as_bytes())
            .await
            .map_err(|e| AppError::Transport(format!("write failed: {e}")))?;
        writer
            .flush()
            .await
            .map_err(|e| AppError::Transport(format!("flush failed: {e}")))?;
    }
    Ok(())
}

/// Best-effort id recovery so that a rejected frame can still be answered.
fn salvage_id(line: &str) -> String {
    serde_json::from_str::<Value>(line)
        .ok()
        .and_then(|v| match v.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .unwrap_or_default()
}
