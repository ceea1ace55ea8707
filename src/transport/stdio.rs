//! Stdio transport: NDJSON envelopes over a reader/writer pair.
//!
//! Usually the pair is a sidecar child's stdout/stdin, but any
//! `AsyncRead`/`AsyncWrite` works (tests use [`tokio::io::duplex`]).
//!
//! Two background tasks own the I/O halves:
//! - the writer drains an outbound queue and writes one line per envelope;
//! - the reader decodes frames and completes the waiting caller whose
//!   request id matches.
//!
//! EOF, a read error, or a write failure closes the transport; every call
//! still waiting then resolves to `TRANSPORT_ERROR`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::codec::FrameCodec;
use crate::protocol::{McpError, Request, Response};
use crate::sidecar::spawner;
use crate::{AppError, Result};

/// Outbound queue depth.
const OUTBOUND_CAPACITY: usize = 256;

/// Grace period between SIGTERM and SIGKILL when closing a child.
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

type PendingTable = Mutex<HashMap<String, oneshot::Sender<Response>>>;

/// Transport over a newline-delimited JSON pipe.
#[derive(Debug, Clone)]
pub struct StdioTransport {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    shared: Arc<Shared>,
    outbound: mpsc::Sender<String>,
    child: tokio::sync::Mutex<Option<Child>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: stop the background tasks.
        self.shared.closed.cancel();
    }
}

/// State shared with the reader and writer tasks.
#[derive(Debug)]
struct Shared {
    label: String,
    pending: PendingTable,
    closed: CancellationToken,
}

impl StdioTransport {
    /// Start a transport over an arbitrary reader/writer pair.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn from_io<R, W>(label: impl Into<String>, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let shared = Arc::new(Shared {
            label: label.into(),
            pending: Mutex::new(HashMap::new()),
            closed: CancellationToken::new(),
        });

        tokio::spawn(run_reader(Arc::clone(&shared), reader));
        tokio::spawn(run_writer(Arc::clone(&shared), writer, outbound_rx));

        Self {
            inner: Arc::new(Inner {
                shared,
                outbound,
                child: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Start a transport over a spawned child's stdin/stdout.
    ///
    /// The child is owned by the transport and terminated on
    /// [`close`](super::Transport::close).
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Sidecar`] when the child's pipes were not captured.
    pub fn from_child(label: impl Into<String>, mut child: Child) -> Result<Self> {
        let label = label.into();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Sidecar(format!("{label}: failed to capture stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Sidecar(format!("{label}: failed to capture stdout")))?;
        if let Some(stderr) = child.stderr.take() {
            spawner::forward_stderr(label.clone(), stderr);
        }

        let transport = Self::from_io(label, stdout, stdin);
        if let Ok(mut slot) = transport.inner.child.try_lock() {
            *slot = Some(child);
        }
        Ok(transport)
    }

    /// Label used in logs (sidecar name).
    #[must_use]
    pub fn label(&self) -> &str {
        &self.inner.shared.label
    }

    /// Resolves once the transport has closed for any reason.
    pub async fn closed(&self) {
        self.inner.shared.closed.cancelled().await;
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.shared.lock_pending().len()
    }

    pub(super) async fn send(&self, request: &Request, cancel: &CancellationToken) -> Response {
        let id = request.id();
        let (tx, rx) = oneshot::channel();
        let shared = &self.inner.shared;
        let slot = match PendingSlot::insert(shared, id, tx) {
            Ok(slot) => slot,
            Err(err) => return err.into_response(id),
        };

        if self.inner.outbound.send(request.to_json()).await.is_err() {
            return McpError::transport(format!("{}: writer closed", shared.label))
                .into_response(id);
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.send_cancel(id);
                McpError::cancelled("call cancelled by caller").into_response(id)
            }
            reply = rx => reply.unwrap_or_else(|_| {
                McpError::transport(format!("{}: connection closed", shared.label))
                    .into_response(id)
            }),
        };
        drop(slot);
        response
    }

    pub(super) async fn close(&self) {
        self.inner.shared.shutdown("closed by owner");
        let child = self.inner.child.lock().await.take();
        if let Some(mut child) = child {
            spawner::terminate(&mut child, TERMINATE_GRACE).await;
        }
    }

    pub(super) fn is_closed(&self) -> bool {
        self.inner.shared.closed.is_cancelled()
    }

    /// Best-effort: tell the peer to stop working on `target`.
    pub(super) fn send_cancel(&self, target: &str) {
        if let Ok(cancel) = Request::cancel(target) {
            if self.inner.outbound.try_send(cancel.to_json()).is_err() {
                debug!(label = %self.label(), target, "could not queue cancel envelope");
            }
        }
    }
}

impl Shared {
    fn lock_pending(&self) -> std::sync::MutexGuard<'_, HashMap<String, oneshot::Sender<Response>>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark closed and fail every waiting call by dropping its sender.
    fn shutdown(&self, reason: &str) {
        if !self.closed.is_cancelled() {
            info!(label = %self.label, reason, "stdio transport closed");
        }
        self.closed.cancel();
        self.lock_pending().clear();
    }
}

/// Pending-table entry removed when the waiting call finishes or is dropped.
struct PendingSlot<'a> {
    shared: &'a Shared,
    id: String,
}

impl<'a> PendingSlot<'a> {
    fn insert(
        shared: &'a Shared,
        id: &str,
        tx: oneshot::Sender<Response>,
    ) -> std::result::Result<Self, McpError> {
        let mut pending = shared.lock_pending();
        if shared.closed.is_cancelled() {
            return Err(McpError::transport(format!("{}: transport is closed", shared.label)));
        }
        if pending.contains_key(id) {
            return Err(McpError::invalid_request(format!(
                "request id {id} already in flight"
            )));
        }
        pending.insert(id.to_owned(), tx);
        Ok(Self {
            shared,
            id: id.to_owned(),
        })
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().remove(&self.id);
    }
}

// ── Background tasks ──────────────────────────────────────────────────────────

async fn run_reader<R>(inner: Arc<Shared>, reader: R)
where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, FrameCodec::new());

    let reason = loop {
        tokio::select! {
            biased;

            () = inner.closed.cancelled() => break "closed",

            item = framed.next() => match item {
                None => break "peer closed stdout",
                Some(Err(err)) => {
                    warn!(label = %inner.label, %err, "stdio reader: read failed");
                    break "read error";
                }
                Some(Ok(line)) => dispatch_line(&inner, &line),
            },
        }
    };

    inner.shutdown(reason);
}

fn dispatch_line(inner: &Shared, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    match serde_json::from_str::<Response>(line) {
        Ok(response) => {
            let waiter = inner.lock_pending().remove(response.id());
            match waiter {
                Some(tx) => {
                    let _ = tx.send(response);
                }
                None => debug!(
                    label = %inner.label,
                    request_id = response.id(),
                    "stdio reader: response for unknown or abandoned call"
                ),
            }
        }
        Err(err) => warn!(label = %inner.label, error = %err, "stdio reader: undecodable frame"),
    }
}

async fn run_writer<W>(inner: Arc<Shared>, mut writer: W, mut rx: mpsc::Receiver<String>)
where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        let line = tokio::select! {
            biased;
            () = inner.closed.cancelled() => break,
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
        };

        let mut bytes = line.into_bytes();
        bytes.push(b'\n');
        let written = match writer.write_all(&bytes).await {
            Ok(()) => writer.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(label = %inner.label, error = %err, "stdio writer: write failed");
            inner.shutdown("write error");
            break;
        }
    }
    let _ = writer.shutdown().await;
}
