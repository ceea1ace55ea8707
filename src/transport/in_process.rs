//! Same-process transport: calls straight into a [`ToolServer`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CallStream, StreamEvent, STREAM_CAPACITY};
use crate::protocol::{McpError, Request, Response};
use crate::server::{ToolContext, ToolServer};

/// Transport that dispatches to a [`ToolServer`] without serialization.
#[derive(Debug, Clone)]
pub struct InProcessTransport {
    server: Arc<ToolServer>,
    closed: Arc<AtomicBool>,
}

impl InProcessTransport {
    /// Wrap `server`.
    #[must_use]
    pub fn new(server: Arc<ToolServer>) -> Self {
        Self {
            server,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The wrapped server.
    #[must_use]
    pub fn server(&self) -> &Arc<ToolServer> {
        &self.server
    }

    pub(super) async fn send(&self, request: &Request, cancel: &CancellationToken) -> Response {
        let ctx = ToolContext::new(request.id()).with_cancel(cancel.child_token());
        tokio::select! {
            biased;
            () = cancel.cancelled() => cancelled(request.id()),
            response = self.server.handle(request.clone(), ctx) => response,
        }
    }

    pub(super) fn open_stream(&self, request: Request, cancel: CancellationToken) -> CallStream {
        let (event_tx, event_rx) = mpsc::channel(STREAM_CAPACITY);
        let (progress_tx, mut progress_rx) = mpsc::channel(STREAM_CAPACITY);
        let server = Arc::clone(&self.server);

        tokio::spawn(async move {
            let id = request.id().to_owned();
            let ctx = ToolContext::new(&id)
                .with_cancel(cancel.child_token())
                .with_progress(progress_tx);
            let call = server.handle(request, ctx);
            tokio::pin!(call);

            let response = loop {
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => break cancelled(&id),
                    Some(progress) = progress_rx.recv() => {
                        if event_tx.send(StreamEvent::Progress(progress)).await.is_err() {
                            // Consumer dropped the stream; abandon the call.
                            cancel.cancel();
                        }
                    }
                    response = &mut call => break response,
                }
            };

            // Flush progress emitted just before completion.
            while let Ok(progress) = progress_rx.try_recv() {
                let _ = event_tx.send(StreamEvent::Progress(progress)).await;
            }
            let _ = event_tx.send(StreamEvent::Final(response)).await;
        });

        CallStream::new(event_rx)
    }

    pub(super) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn cancelled(id: &str) -> Response {
    McpError::cancelled("call cancelled by caller").into_response(id)
}
