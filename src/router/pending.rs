//! Table of calls the router is currently serving.
//!
//! An entry exists from the moment a call is accepted until it completes,
//! is cancelled, or times out. Entries are owned by a [`PendingGuard`], so
//! a caller that drops its future mid-call still releases the id.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::McpError;

/// Lifecycle of one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    /// Accepted, not yet routed.
    Created,
    /// Target resolved, about to be handed to the transport.
    Dispatched,
    /// Transport operation outstanding.
    InFlight,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Errored,
    /// Deadline elapsed.
    TimedOut,
    /// Cancelled by the caller.
    Cancelled,
}

impl CallState {
    /// Upper-case label used in logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "CREATED",
            Self::Dispatched => "DISPATCHED",
            Self::InFlight => "IN_FLIGHT",
            Self::Completed => "COMPLETED",
            Self::Errored => "ERRORED",
            Self::TimedOut => "TIMED_OUT",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Errored | Self::TimedOut | Self::Cancelled
        )
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One outstanding call.
#[derive(Debug, Clone)]
pub struct PendingCall {
    /// Request id; unique among live calls.
    pub id: String,
    /// Tool name or resource URI being served.
    pub tool: String,
    /// Absolute deadline.
    pub deadline: Instant,
    /// Fires on cancel or router shutdown.
    pub cancel_token: CancellationToken,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Current lifecycle state.
    pub state: CallState,
    /// Wall-clock acceptance time.
    pub started_at: DateTime<Utc>,
    seq: u64,
}

/// Serializable view of a [`PendingCall`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingSnapshot {
    /// Request id.
    pub id: String,
    /// Tool name or resource URI.
    pub tool: String,
    /// Current state.
    pub state: CallState,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Wall-clock acceptance time.
    pub started_at: DateTime<Utc>,
    /// Milliseconds until the deadline (0 once passed).
    pub remaining_ms: u64,
}

impl From<&PendingCall> for PendingSnapshot {
    fn from(call: &PendingCall) -> Self {
        let remaining = call.deadline.saturating_duration_since(Instant::now());
        Self {
            id: call.id.clone(),
            tool: call.tool.clone(),
            state: call.state,
            retry_count: call.retry_count,
            started_at: call.started_at,
            remaining_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

/// Id-keyed table of live calls.
#[derive(Debug, Default)]
pub struct PendingTable {
    calls: Mutex<HashMap<String, PendingCall>>,
    seq: AtomicU64,
}

impl PendingTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a call.
    ///
    /// # Errors
    ///
    /// `INVALID_REQUEST` when `id` is already live. The live entry is left
    /// untouched.
    pub fn insert(
        self: &Arc<Self>,
        id: &str,
        tool: &str,
        deadline: Instant,
        cancel_token: CancellationToken,
    ) -> Result<PendingGuard, McpError> {
        let mut calls = self.lock();
        if calls.contains_key(id) {
            return Err(McpError::invalid_request(format!(
                "request id {id} is already in flight"
            ))
            .with_data(serde_json::json!({ "request_id": id })));
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        calls.insert(
            id.to_owned(),
            PendingCall {
                id: id.to_owned(),
                tool: tool.to_owned(),
                deadline,
                cancel_token: cancel_token.clone(),
                retry_count: 0,
                state: CallState::Created,
                started_at: Utc::now(),
                seq,
            },
        );
        Ok(PendingGuard {
            table: Arc::clone(self),
            id: id.to_owned(),
            seq,
            cancel_token,
        })
    }

    /// Remove `id` and fire its token. Returns `false` when not live.
    pub fn cancel(&self, id: &str) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(call) => {
                call.cancel_token.cancel();
                true
            }
            None => false,
        }
    }

    /// Fire every live token (router shutdown).
    pub fn cancel_all(&self) {
        for call in self.lock().values() {
            call.cancel_token.cancel();
        }
    }

    /// Snapshot of one live call.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<PendingSnapshot> {
        self.lock().get(id).map(PendingSnapshot::from)
    }

    /// Snapshots of every live call, oldest first.
    #[must_use]
    pub fn list(&self) -> Vec<PendingSnapshot> {
        let calls = self.lock();
        let mut entries: Vec<&PendingCall> = calls.values().collect();
        entries.sort_by_key(|c| c.seq);
        entries.into_iter().map(PendingSnapshot::from).collect()
    }

    /// Number of live calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no call is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn update(&self, id: &str, seq: u64, f: impl FnOnce(&mut PendingCall)) {
        if let Some(call) = self.lock().get_mut(id) {
            if call.seq == seq {
                f(call);
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Owner of one table entry; removes it on drop.
///
/// Removal is keyed by sequence number so that a guard whose entry was
/// already cancelled never removes a newer call that reused the id.
#[derive(Debug)]
pub struct PendingGuard {
    table: Arc<PendingTable>,
    id: String,
    seq: u64,
    cancel_token: CancellationToken,
}

impl PendingGuard {
    /// Request id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The call's cancellation token.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.cancel_token
    }

    /// Record a state transition.
    pub fn set_state(&self, state: CallState) {
        self.table.update(&self.id, self.seq, |c| c.state = state);
    }

    /// Record one more retry.
    pub fn record_retry(&self) {
        self.table
            .update(&self.id, self.seq, |c| c.retry_count = c.retry_count.saturating_add(1));
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        let mut calls = self.table.lock();
        if calls.get(&self.id).is_some_and(|c| c.seq == self.seq) {
            calls.remove(&self.id);
        }
    }
}
