//! Per-call counters.
//!
//! [`CallMetrics`] keeps in-process atomics for `/mcp/health` and tests,
//! and mirrors every update to the `metrics` facade so an exporter
//! installed by the embedding binary picks them up.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;

use crate::protocol::ErrorCode;
use crate::router::CallState;

/// Label for calls whose tool or resource no registered server exposes.
/// Caller-supplied names never become per-tool keys or metric labels.
pub const UNKNOWN_TARGET: &str = "<unknown>";

/// Aggregated per-tool figures.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ToolStats {
    /// Calls that reached a terminal state.
    pub calls: u64,
    /// Terminal states other than `COMPLETED`.
    pub failures: u64,
    /// Retries performed.
    pub retries: u64,
    /// Sum of call latencies.
    pub total_ms: u64,
}

/// Point-in-time copy of [`CallMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Calls accepted.
    pub total_calls: u64,
    /// Calls accepted but not finished.
    pub in_flight: u64,
    /// Finished with a result.
    pub completed: u64,
    /// Finished with an error.
    pub errored: u64,
    /// Deadline elapsed.
    pub timed_out: u64,
    /// Cancelled by the caller.
    pub cancelled: u64,
    /// Retries performed across all calls.
    pub retries: u64,
    /// Mean latency of finished calls.
    pub average_latency_ms: f64,
    /// Failures keyed by error-code name.
    pub errors_by_code: BTreeMap<String, u64>,
    /// Per-tool breakdown.
    pub tools: BTreeMap<String, ToolStats>,
}

/// Router-wide call counters.
#[derive(Debug, Default)]
pub struct CallMetrics {
    started: AtomicU64,
    finished: AtomicU64,
    completed: AtomicU64,
    errored: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    latency_ms: AtomicU64,
    codes: Mutex<HashMap<ErrorCode, u64>>,
    tools: Mutex<HashMap<String, ToolStats>>,
}

impl CallMetrics {
    /// Zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A call was accepted.
    pub fn record_start(&self, tool: &str) {
        self.started.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("mcp_calls_total", "tool" => tool.to_owned()).increment(1);
    }

    /// A retry is about to be attempted.
    pub fn record_retry(&self, tool: &str) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        self.tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tool.to_owned())
            .or_default()
            .retries += 1;
        metrics::counter!("mcp_call_retries_total", "tool" => tool.to_owned()).increment(1);
    }

    /// A call reached a terminal state.
    pub fn record_finish(
        &self,
        tool: &str,
        state: CallState,
        code: Option<ErrorCode>,
        elapsed: Duration,
    ) {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.latency_ms.fetch_add(elapsed_ms, Ordering::Relaxed);

        let bucket = match state {
            CallState::Completed => &self.completed,
            CallState::TimedOut => &self.timed_out,
            CallState::Cancelled => &self.cancelled,
            _ => &self.errored,
        };
        bucket.fetch_add(1, Ordering::Relaxed);

        if let Some(code) = code {
            *self
                .codes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(code)
                .or_default() += 1;
            metrics::counter!("mcp_call_errors_total", "code" => code.as_str()).increment(1);
        }

        {
            let mut tools = self.tools.lock().unwrap_or_else(PoisonError::into_inner);
            let stats = tools.entry(tool.to_owned()).or_default();
            stats.calls += 1;
            stats.total_ms = stats.total_ms.saturating_add(elapsed_ms);
            if state != CallState::Completed {
                stats.failures += 1;
            }
        }

        metrics::histogram!(
            "mcp_call_duration_seconds",
            "tool" => tool.to_owned(),
            "outcome" => state.as_str()
        )
        .record(elapsed.as_secs_f64());
    }

    /// Copy the current figures.
    #[must_use]
    #[allow(clippy::cast_precision_loss)] // Averages are informational.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let started = self.started.load(Ordering::Relaxed);
        let finished = self.finished.load(Ordering::Relaxed);
        let latency = self.latency_ms.load(Ordering::Relaxed);
        let average_latency_ms = if finished == 0 {
            0.0
        } else {
            latency as f64 / finished as f64
        };

        let errors_by_code = self
            .codes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(code, n)| (code.as_str().to_owned(), *n))
            .collect();
        let tools = self
            .tools
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(name, stats)| (name.clone(), stats.clone()))
            .collect();

        MetricsSnapshot {
            total_calls: started,
            in_flight: started.saturating_sub(finished),
            completed: self.completed.load(Ordering::Relaxed),
            errored: self.errored.load(Ordering::Relaxed),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            average_latency_ms,
            errors_by_code,
            tools,
        }
    }
}
