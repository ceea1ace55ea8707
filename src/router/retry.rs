//! Exponential backoff for transient failures.

use std::time::Duration;

use rand::Rng;

use crate::config::RetryConfig;

/// Backoff schedule: `min(base * multiplier^(n-1), max)` with symmetric
/// relative jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl RetryPolicy {
    /// Build from configuration.
    #[must_use]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: config.base_delay(),
            max: config.max_delay(),
            multiplier: config.multiplier.max(1.0),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// Same policy with a different retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Whether another retry is allowed after `retries_so_far`.
    #[must_use]
    pub const fn allows(&self, retries_so_far: u32) -> bool {
        retries_so_far < self.max_retries
    }

    /// Un-jittered delay before retry number `retry` (1-based).
    #[must_use]
    pub fn nominal_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let factor = self.multiplier.powi(exponent);
        let millis = self.base.as_secs_f64() * 1_000.0 * factor;
        let capped = millis.min(self.max.as_secs_f64() * 1_000.0);
        duration_from_millis_f64(capped)
    }

    /// Jittered delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: u32) -> Duration {
        let nominal = self.nominal_delay(retry);
        if self.jitter <= 0.0 {
            return nominal;
        }
        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        let millis = nominal.as_secs_f64() * 1_000.0 * (1.0 + spread);
        duration_from_millis_f64(millis)
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)] // Finite and positive after the guard.
fn duration_from_millis_f64(millis: f64) -> Duration {
    if millis.is_finite() && millis > 0.0 {
        Duration::from_micros((millis * 1_000.0).round() as u64)
    } else {
        Duration::ZERO
    }
}
