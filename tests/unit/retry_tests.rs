use std::time::Duration;

use bibot_mcp::config::{RetryConfig, RouterConfig};
use bibot_mcp::router::RetryPolicy;

#[test]
fn defaults_follow_router_config() {
    let policy = RetryPolicy::from_config(&RouterConfig::default().retry);
    assert_eq!(policy.max_retries, 3);
    assert_eq!(policy.nominal_delay(1), Duration::from_secs(1));
    assert_eq!(policy.nominal_delay(2), Duration::from_secs(2));
    assert_eq!(policy.nominal_delay(3), Duration::from_secs(4));
}

#[test]
fn delay_is_capped_by_max_delay() {
    let policy = RetryPolicy::from_config(&RetryConfig {
        max_retries: 10,
        base_delay_ms: 1_000,
        max_delay_ms: 3_000,
        multiplier: 10.0,
        jitter: 0.0,
    });
    assert_eq!(policy.delay(1), Duration::from_secs(1));
    assert_eq!(policy.delay(2), Duration::from_secs(3));
    assert_eq!(policy.delay(u32::MAX), Duration::from_secs(3));
}

#[test]
fn multiplier_below_one_is_treated_as_constant() {
    let policy = RetryPolicy::from_config(&RetryConfig {
        max_retries: 3,
        base_delay_ms: 50,
        max_delay_ms: 1_000,
        multiplier: 0.5,
        jitter: 0.0,
    });
    assert_eq!(policy.delay(1), Duration::from_millis(50));
    assert_eq!(policy.delay(3), Duration::from_millis(50));
}

#[test]
fn zero_budget_allows_no_retry() {
    let policy = RetryPolicy::from_config(&RetryConfig::default()).with_max_retries(0);
    assert!(!policy.allows(0));
}

#[test]
fn full_jitter_never_goes_negative_or_above_double() {
    let policy = RetryPolicy::from_config(&RetryConfig {
        max_retries: 3,
        base_delay_ms: 100,
        max_delay_ms: 100,
        multiplier: 2.0,
        jitter: 1.0,
    });
    for _ in 0..500 {
        let d = policy.delay(1);
        assert!(d <= Duration::from_millis(200), "{d:?}");
    }
}
