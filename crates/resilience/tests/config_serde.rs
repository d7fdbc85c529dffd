//! Serde tests for configuration structs
//!
//! Configs are produced by external loaders, so these check the JSON shape
//! such a loader would write by hand rather than round-trips alone.

#![allow(clippy::expect_used, clippy::panic)]

use std::time::Duration;

use resilience_core::{
    AimdConfig, BulkheadConfig, CircuitBreakerConfig, CircuitState, IntervalFunction,
    RateLimiterConfig, RejectionReason, RetryConfig, SlidingWindowType, TimeLimiterConfig,
};
use serde_json::json;

/// Validates circuit breaker config loading from partial JSON.
///
/// # Test Steps
/// 1. Deserialize a document naming only a few fields
/// 2. Verify durations are read as milliseconds
/// 3. Confirm omitted fields fall back to defaults and the result validates
#[test]
fn test_circuit_breaker_config_from_json() {
    let config: CircuitBreakerConfig = serde_json::from_value(json!({
        "window": {
            "sliding_window_type": "TIME_BASED",
            "sliding_window_size": 10,
            "minimum_number_of_calls": 20
        },
        "failure_rate_threshold": 25.0,
        "slow_call_duration_threshold": 1500,
        "wait_interval_in_open_state": {
            "type": "exponential",
            "initial": 1000,
            "multiplier": 2.0,
            "max": 30000
        },
        "transition_on_half_open_timeout": "CLOSED"
    }))
    .expect("valid document");

    assert_eq!(config.window.sliding_window_type, SlidingWindowType::TimeBased);
    assert_eq!(config.window.minimum_number_of_calls, 20);
    assert!((config.failure_rate_threshold - 25.0).abs() < f64::EPSILON);
    assert_eq!(config.slow_call_duration_threshold, Duration::from_millis(1500));
    assert_eq!(config.wait_interval_in_open_state.apply(6), Duration::from_secs(30));
    assert_eq!(config.transition_on_half_open_timeout, CircuitState::Closed);
    assert_eq!(config.permitted_number_of_calls_in_half_open_state, 10);
    assert!(config.record_error.is_none());
    assert!(config.validate().is_ok());
}

/// Validates that loaded configs are still subject to validation.
///
/// # Test Steps
/// 1. Deserialize a bulkhead config with a zero cap
/// 2. Confirm deserialization succeeds but `validate` rejects it
#[test]
fn test_invalid_values_are_caught_by_validate() {
    let config: BulkheadConfig =
        serde_json::from_value(json!({ "max_concurrent_calls": 0 })).expect("valid document");
    assert!(config.validate().is_err());
}

/// Validates the serialized form of rate limiter and bulkhead configs.
///
/// # Test Steps
/// 1. Serialize configs built through their builders
/// 2. Verify durations are written as whole milliseconds
/// 3. Confirm the JSON reads back into an equal config
#[test]
fn test_configs_serialize_durations_as_millis() {
    let limiter = RateLimiterConfig::builder()
        .limit_for_period(10)
        .limit_refresh_period(Duration::from_secs(1))
        .timeout_duration(Duration::from_millis(250))
        .build()
        .expect("valid config");
    let value = serde_json::to_value(&limiter).expect("serializable");
    assert_eq!(
        value,
        json!({ "limit_for_period": 10, "limit_refresh_period": 1000, "timeout_duration": 250 })
    );
    let back: RateLimiterConfig = serde_json::from_value(value).expect("readable");
    assert_eq!(back, limiter);

    let bulkhead = BulkheadConfig::builder()
        .max_concurrent_calls(8)
        .max_wait_duration(Duration::from_millis(40))
        .build()
        .expect("valid config");
    let value = serde_json::to_value(&bulkhead).expect("serializable");
    assert_eq!(value, json!({ "max_concurrent_calls": 8, "max_wait_duration": 40 }));
}

/// Validates AIMD and retry configs loaded from JSON.
///
/// # Test Steps
/// 1. Deserialize an AIMD config with custom bounds
/// 2. Deserialize a retry config with a randomized interval
/// 3. Confirm both validate and carry the given values
#[test]
fn test_adaptive_and_retry_configs_from_json() {
    let aimd: AimdConfig = serde_json::from_value(json!({
        "min_limit": 4,
        "max_limit": 64,
        "desirable_latency": 200
    }))
    .expect("valid document");
    assert_eq!(aimd.min_limit, 4);
    assert_eq!(aimd.max_limit, 64);
    assert_eq!(aimd.desirable_latency, Duration::from_millis(200));
    assert!(aimd.validate().is_ok());

    let retry: RetryConfig = serde_json::from_value(json!({
        "max_attempts": 4,
        "interval_function": { "type": "randomized", "interval": 100, "randomization_factor": 0.2 }
    }))
    .expect("valid document");
    assert_eq!(retry.max_attempts, 4);
    assert!(retry.validate().is_ok());
    let wait = retry.interval_function.apply(1);
    assert!(wait >= Duration::from_millis(80) && wait <= Duration::from_millis(120));
    assert!(retry.retry_on_error.is_none());

    let fixed = serde_json::to_value(IntervalFunction::fixed(Duration::from_millis(500)))
        .expect("serializable");
    assert_eq!(fixed, json!({ "type": "fixed", "interval": 500 }));
}

/// Validates the time limiter config shape.
///
/// # Test Steps
/// 1. Deserialize a document setting only the deadline
/// 2. Confirm cancellation stays on by default
/// 3. Serialize it back and verify the field names and millisecond deadline
#[test]
fn test_time_limiter_config_from_json() {
    let config: TimeLimiterConfig =
        serde_json::from_value(json!({ "timeout_duration": 2500 })).expect("valid document");
    assert_eq!(config.timeout_duration, Duration::from_millis(2500));
    assert!(config.cancel_running_future);
    assert!(config.validate().is_ok());

    let value = serde_json::to_value(&config).expect("serializable");
    assert_eq!(value, json!({ "timeout_duration": 2500, "cancel_running_future": true }));
}

/// Validates rejection reasons as they appear in exported events.
///
/// # Test Steps
/// 1. Serialize each rejection reason
/// 2. Confirm the variant names are used verbatim
#[test]
fn test_rejection_reason_names() {
    let names: Vec<_> = [
        RejectionReason::CircuitOpen,
        RejectionReason::BulkheadFull,
        RejectionReason::RateLimited,
        RejectionReason::QueueFull,
    ]
    .iter()
    .map(|reason| serde_json::to_value(reason).expect("serializable"))
    .collect();
    assert_eq!(
        names,
        vec![json!("CircuitOpen"), json!("BulkheadFull"), json!("RateLimited"), json!("QueueFull")]
    );
}
