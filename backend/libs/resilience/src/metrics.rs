//! Prometheus series for the resilience primitives, labelled by delivery
//! operation key (`messages.send`, `conversations.list`, ...).
//!
//! Every recorder compiles to a no-op unless the `metrics` feature is on.

use crate::circuit_breaker::CircuitState;

#[cfg(feature = "metrics")]
mod series {
    use once_cell::sync::Lazy;
    use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

    pub(super) static BREAKER_TRANSITIONS: Lazy<IntCounterVec> = Lazy::new(|| {
        register_int_counter_vec!(
            "delivery_breaker_transitions_total",
            "Circuit breaker state changes per delivery operation",
            &["operation", "from", "to"]
        )
        .expect("Failed to register delivery_breaker_transitions_total")
    });

    pub(super) static BREAKER_CALLS: Lazy<IntCounterVec> = Lazy::new(|| {
        register_int_counter_vec!(
            "delivery_breaker_calls_total",
            "Calls through a circuit breaker, by state after the call",
            &["operation", "state", "outcome"]
        )
        .expect("Failed to register delivery_breaker_calls_total")
    });

    pub(super) static CONNECT_DEADLINES: Lazy<IntCounterVec> = Lazy::new(|| {
        register_int_counter_vec!(
            "delivery_deadline_operations_total",
            "Deadline-guarded operations such as socket establishment",
            &["outcome"]
        )
        .expect("Failed to register delivery_deadline_operations_total")
    });

    pub(super) static RETRY_ATTEMPTS: Lazy<HistogramVec> = Lazy::new(|| {
        register_histogram_vec!(
            "delivery_retry_attempts",
            "Attempts spent per delivery operation before it settled",
            &["operation", "outcome"],
            vec![1.0, 2.0, 3.0, 4.0, 5.0]
        )
        .expect("Failed to register delivery_retry_attempts")
    });
}

pub fn breaker_transition(operation: &str, from: CircuitState, to: CircuitState) {
    #[cfg(feature = "metrics")]
    series::BREAKER_TRANSITIONS
        .with_label_values(&[operation, from.as_str(), to.as_str()])
        .inc();
    #[cfg(not(feature = "metrics"))]
    let _ = (operation, from, to);
}

/// `outcome` is `success`, `failure` or `rejected`
pub fn breaker_call(operation: &str, state: CircuitState, outcome: &str) {
    #[cfg(feature = "metrics")]
    series::BREAKER_CALLS
        .with_label_values(&[operation, state.as_str(), outcome])
        .inc();
    #[cfg(not(feature = "metrics"))]
    let _ = (operation, state, outcome);
}

/// `outcome` is `success`, `failure` or `elapsed`
pub fn deadline(outcome: &str) {
    #[cfg(feature = "metrics")]
    series::CONNECT_DEADLINES.with_label_values(&[outcome]).inc();
    #[cfg(not(feature = "metrics"))]
    let _ = outcome;
}

/// `outcome` is `success`, `rejected` or `exhausted`
pub fn retry_settled(operation: &str, outcome: &str, attempts: u32) {
    #[cfg(feature = "metrics")]
    series::RETRY_ATTEMPTS
        .with_label_values(&[operation, outcome])
        .observe(f64::from(attempts));
    #[cfg(not(feature = "metrics"))]
    let _ = (operation, outcome, attempts);
}
