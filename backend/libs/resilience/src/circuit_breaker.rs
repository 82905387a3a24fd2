/// Circuit breaker guarding a single operation key
///
/// State transitions:
/// - Closed → Open: when consecutive failures reach `failure_threshold`
/// - Open → HalfOpen: once `reset_timeout` has elapsed since the last failure
/// - HalfOpen → Closed: when the single trial call succeeds
/// - HalfOpen → Open: when the trial call fails
use crate::metrics;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation, requests pass through
    Closed,
    /// Circuit is open, requests fail fast
    Open,
    /// Cooldown elapsed, one trial request allowed
    HalfOpen,
}

impl CircuitState {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failure count that opens the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before a trial call is allowed
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit breaker '{key}' is open - failing fast")]
    Open { key: String },
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitBreakerError<E> {
    /// Collapse into the caller's error type, mapping the fast-fail case with `open`
    pub fn into_inner_or(self, open: impl FnOnce(String) -> E) -> E {
        match self {
            CircuitBreakerError::Open { key } => open(key),
            CircuitBreakerError::Inner(e) => e,
        }
    }
}

#[derive(Clone)]
pub struct CircuitBreaker {
    key: Arc<str>,
    config: CircuitBreakerConfig,
    state: Arc<Mutex<BreakerState>>,
}

struct BreakerState {
    current: CircuitState,
    failure_count: u32,
    last_failure_at: Option<Instant>,
    trial_in_flight: bool,
}

/// Admission ticket for one call; releases a HalfOpen trial slot if the
/// call future is dropped before it settles.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(key: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let key: String = key.into();
        Self {
            key: Arc::from(key),
            config,
            state: Arc::new(Mutex::new(BreakerState {
                current: CircuitState::Closed,
                failure_count: 0,
                last_failure_at: None,
                trial_in_flight: false,
            })),
        }
    }

    /// Execute a future with circuit breaker protection
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let Some(mut permit) = self.admit() else {
            metrics::breaker_call(&self.key, CircuitState::Open, "rejected");
            debug!(key = %self.key, "circuit breaker rejected call");
            return Err(CircuitBreakerError::Open {
                key: self.key.to_string(),
            });
        };

        let result = f().await;
        permit.settled = true;

        match result {
            Ok(value) => {
                self.record_success();
                metrics::breaker_call(&self.key, self.state(), "success");
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                metrics::breaker_call(&self.key, self.state(), "failure");
                Err(CircuitBreakerError::Inner(e))
            }
        }
    }

    fn admit(&self) -> Option<Permit<'_>> {
        let mut state = self.state.lock();

        let trial = match state.current {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled_down = state
                    .last_failure_at
                    .map(|at| at.elapsed() >= self.config.reset_timeout)
                    .unwrap_or(true);
                if !cooled_down {
                    return None;
                }
                self.transition(&mut state, CircuitState::HalfOpen);
                state.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => {
                if state.trial_in_flight {
                    return None;
                }
                state.trial_in_flight = true;
                true
            }
        };

        Some(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn record_success(&self) {
        let mut state = self.state.lock();

        state.failure_count = 0;
        state.trial_in_flight = false;
        if state.current != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();

        state.failure_count += 1;
        state.last_failure_at = Some(Instant::now());
        state.trial_in_flight = false;

        match state.current {
            CircuitState::Closed => {
                if state.failure_count >= self.config.failure_threshold {
                    warn!(
                        key = %self.key,
                        failures = state.failure_count,
                        "circuit breaker threshold reached"
                    );
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                warn!(key = %self.key, "circuit breaker trial call failed");
                self.transition(&mut state, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn transition(&self, state: &mut BreakerState, next: CircuitState) {
        info!(
            key = %self.key,
            "Circuit breaker: {:?} → {:?}",
            state.current,
            next
        );
        metrics::breaker_transition(&self.key, state.current, next);
        state.current = next;
    }

    /// Current circuit state (for monitoring)
    pub fn state(&self) -> CircuitState {
        self.state.lock().current
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Force the breaker back to Closed
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.failure_count = 0;
        state.last_failure_at = None;
        state.trial_in_flight = false;
        if state.current != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
    }
}

/// One breaker per guarded operation key, created on first use
#[derive(Clone, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: Arc<DashMap<String, CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: Arc::new(DashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> CircuitBreaker {
        self.breakers
            .entry(key.to_string())
            .or_insert_with(|| CircuitBreaker::new(key, self.config.clone()))
            .clone()
    }

    /// Snapshot of every known breaker, sorted by key
    pub fn states(&self) -> Vec<(String, CircuitState)> {
        let mut states: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect();
        states.sort_by(|a, b| a.0.cmp(&b.0));
        states
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }
}
