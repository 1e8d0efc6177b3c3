//! Circuit breaker for the external payment path.
//!
//! The gateway is the one dependency this system cannot bound with a lock
//! or an optimistic retry, so calls to it run through a breaker: after a
//! threshold of consecutive failures the circuit opens and calls fail fast
//! instead of stacking up against a dead dependency.
//!
//! # States
//!
//! - **Closed**: normal operation, failures are counted.
//! - **Open**: calls are rejected immediately for a timeout period.
//! - **HalfOpen**: after the timeout, probe calls test recovery.

use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: usize,
    /// How long to stay open before probing with `HalfOpen`.
    pub timeout: Duration,
    /// Consecutive successes in `HalfOpen` before closing.
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            failure_threshold: None,
            timeout: None,
            success_threshold: None,
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    failure_threshold: Option<usize>,
    timeout: Option<Duration>,
    success_threshold: Option<usize>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: usize) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set how long the circuit stays open before probing.
    #[must_use]
    pub const fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Set the success threshold for closing from `HalfOpen`.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: usize) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        let defaults = CircuitBreakerConfig::default();
        CircuitBreakerConfig {
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            timeout: self.timeout.unwrap_or(defaults.timeout),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Requests pass through; failures are counted.
    Closed,
    /// Requests fail immediately.
    Open,
    /// Limited requests probe whether the dependency recovered.
    HalfOpen,
}

/// Errors from calls through the breaker.
#[derive(Error, Debug)]
pub enum CircuitBreakerError<E> {
    /// The circuit is open; the call was not attempted.
    #[error("Circuit breaker is open")]
    Open,
    /// The call was attempted and failed.
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct BreakerState {
    state: State,
    failure_count: usize,
    success_count: usize,
    last_failure_time: Option<Instant>,
}

/// Circuit breaker guarding a single dependency.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<RwLock<BreakerState>>,
}

impl CircuitBreaker {
    /// Create a breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            state: Arc::new(RwLock::new(BreakerState {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure_time: None,
            })),
        }
    }

    /// The breaker's current state.
    pub async fn state(&self) -> State {
        self.state.read().await.state
    }

    /// Run an operation through the breaker.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] when the circuit rejects the call,
    /// [`CircuitBreakerError::Inner`] when the operation itself fails.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.can_attempt().await {
            metrics::counter!("circuit_breaker.rejected").increment(1);
            tracing::warn!("Circuit breaker is open, rejecting call");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(result) => {
                self.on_success().await;
                Ok(result)
            },
            Err(err) => {
                self.on_failure().await;
                Err(CircuitBreakerError::Inner(err))
            },
        }
    }

    async fn can_attempt(&self) -> bool {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed | State::HalfOpen => true,
            State::Open => match state.last_failure_time {
                Some(last_failure) if last_failure.elapsed() >= self.config.timeout => {
                    tracing::info!("Circuit breaker transitioning Open -> HalfOpen");
                    metrics::counter!("circuit_breaker.state_change", "to" => "half_open")
                        .increment(1);
                    state.state = State::HalfOpen;
                    state.success_count = 0;
                    true
                },
                _ => false,
            },
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;

        match state.state {
            State::Closed | State::Open => {
                state.failure_count = 0;
            },
            State::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    tracing::info!(
                        successes = state.success_count,
                        "Circuit breaker transitioning HalfOpen -> Closed"
                    );
                    metrics::counter!("circuit_breaker.state_change", "to" => "closed")
                        .increment(1);
                    state.state = State::Closed;
                    state.failure_count = 0;
                    state.success_count = 0;
                    state.last_failure_time = None;
                }
            },
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.last_failure_time = Some(Instant::now());

        match state.state {
            State::Closed => {
                state.failure_count += 1;
                if state.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = state.failure_count,
                        threshold = self.config.failure_threshold,
                        "Circuit breaker transitioning Closed -> Open"
                    );
                    metrics::counter!("circuit_breaker.state_change", "to" => "open")
                        .increment(1);
                    state.state = State::Open;
                }
            },
            State::HalfOpen => {
                tracing::warn!("Circuit breaker transitioning HalfOpen -> Open (probe failed)");
                metrics::counter!("circuit_breaker.state_change", "to" => "open").increment(1);
                state.state = State::Open;
                state.failure_count = 1;
                state.success_count = 0;
            },
            State::Open => {
                state.failure_count += 1;
            },
        }
    }

    /// Force the breaker back to `Closed` (manual intervention).
    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        tracing::info!("Circuit breaker manually reset to Closed");
        state.state = State::Closed;
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stays_closed_on_success() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());

        let result = breaker.call(|| async { Ok::<_, String>(42) }).await;

        assert!(result.is_ok());
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn opens_after_failure_threshold() {
        let config = CircuitBreakerConfig::builder().failure_threshold(3).build();
        let breaker = CircuitBreaker::new(config);

        for _ in 0..3 {
            let _ = breaker.call(|| async { Err::<i32, _>("gateway down") }).await;
        }

        assert_eq!(breaker.state().await, State::Open);

        // Next call is rejected without running the operation.
        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert!(matches!(result, Err(CircuitBreakerError::Open)));
    }

    #[tokio::test]
    async fn half_open_probes_and_closes_after_successes() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .timeout(Duration::from_millis(10))
            .success_threshold(2)
            .build();
        let breaker = CircuitBreaker::new(config);

        let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        assert_eq!(breaker.state().await, State::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        // First probe transitions to HalfOpen and succeeds.
        breaker.call(|| async { Ok::<_, String>(1) }).await.ok();
        assert_eq!(breaker.state().await, State::HalfOpen);

        // Second success closes the circuit.
        breaker.call(|| async { Ok::<_, String>(2) }).await.ok();
        assert_eq!(breaker.state().await, State::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .timeout(Duration::from_millis(10))
            .build();
        let breaker = CircuitBreaker::new(config);

        let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _ = breaker.call(|| async { Err::<i32, _>("still down") }).await;
        assert_eq!(breaker.state().await, State::Open);
    }

    #[tokio::test]
    async fn reset_closes_the_circuit() {
        let config = CircuitBreakerConfig::builder().failure_threshold(1).build();
        let breaker = CircuitBreaker::new(config);

        let _ = breaker.call(|| async { Err::<i32, _>("boom") }).await;
        assert_eq!(breaker.state().await, State::Open);

        breaker.reset().await;
        assert_eq!(breaker.state().await, State::Closed);
    }
}
