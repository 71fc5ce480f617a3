use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Runtime circuit state of a guarded source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    /// Degraded until the cooldown elapses and recovery is re-evaluated.
    Open,
}

/// Circuit breaker thresholds and timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Default)]
struct CircuitInner {
    consecutive_failures: u32,
    degraded_until: Option<Instant>,
}

/// Short-horizon failure counter for one source's sub-operations.
///
/// Reaching the threshold opens the circuit for `cooldown`. A success resets
/// the counter but never shortens an active cooldown, and an elapsed cooldown
/// only closes the circuit once [`try_recover`](Self::try_recover) runs.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner::default()),
        }
    }

    pub fn config(&self) -> CircuitBreakerConfig {
        self.config
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if inner.consecutive_failures >= self.config.failure_threshold {
            let was_open = inner.degraded_until.is_some();
            inner.degraded_until = Some(Instant::now() + self.config.cooldown);
            if !was_open {
                tracing::warn!(
                    failures = inner.consecutive_failures,
                    cooldown_secs = self.config.cooldown.as_secs(),
                    "circuit opened"
                );
            }
        }
    }

    pub fn record_success(&self) {
        self.lock().consecutive_failures = 0;
    }

    pub fn is_degraded(&self) -> bool {
        self.lock().degraded_until.is_some()
    }

    /// Closes the circuit if its cooldown has elapsed. Returns whether the
    /// breaker is closed afterwards.
    pub fn try_recover(&self) -> bool {
        let mut inner = self.lock();
        match inner.degraded_until {
            Some(until) if Instant::now() >= until => {
                inner.degraded_until = None;
                inner.consecutive_failures = 0;
                tracing::info!("circuit closed after cooldown");
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    pub fn state(&self) -> CircuitState {
        if self.is_degraded() {
            CircuitState::Open
        } else {
            CircuitState::Closed
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Time left in the current cooldown, zero once it has elapsed.
    pub fn remaining_cooldown(&self) -> Option<Duration> {
        self.lock()
            .degraded_until
            .map(|until| until.saturating_duration_since(Instant::now()))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(threshold: u32, cooldown: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold: threshold,
            cooldown,
        })
    }

    #[test]
    fn opens_after_threshold_failures() {
        let breaker = breaker(2, Duration::from_secs(60));

        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.try_recover());
    }

    #[test]
    fn success_resets_count_but_not_cooldown() {
        let breaker = breaker(1, Duration::from_secs(60));
        breaker.record_failure();

        breaker.record_success();

        assert_eq!(breaker.consecutive_failures(), 0);
        assert!(breaker.is_degraded());
    }

    #[test]
    fn elapsed_cooldown_needs_explicit_recovery() {
        let breaker = breaker(1, Duration::from_millis(1));
        breaker.record_failure();

        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.is_degraded());
        assert_eq!(breaker.remaining_cooldown(), Some(Duration::ZERO));

        assert!(breaker.try_recover());
        assert!(!breaker.is_degraded());
        assert_eq!(breaker.remaining_cooldown(), None);
    }

    #[test]
    fn failure_below_threshold_keeps_circuit_closed() {
        let breaker = breaker(3, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();

        assert_eq!(breaker.consecutive_failures(), 2);
        assert!(!breaker.is_degraded());
    }
}
