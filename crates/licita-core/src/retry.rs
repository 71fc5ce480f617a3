//! Retry policy for adapter HTTP calls: exponential backoff with jitter.

use std::time::Duration;

/// Backoff strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor ^ attempt`, capped at `max`, with optional +/- 50% jitter.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(8),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let scale = factor.powi(attempt.min(i32::MAX as u32) as i32);
                let capped_seconds = (base.as_secs_f64() * scale).min(max.as_secs_f64());
                let delay = Duration::from_secs_f64(capped_seconds.max(0.0));

                if !jitter {
                    return delay;
                }

                let delay_ms = delay.as_millis().min(u128::from(u64::MAX)) as u64;
                let spread = delay_ms / 2;
                let offset = fastrand::u64(0..=spread.saturating_mul(2));
                Duration::from_millis((delay_ms + offset).saturating_sub(spread))
            }
        }
    }
}

/// What the transport should do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

/// Retry configuration shared by every adapter transport.
///
/// Timeouts, transport failures, 5xx and 429 are retried; every other 4xx is
/// final. A 429 waits for the server's `Retry-After` hint when present.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts = `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
    /// Upper bound applied to server-supplied `Retry-After` hints.
    pub max_retry_after: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: Backoff::default(),
            max_retry_after: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Fixed { delay },
            ..Self::default()
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub const fn is_retryable_status(status: u16) -> bool {
        status == 408 || status == 429 || status >= 500
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt)
    }

    /// Decision after a timeout, transport error or retryable status on `attempt`.
    pub fn after_transient_failure(&self, attempt: u32) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for_attempt(attempt))
    }

    /// Decision after a 429, honoring the server hint when present.
    pub fn after_rate_limit(&self, attempt: u32, hint: Option<Duration>) -> RetryDecision {
        if attempt >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        let delay = hint
            .map(|hint| hint.min(self.max_retry_after))
            .unwrap_or_else(|| self.delay_for_attempt(attempt));
        RetryDecision::RetryAfter(delay)
    }
}

/// Parse a `Retry-After` header given in delta-seconds.
pub fn parse_retry_after(value: Option<&str>) -> Option<Duration> {
    let seconds = value?.trim().parse::<f64>().ok()?;
    if !seconds.is_finite() || seconds < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_doubles_until_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_of_the_delay() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: true,
        };

        for _ in 0..20 {
            for attempt in 0..5 {
                let delay_ms = backoff.delay(attempt).as_millis() as f64;
                let expected = (100.0 * 2_f64.powi(attempt as i32)).min(1000.0);
                assert!(delay_ms >= expected * 0.49, "attempt={attempt}, delay_ms={delay_ms}");
                assert!(delay_ms <= expected * 1.51, "attempt={attempt}, delay_ms={delay_ms}");
            }
        }
    }

    #[test]
    fn only_throttling_and_server_errors_are_retryable() {
        assert!(RetryConfig::is_retryable_status(429));
        assert!(RetryConfig::is_retryable_status(500));
        assert!(RetryConfig::is_retryable_status(503));
        assert!(RetryConfig::is_retryable_status(408));
        assert!(!RetryConfig::is_retryable_status(400));
        assert!(!RetryConfig::is_retryable_status(401));
        assert!(!RetryConfig::is_retryable_status(404));
    }

    #[test]
    fn gives_up_after_max_retries() {
        let config = RetryConfig::fixed(Duration::from_millis(10), 2);

        assert_eq!(
            config.after_transient_failure(0),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(
            config.after_transient_failure(1),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
        assert_eq!(config.after_transient_failure(2), RetryDecision::GiveUp);
        assert_eq!(RetryConfig::no_retry().after_transient_failure(0), RetryDecision::GiveUp);
    }

    #[test]
    fn rate_limit_prefers_capped_server_hint() {
        let config = RetryConfig {
            max_retry_after: Duration::from_secs(5),
            ..RetryConfig::fixed(Duration::from_millis(10), 3)
        };

        assert_eq!(
            config.after_rate_limit(0, Some(Duration::from_secs(2))),
            RetryDecision::RetryAfter(Duration::from_secs(2))
        );
        assert_eq!(
            config.after_rate_limit(0, Some(Duration::from_secs(60))),
            RetryDecision::RetryAfter(Duration::from_secs(5))
        );
        assert_eq!(
            config.after_rate_limit(1, None),
            RetryDecision::RetryAfter(Duration::from_millis(10))
        );
    }

    #[test]
    fn retry_after_parses_delta_seconds_only() {
        assert_eq!(parse_retry_after(Some("3")), Some(Duration::from_secs(3)));
        assert_eq!(parse_retry_after(Some(" 1.5 ")), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after(Some("Wed, 21 Oct 2015 07:28:00 GMT")), None);
        assert_eq!(parse_retry_after(Some("-1")), None);
        assert_eq!(parse_retry_after(None), None);
    }
}
