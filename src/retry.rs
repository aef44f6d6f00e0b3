//! Retry policies for activities scheduled with
//! [`OrchestrationContext::schedule_activity_with_retry`](crate::OrchestrationContext::schedule_activity_with_retry).
//!
//! A policy is an immutable value. Evaluating it is a pure function of the
//! failed attempt number, so the same history always yields the same retries.

use std::time::Duration;

/// Default wait between attempts when only `max_attempts` is given.
pub const DEFAULT_FIRST_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// How long to wait before the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately.
    None,
    /// Same delay before every retry.
    Fixed { delay: Duration },
    /// `base * attempt`, capped at `max`.
    Linear { base: Duration, max: Duration },
    /// `base * multiplier^(attempt - 1)`, capped at `max`.
    Exponential {
        base: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    /// Delay after failed attempt `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        match self {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Fixed { delay } => *delay,
            BackoffStrategy::Linear { base, max } => base.saturating_mul(attempt).min(*max),
            BackoffStrategy::Exponential { base, .. } if base.is_zero() => Duration::ZERO,
            BackoffStrategy::Exponential { base, multiplier, max } => {
                let factor = multiplier.powi((attempt - 1).min(i32::MAX as u32) as i32);
                let millis = base.as_millis() as f64 * factor;
                if !millis.is_finite() || millis >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(millis as u64)
                }
            }
        }
    }
}

/// Outcome of evaluating a policy after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Per-attempt bound. An attempt still running when it elapses counts as failed.
    pub timeout: Option<Duration>,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            timeout: None,
            backoff: BackoffStrategy::Fixed {
                delay: DEFAULT_FIRST_RETRY_INTERVAL,
            },
        }
    }
}

impl RetryPolicy {
    /// # Panics
    /// If `max_attempts` is zero.
    pub fn new(max_attempts: u32) -> Self {
        assert!(max_attempts >= 1, "max_attempts must be at least 1");
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Fixed backoff of `interval` between attempts.
    pub fn with_first_retry_interval(self, interval: Duration) -> Self {
        self.with_backoff(BackoffStrategy::Fixed { delay: interval })
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay_for_attempt(attempt)
    }

    pub fn evaluate(&self, failed_attempt: u32) -> RetryDecision {
        if failed_attempt >= self.max_attempts {
            RetryDecision::GiveUp
        } else {
            RetryDecision::RetryAfter(self.delay_for_attempt(failed_attempt))
        }
    }

    /// `None` once `failed_attempt` was the last allowed attempt.
    pub fn next_retry_delay(&self, failed_attempt: u32) -> Option<Duration> {
        match self.evaluate(failed_attempt) {
            RetryDecision::RetryAfter(d) => Some(d),
            RetryDecision::GiveUp => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_three_attempts_fixed() {
        let p = RetryPolicy::default();
        assert_eq!(p.max_attempts, 3);
        assert!(p.timeout.is_none());
        assert_eq!(p.delay_for_attempt(2), DEFAULT_FIRST_RETRY_INTERVAL);
    }

    #[test]
    fn third_failure_is_terminal() {
        let p = RetryPolicy::new(3).with_first_retry_interval(Duration::from_secs(5));
        assert_eq!(p.evaluate(1), RetryDecision::RetryAfter(Duration::from_secs(5)));
        assert_eq!(p.evaluate(2), RetryDecision::RetryAfter(Duration::from_secs(5)));
        assert_eq!(p.evaluate(3), RetryDecision::GiveUp);
        assert_eq!(p.next_retry_delay(4), None);
    }

    #[test]
    fn single_attempt_never_retries() {
        assert_eq!(RetryPolicy::new(1).next_retry_delay(1), None);
    }

    #[test]
    fn exponential_caps_without_overflow() {
        let b = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_secs(30),
        };
        assert_eq!(b.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(b.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    #[should_panic(expected = "max_attempts must be at least 1")]
    fn zero_attempts_rejected() {
        let _ = RetryPolicy::new(0);
    }
}
