//! Retry delay policies for the reconnection engine

use std::time::Duration;

/// Computes the delay before each reconnection attempt.
///
/// Attempts are numbered from 1. Implementations must be pure apart from any
/// randomness used for jitter.
pub trait BackoffStrategy: Send + Sync {
    /// Delay to wait before `attempt`. Attempt 0 always yields zero.
    fn next_delay(&self, attempt: u32) -> Duration;

    /// How many attempts to make before giving up
    fn max_attempts(&self) -> u32;
}

/// Exponential backoff with proportional jitter, capped at `max_delay`.
///
/// `delay(n) = min(max_delay, initial_delay * factor^(n-1) * (1 + u))` where
/// `u` is drawn uniformly from `[-jitter/2, +jitter/2]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExponentialBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
    max_attempts: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.2,
            max_attempts: 10,
        }
    }
}

impl ExponentialBackoff {
    /// Create a new exponential backoff
    pub fn new(initial_delay: Duration, max_delay: Duration, factor: f64, jitter: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            ..Self::default()
        }
    }

    /// Set the attempt cap
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay for `attempt` before jitter is applied
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        if !secs.is_finite() || secs >= cap {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl BackoffStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base = self.base_delay(attempt).as_secs_f64();
        let spread = (rand::random::<f64>() - 0.5) * self.jitter;
        let jittered = (base * (1.0 + spread)).max(0.0);

        Duration::from_secs_f64(jittered).min(self.max_delay)
    }

    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}
