//! Retry schedule for failed transfer attempts.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Delay between attempts.
#[derive(Clone)]
pub enum RetryInterval {
    /// The same delay before every retry.
    Fixed(Duration),
    /// `interval * n` before the n-th retry.
    Accumulated(Duration),
    /// Caller-supplied delay for the n-th retry.
    Custom(Arc<dyn Fn(u32) -> Duration + Send + Sync>),
}

impl fmt::Debug for RetryInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryInterval::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            RetryInterval::Accumulated(d) => f.debug_tuple("Accumulated").field(d).finish(),
            RetryInterval::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub interval: RetryInterval,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            interval: RetryInterval::Fixed(Duration::from_secs(3)),
        }
    }
}

impl RetryPolicy {
    /// Fail on the first error.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            interval: RetryInterval::Fixed(Duration::ZERO),
        }
    }

    pub fn fixed(max_retries: u32, interval: Duration) -> Self {
        Self {
            max_retries,
            interval: RetryInterval::Fixed(interval),
        }
    }

    /// Retry `max_retries` times, asking `delay` for each wait.
    pub fn custom<F>(max_retries: u32, delay: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self {
            max_retries,
            interval: RetryInterval::Custom(Arc::new(delay)),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match &self.interval {
            RetryInterval::Fixed(interval) => *interval,
            RetryInterval::Accumulated(interval) => interval.saturating_mul(attempt.max(1)),
            RetryInterval::Custom(delay) => delay(attempt.max(1)),
        }
    }

    pub fn allows(&self, attempt: u32) -> bool {
        attempt <= self.max_retries
    }
}
