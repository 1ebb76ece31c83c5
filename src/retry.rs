//! Reconnect retry policies.
//!
//! A [`RetryPolicy`] maps a [`RetryContext`] to the delay before the next
//! reconnect attempt, or `None` to stop reconnecting.

use std::time::Duration;

use crate::error::SignalRError;

/// State describing one reconnect attempt.
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Number of failed reconnect attempts so far in this episode.
    pub previous_retry_count: u32,
    /// Time spent reconnecting so far in this episode.
    pub elapsed: Duration,
    /// The error that caused the disconnect, or the last attempt's failure.
    pub retry_reason: SignalRError,
}

pub trait RetryPolicy: Send + Sync {
    /// Returns the delay before the next attempt, or `None` to give up.
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration>;
}

impl<F> RetryPolicy for F
where
    F: Fn(&RetryContext) -> Option<Duration> + Send + Sync,
{
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self(context)
    }
}

/// Waits 0, 2, 10 and 30 seconds, then stops.
#[derive(Debug, Clone)]
pub struct DefaultRetryPolicy {
    delays: Vec<Duration>,
}

impl DefaultRetryPolicy {
    pub fn new() -> Self {
        Self::with_delays([0, 2, 10, 30].map(Duration::from_secs).to_vec())
    }

    /// One attempt per entry, then stop.
    pub fn with_delays(delays: Vec<Duration>) -> Self {
        Self { delays }
    }
}

impl Default for DefaultRetryPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicy for DefaultRetryPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        self.delays
            .get(context.previous_retry_count as usize)
            .copied()
    }
}

/// The same delay every time, for at most `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct ConstantDelayPolicy {
    pub delay: Duration,
    pub max_attempts: Option<u32>,
}

impl RetryPolicy for ConstantDelayPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        match self.max_attempts {
            Some(max) if context.previous_retry_count >= max => None,
            _ => Some(self.delay),
        }
    }
}

/// `initial * 2^n`, capped at `max_delay`, for at most `max_attempts` attempts.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ExponentialBackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(64),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy for ExponentialBackoffPolicy {
    fn next_retry_delay(&self, context: &RetryContext) -> Option<Duration> {
        if context.previous_retry_count >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(context.previous_retry_count.min(16));
        Some(self.initial_delay.saturating_mul(factor).min(self.max_delay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(count: u32) -> RetryContext {
        RetryContext {
            previous_retry_count: count,
            elapsed: Duration::ZERO,
            retry_reason: SignalRError::ConnectionClosed,
        }
    }

    #[test]
    fn default_policy_delays_then_stops() {
        let policy = DefaultRetryPolicy::new();
        let delays: Vec<_> = (0..5).map(|n| policy.next_retry_delay(&context(n))).collect();
        assert_eq!(
            delays,
            vec![
                Some(Duration::ZERO),
                Some(Duration::from_secs(2)),
                Some(Duration::from_secs(10)),
                Some(Duration::from_secs(30)),
                None,
            ]
        );
    }

    #[test]
    fn exponential_backoff_is_capped() {
        let policy = ExponentialBackoffPolicy {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 10,
        };
        assert_eq!(policy.next_retry_delay(&context(0)), Some(Duration::from_secs(1)));
        assert_eq!(policy.next_retry_delay(&context(2)), Some(Duration::from_secs(4)));
        assert_eq!(policy.next_retry_delay(&context(3)), Some(Duration::from_secs(5)));
        assert_eq!(policy.next_retry_delay(&context(10)), None);
    }

    #[test]
    fn closures_are_policies() {
        let policy = |ctx: &RetryContext| (ctx.previous_retry_count < 1).then_some(Duration::ZERO);
        assert_eq!(policy.next_retry_delay(&context(0)), Some(Duration::ZERO));
        assert_eq!(policy.next_retry_delay(&context(1)), None);
    }
}
