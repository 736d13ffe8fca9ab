//! Bounded exponential backoff for transport failures.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Backoff parameters. `delay(n)` is the wait after the n-th failed
/// attempt (0-based): `min(max_delay, base_delay * exp_base^n)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub exp_base: u32,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    /// Delivery defaults: 30 s, 60 s, 2 min, ... capped at 15 min, five
    /// attempts total.
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            exp_base: 2,
            max_delay: Duration::from_secs(15 * 60),
            max_attempts: 5,
        }
    }
}

impl RetryPolicy {
    /// Escalation sends retry fewer times before parking the reminder.
    pub fn escalation() -> Self {
        Self {
            max_attempts: 3,
            ..Self::default()
        }
    }

    /// Delay after `attempt` failures so far (0-based exponent).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self
            .exp_base
            .checked_pow(attempt)
            .map_or(u64::MAX, u64::from);
        self.base_delay
            .checked_mul(u32::try_from(factor).unwrap_or(u32::MAX))
            .map_or(self.max_delay, |d| d.min(self.max_delay))
    }

    /// The instant of the next attempt, honoring a server-advertised
    /// retry-after when it is larger than our own backoff.
    pub fn next_attempt_at(
        &self,
        now: DateTime<Utc>,
        attempt: u32,
        retry_after: Option<Duration>,
    ) -> DateTime<Utc> {
        let mut delay = self.delay(attempt);
        if let Some(advertised) = retry_after
            && advertised > delay
        {
            delay = advertised;
        }
        now + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::minutes(15))
    }

    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}
