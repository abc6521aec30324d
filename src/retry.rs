//! Retry/backoff schedules shared by the bulk fetcher, the stream listener and
//! sink delivery.

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Growth factor applied per attempt.
    pub factor: f64,
    /// Upper bound on a single delay.
    pub cap: Duration,
    /// Total attempts including the first; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Bulk fetch: 1s, 2s, 4s ... capped at 30s, 5 attempts.
    pub fn bulk_fetch() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(30),
            max_attempts: Some(5),
        }
    }

    /// Stream reconnect: 1s, 2s, 4s ... capped at 60s, unbounded.
    pub fn reconnect() -> Self {
        Self {
            base: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(60),
            max_attempts: None,
        }
    }

    /// Sink delivery: 500ms doubling to 10s, 5 attempts.
    pub fn sink_delivery() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            cap: Duration::from_secs(10),
            max_attempts: Some(5),
        }
    }

    /// Deterministic delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base.as_millis() as f64 * self.factor.powi(exp);
        let capped = millis.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    /// `delay_for` plus up to 25% random jitter, used for reconnect storms.
    pub fn jittered_delay_for(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        let spread = (delay.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..=spread);
        delay + Duration::from_millis(jitter)
    }

    /// True if another attempt is allowed after `attempts_made`.
    pub fn allows_another(&self, attempts_made: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempts_made < max)
    }

    /// Build the `backoff` crate schedule for this policy.
    ///
    /// Attempt bounding is done by the caller; the schedule itself never
    /// expires on elapsed time.
    pub fn to_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.base)
            .with_multiplier(self.factor)
            .with_max_interval(self.cap)
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backoff::backoff::Backoff;

    #[test]
    fn test_delay_doubles_and_caps() {
        let policy = RetryPolicy::bulk_fetch();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(60), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let policy = RetryPolicy::reconnect();
        for attempt in 1..10 {
            let base = policy.delay_for(attempt);
            let jittered = policy.jittered_delay_for(attempt);
            assert!(jittered >= base);
            assert!(jittered <= base + base / 4 + Duration::from_millis(1));
        }
    }

    #[test]
    fn test_attempt_bounds() {
        let bounded = RetryPolicy::bulk_fetch();
        assert!(bounded.allows_another(4));
        assert!(!bounded.allows_another(5));
        assert!(RetryPolicy::reconnect().allows_another(u32::MAX - 1));
    }

    #[test]
    fn test_backoff_schedule_matches_policy() {
        let policy = RetryPolicy::bulk_fetch();
        let mut schedule = policy.to_backoff();
        for attempt in 1..=3 {
            let expected = policy.delay_for(attempt);
            let actual = schedule.next_backoff().unwrap();
            assert!(actual >= expected && actual < expected + Duration::from_millis(1));
        }
    }
}
