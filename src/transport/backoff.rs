//! Jittered exponential backoff between reconnection attempts.

use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng, rngs::StdRng};

/// Default delay after the first failed attempt.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_millis(100);
/// Default ceiling on the delay between attempts.
pub const DEFAULT_BACKOFF_CAP: Duration = Duration::from_secs(10);

const MIN_DELAY_MS: u64 = 10;

/// Exponential backoff policy for reconnection attempts.
#[derive(Clone, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BACKOFF_BASE,
            cap: DEFAULT_BACKOFF_CAP,
        }
    }
}

/// Tracks consecutive failures and when the next attempt is allowed.
///
/// Unlike a sleeping retry loop this never blocks: callers ask
/// [`ready`](Self::ready) and fail fast while the window is closed.
pub struct ReconnectBackoff {
    policy: BackoffPolicy,
    current: Duration,
    next_attempt: Option<Instant>,
    failures: u32,
    rng: StdRng,
}

impl ReconnectBackoff {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            current: policy.base,
            next_attempt: None,
            failures: 0,
            rng: StdRng::from_entropy(),
            policy,
        }
    }

    /// Whether an attempt may be made at `now`.
    pub fn ready(&self, now: Instant) -> bool {
        self.next_attempt.is_none_or(|at| now >= at)
    }

    /// Consecutive failures since the last success.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failed attempt, returning the delay before the next one.
    pub fn record_failure(&mut self, now: Instant) -> Duration {
        if self.failures > 0 {
            self.current = self.current.saturating_mul(2).min(self.policy.cap);
        }
        self.failures = self.failures.saturating_add(1);
        let max_ms = u64::try_from(self.current.as_millis()).unwrap_or(u64::MAX);
        let delay_ms = match max_ms {
            0..=MIN_DELAY_MS => MIN_DELAY_MS,
            _ => self.rng.gen_range(MIN_DELAY_MS..=max_ms),
        };
        let delay = Duration::from_millis(delay_ms);
        self.next_attempt = Some(now + delay);
        delay
    }

    pub fn record_success(&mut self) {
        self.current = self.policy.base;
        self.next_attempt = None;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn policy(base_ms: u64, cap_ms: u64) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            cap: Duration::from_millis(cap_ms),
        }
    }

    #[rstest]
    fn fresh_state_is_ready() {
        let backoff = ReconnectBackoff::new(BackoffPolicy::default());
        assert!(backoff.ready(Instant::now()));
    }

    #[rstest]
    fn failure_closes_the_window_until_delay_elapses() {
        let mut backoff = ReconnectBackoff::new(policy(100, 100));
        let now = Instant::now();
        let delay = backoff.record_failure(now);
        assert!(delay >= Duration::from_millis(MIN_DELAY_MS));
        assert!(delay <= Duration::from_millis(100));
        assert!(!backoff.ready(now));
        assert!(backoff.ready(now + delay));
    }

    #[rstest]
    fn delay_never_exceeds_cap() {
        let mut backoff = ReconnectBackoff::new(policy(50, 200));
        let now = Instant::now();
        for _ in 0..16 {
            assert!(backoff.record_failure(now) <= Duration::from_millis(200));
        }
        assert_eq!(backoff.failures(), 16);
    }

    #[rstest]
    fn success_resets_state() {
        let mut backoff = ReconnectBackoff::new(policy(0, 0));
        let now = Instant::now();
        assert_eq!(backoff.record_failure(now), Duration::from_millis(MIN_DELAY_MS));
        backoff.record_success();
        assert!(backoff.ready(now));
        assert_eq!(backoff.failures(), 0);
    }
}
