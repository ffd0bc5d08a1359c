//! Coalesces repeated warnings into periodic summaries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::reporting::{TimeProvider, system_time_provider};

/// Default interval between summaries.
pub const DEFAULT_WARN_INTERVAL: Duration = Duration::from_secs(5);

/// Helper that rate limits warnings about repeated events.
///
/// The caller counts events via [`record`](Self::record). The next call to
/// [`warn_if_due`](Self::warn_if_due) emits a summary using the provided
/// callback if the configured interval has elapsed. [`flush`](Self::flush)
/// emits immediately if any events have been counted since the last summary.
pub struct RateLimitedWarner {
    last_warn: AtomicU64,
    pending: AtomicU64,
    interval_ms: u64,
    time_provider: TimeProvider,
}

impl Default for RateLimitedWarner {
    fn default() -> Self {
        Self::new(DEFAULT_WARN_INTERVAL)
    }
}

impl RateLimitedWarner {
    /// Create a warner whose first summary can be emitted immediately.
    pub fn new(interval: Duration) -> Self {
        Self::with_time_provider(interval, Box::new(system_time_provider))
    }

    pub fn with_time_provider(interval: Duration, time_provider: TimeProvider) -> Self {
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        Self {
            last_warn: AtomicU64::new(time_provider().saturating_sub(interval_ms)),
            pending: AtomicU64::new(0),
            interval_ms,
            time_provider,
        }
    }

    /// Count one occurrence.
    pub fn record(&self) {
        self.pending.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit a summary if the rate limit interval has elapsed.
    pub fn warn_if_due(&self, mut warn: impl FnMut(u64)) {
        let now = (self.time_provider)();
        let prev = self.last_warn.load(Ordering::Relaxed);
        if now.saturating_sub(prev) >= self.interval_ms {
            let count = self.pending.swap(0, Ordering::Relaxed);
            if count > 0 {
                warn(count);
            }
            self.last_warn.store(now, Ordering::Relaxed);
        }
    }

    /// Immediately summarise any pending occurrences.
    pub fn flush(&self, mut warn: impl FnMut(u64)) {
        let count = self.pending.swap(0, Ordering::Relaxed);
        if count > 0 {
            warn(count);
            self.last_warn
                .store((self.time_provider)(), Ordering::Relaxed);
        }
    }
}
