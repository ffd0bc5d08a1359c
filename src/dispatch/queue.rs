//! Holding area for outbound bound packages and its throttle policy.
//!
//! Appends never fail and never drop. Once the backlog reaches the throttle
//! ceiling the producing thread is held until the manager reports idle, so
//! an overloaded pipeline adds latency to producers rather than losing
//! packages.

use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;

use crate::log_package::BoundPackage;
use crate::rate_limited_warner::RateLimitedWarner;

use super::config::DispatchSettings;

/// What the queue needs from whoever drains it.
pub trait ProcessTrigger {
    /// Request a dispatch pass. May return before the pass runs.
    fn process(&self);

    /// Block until no dispatch is in progress.
    fn wait_idle(&self);
}

/// Ordered, thread-safe package backlog.
pub struct MessageQueue {
    items: Mutex<Vec<BoundPackage>>,
    throttle: Mutex<()>,
    settings: Arc<DispatchSettings>,
    throttled: RateLimitedWarner,
}

impl MessageQueue {
    pub fn new(settings: Arc<DispatchSettings>) -> Self {
        Self {
            items: Mutex::new(Vec::new()),
            throttle: Mutex::new(()),
            settings,
            throttled: RateLimitedWarner::default(),
        }
    }

    /// Queue one package and request processing.
    pub fn send<T: ProcessTrigger + ?Sized>(&self, package: BoundPackage, trigger: &T) {
        self.send_many(std::iter::once(package), trigger);
    }

    /// Queue packages, preserving their order, and request processing.
    ///
    /// Blocks the caller when the backlog is at or above the throttle
    /// ceiling until `trigger` reports idle.
    pub fn send_many<T, I>(&self, packages: I, trigger: &T)
    where
        T: ProcessTrigger + ?Sized,
        I: IntoIterator<Item = BoundPackage>,
    {
        let _throttle = self.throttle.lock();
        let count = self.append(packages);
        let ceiling = self.settings.throttle_ceiling();
        if count < ceiling {
            trigger.process();
            return;
        }

        self.throttled.record();
        self.throttled
            .warn_if_due(|times| warn_throttled(ceiling, times));
        self.reclaim();
        trigger.process();
        trigger.wait_idle();
        self.reclaim();
    }

    fn append<I: IntoIterator<Item = BoundPackage>>(&self, packages: I) -> usize {
        let mut items = self.items.lock();
        items.extend(packages);
        items.len()
    }

    /// Remove and return every queued package in insertion order.
    ///
    /// The backing storage goes with the returned vector, so a large
    /// backlog does not keep its allocation after the drain.
    pub fn drain(&self) -> Vec<BoundPackage> {
        std::mem::take(&mut *self.items.lock())
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Log throttle events not yet covered by a summary.
    pub fn flush_warnings(&self) {
        let ceiling = self.settings.throttle_ceiling();
        self.throttled.flush(|times| warn_throttled(ceiling, times));
    }

    /// Release spare backing storage.
    pub fn reclaim(&self) {
        let mut items = self.items.lock();
        let spare = items.capacity() - items.len();
        if spare > 0 {
            items.shrink_to_fit();
            debug!("MessageQueue: released {spare} spare slots");
        }
    }
}

fn warn_throttled(ceiling: usize, times: u64) {
    warn!(
        "MessageQueue: backlog reached the throttle ceiling of {ceiling}; producers blocked {times} times"
    );
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("len", &self.len())
            .field("throttle_ceiling", &self.settings.throttle_ceiling())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::config::DispatchConfig;
    use crate::log_package::GroupId;
    use crate::test_utils::{log_capture, numbered_packages};
    use rstest::{fixture, rstest};
    use serial_test::serial;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingTrigger {
        processed: AtomicUsize,
        waited: AtomicUsize,
    }

    impl ProcessTrigger for CountingTrigger {
        fn process(&self) {
            self.processed.fetch_add(1, Ordering::SeqCst);
        }

        fn wait_idle(&self) {
            self.waited.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[fixture]
    fn queue() -> MessageQueue {
        let config = DispatchConfig::default().with_throttle_ceiling(3);
        MessageQueue::new(Arc::new(DispatchSettings::new(&config)))
    }

    #[rstest]
    fn drain_preserves_order_and_empties(queue: MessageQueue) {
        let trigger = CountingTrigger::default();
        queue.send_many(numbered_packages(2, GroupId(0)), &trigger);
        let drained = queue.drain();
        let messages: Vec<_> = drained.iter().map(|p| p.package().message.as_str()).collect();
        assert_eq!(messages, vec!["0", "1"]);
        assert!(queue.is_empty());
        assert_eq!(trigger.processed.load(Ordering::SeqCst), 1);
    }

    #[rstest]
    fn below_ceiling_never_waits(queue: MessageQueue) {
        let trigger = CountingTrigger::default();
        for package in numbered_packages(2, GroupId(0)) {
            queue.send(package, &trigger);
        }
        assert_eq!(trigger.processed.load(Ordering::SeqCst), 2);
        assert_eq!(trigger.waited.load(Ordering::SeqCst), 0);
    }

    #[rstest]
    fn reaching_ceiling_waits_for_idle(queue: MessageQueue) {
        let trigger = CountingTrigger::default();
        queue.send_many(numbered_packages(3, GroupId(0)), &trigger);
        assert_eq!(trigger.waited.load(Ordering::SeqCst), 1);
        assert_eq!(queue.len(), 3, "throttling never drops packages");
    }

    #[rstest]
    fn drain_releases_storage(queue: MessageQueue) {
        let trigger = CountingTrigger::default();
        queue.send_many(numbered_packages(2, GroupId(0)), &trigger);
        let _ = queue.drain();
        assert_eq!(queue.items.lock().capacity(), 0);
    }

    #[rstest]
    #[serial]
    fn pending_throttle_summary_is_flushed() {
        let config = DispatchConfig::default().with_throttle_ceiling(7);
        let queue = MessageQueue::new(Arc::new(DispatchSettings::new(&config)));
        let trigger = CountingTrigger::default();
        let mut logger = log_capture();
        for _ in 0..3 {
            queue.send_many(numbered_packages(7, GroupId(0)), &trigger);
            let _ = queue.drain();
        }
        queue.flush_warnings();
        queue.flush_warnings();

        let summaries: Vec<String> = std::iter::from_fn(|| logger.pop())
            .map(|record| record.args().to_owned())
            .filter(|line| line.contains("throttle ceiling of 7"))
            .collect();
        assert_eq!(
            summaries,
            vec![
                "MessageQueue: backlog reached the throttle ceiling of 7; producers blocked 1 times",
                "MessageQueue: backlog reached the throttle ceiling of 7; producers blocked 2 times",
            ]
        );
    }
}
