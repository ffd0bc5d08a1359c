//! Drains the queue and fans packages out to destinations.
//!
//! [`MessageManager::process_messages`] is the dispatch pass shared by both
//! modes. In run mode [`process`](MessageManager::process) only flags work
//! and wakes the long-lived worker; in debug mode it drains on the calling
//! thread when the backlog or the time since the last flush warrants it.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, TrySendError};
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::destination::{Destination, DestinationResolver};
use crate::log_package::BoundPackage;
use crate::reporting::{ErrorSink, WorkerError};

use super::config::{
    DEBUG_BACKLOG_THRESHOLD, DEBUG_FLUSH_INTERVAL, DEBUG_POLL_INTERVAL, DEBUG_SETTLE_SLEEP,
    DispatchMode, DispatchSettings, RUN_MODE_SLEEP,
};
use super::queue::{MessageQueue, ProcessTrigger};

/// Rewrites a package before routing, e.g. to give unrecognised messages a
/// uniform shape.
pub type Normalizer = Arc<dyn Fn(BoundPackage) -> BoundPackage + Send + Sync>;

/// Upper bound on a single idle wait before re-checking for shutdown.
const IDLE_RECHECK: Duration = Duration::from_millis(100);

/// Outcome of one dispatch pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    /// Packages drained from the queue.
    pub packages: usize,
    /// Chunks fanned out.
    pub rounds: usize,
    /// Destination flushes that failed.
    pub failures: usize,
}

impl DispatchStats {
    fn absorb(&mut self, other: DispatchStats) {
        self.packages += other.packages;
        self.rounds += other.rounds;
        self.failures += other.failures;
    }
}

/// Dispatch coordinator.
pub struct MessageManager {
    queue: Arc<MessageQueue>,
    settings: Arc<DispatchSettings>,
    resolver: Arc<dyn DestinationResolver>,
    normalizer: Normalizer,
    errors: Arc<dyn ErrorSink>,
    dispatch_lock: Mutex<()>,
    processing: Mutex<bool>,
    idle: Condvar,
    last_flush: Mutex<Instant>,
    wake: Sender<()>,
    stopped: AtomicBool,
}

impl MessageManager {
    pub(crate) fn new(
        queue: Arc<MessageQueue>,
        settings: Arc<DispatchSettings>,
        resolver: Arc<dyn DestinationResolver>,
        normalizer: Normalizer,
        errors: Arc<dyn ErrorSink>,
        wake: Sender<()>,
    ) -> Self {
        Self {
            queue,
            settings,
            resolver,
            normalizer,
            errors,
            dispatch_lock: Mutex::new(()),
            processing: Mutex::new(false),
            idle: Condvar::new(),
            last_flush: Mutex::new(Instant::now()),
            wake,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn is_processing(&self) -> bool {
        *self.processing.lock()
    }

    /// Trigger dispatch according to the configured mode.
    pub fn process(&self) {
        match self.settings.mode() {
            DispatchMode::Run => self.request_run(),
            DispatchMode::Debug => self.process_cooperatively(),
        }
    }

    /// Block until no dispatch is in progress or the manager stops.
    pub fn wait_idle(&self) {
        let mut processing = self.processing.lock();
        while *processing && !self.is_stopped() {
            self.idle.wait_for(&mut processing, IDLE_RECHECK);
        }
    }

    fn try_begin(&self) -> bool {
        let mut processing = self.processing.lock();
        if *processing {
            return false;
        }
        *processing = true;
        true
    }

    pub(crate) fn finish(&self) {
        *self.processing.lock() = false;
        self.idle.notify_all();
    }

    /// Clear the in-progress flag unless there is still work a pass could
    /// drain.
    ///
    /// The check runs under the same lock `process` takes, so a producer
    /// either sees the flag still set (and this re-check catches its
    /// package) or sees it cleared and starts a new run.
    fn finish_if_drained(&self) -> bool {
        let mut processing = self.processing.lock();
        if !self.queue.is_empty() && !self.is_stopped() && self.has_destinations() {
            return false;
        }
        *processing = false;
        self.idle.notify_all();
        true
    }

    fn has_destinations(&self) -> bool {
        self.resolver
            .active_group()
            .is_some_and(|destinations| !destinations.is_empty())
    }

    fn request_run(&self) {
        if self.is_stopped() || !self.try_begin() {
            return;
        }
        match self.wake.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => {}
            Err(TrySendError::Disconnected(())) => {
                warn!("MessageManager: dispatch worker is gone; backlog will wait for flush");
                self.finish();
            }
        }
    }

    fn process_cooperatively(&self) {
        if !self.try_begin() {
            return;
        }
        let backlog = self.queue.len();
        let since_flush = self.last_flush.lock().elapsed();
        if backlog > DEBUG_BACKLOG_THRESHOLD || since_flush > DEBUG_FLUSH_INTERVAL {
            thread::sleep(DEBUG_SETTLE_SLEEP);
            self.process_guarded();
            while !self.queue.is_empty() && !self.is_stopped() && self.has_destinations() {
                thread::sleep(DEBUG_POLL_INTERVAL);
                self.process_guarded();
            }
        }
        self.finish();
    }

    /// Body of the run-mode worker once woken: pass, check, repeat until the
    /// queue stays empty.
    ///
    /// With no active destinations the backlog is left in place for a later
    /// run.
    pub(crate) fn run_until_drained(&self) {
        loop {
            thread::sleep(RUN_MODE_SLEEP);
            self.process_guarded();
            if self.finish_if_drained() {
                return;
            }
            thread::sleep(RUN_MODE_SLEEP);
        }
    }

    /// Run passes on the calling thread until one finds nothing to drain.
    ///
    /// The first pass waits for any pass already in flight. Stops early when
    /// no destination group is active, since nothing would be drained.
    pub fn flush(&self) -> DispatchStats {
        let mut total = DispatchStats::default();
        loop {
            let stats = self.process_guarded();
            if stats.packages == 0 {
                return total;
            }
            total.absorb(stats);
        }
    }

    fn process_guarded(&self) -> DispatchStats {
        match catch_unwind(AssertUnwindSafe(|| self.process_messages())) {
            Ok(stats) => stats,
            Err(payload) => {
                self.errors
                    .report(&WorkerError::panic("MessageManager", payload.as_ref()));
                DispatchStats::default()
            }
        }
    }

    /// One dispatch pass. At most one pass runs at a time.
    pub fn process_messages(&self) -> DispatchStats {
        let _pass = self.dispatch_lock.lock();
        let Some(destinations) = self.resolver.active_group() else {
            return DispatchStats::default();
        };
        if destinations.is_empty() {
            return DispatchStats::default();
        }
        let packages = self.queue.drain();
        if packages.is_empty() {
            return DispatchStats::default();
        }

        let max_chunk = self.settings.max_chunk_size().max(1);
        let mut stats = DispatchStats {
            packages: packages.len(),
            ..DispatchStats::default()
        };
        let mut remaining = packages.into_iter().peekable();
        while remaining.peek().is_some() {
            for package in remaining.by_ref().take(max_chunk) {
                let package = (self.normalizer)(package);
                for destination in destinations.iter().filter(|d| d.accepts(&package)) {
                    destination.add_interim(package.clone());
                }
            }
            stats.rounds += 1;
            for destination in destinations.iter() {
                if !self.flush_destination(destination) {
                    stats.failures += 1;
                }
            }
            thread::yield_now();
        }

        *self.last_flush.lock() = Instant::now();
        debug!(
            "MessageManager dispatched {} packages in {} rounds ({} failed flushes)",
            stats.packages, stats.rounds, stats.failures
        );
        stats
    }

    fn flush_destination(&self, destination: &Destination) -> bool {
        match catch_unwind(AssertUnwindSafe(|| destination.flush_interim())) {
            Ok(Ok(_)) => true,
            Ok(Err(source)) => {
                self.errors.report(&WorkerError::Dispatch {
                    destination: destination.name().to_owned(),
                    source,
                });
                false
            }
            Err(payload) => {
                destination.clear_interim();
                self.errors.report(&WorkerError::panic(
                    format!("destination '{}'", destination.name()),
                    payload.as_ref(),
                ));
                false
            }
        }
    }

    pub(crate) fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.idle.notify_all();
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

impl ProcessTrigger for MessageManager {
    fn process(&self) {
        MessageManager::process(self);
    }

    fn wait_idle(&self) {
        MessageManager::wait_idle(self);
    }
}

impl std::fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageManager")
            .field("mode", &self.settings.mode())
            .field("processing", &self.is_processing())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}
