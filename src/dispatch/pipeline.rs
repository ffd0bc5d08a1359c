//! Owner of the queue, the manager, and the run-mode worker.

use std::sync::Arc;

use delegate::delegate;
use log::{debug, warn};
use parking_lot::{Mutex, RwLock};

use crate::destination::DestinationResolver;
use crate::log_package::BoundPackage;
use crate::reporting::{ErrorSink, LogErrorSink, RateLimitedErrorSink, WorkerError};

use super::DispatchError;
use super::config::{DispatchConfig, DispatchMode, DispatchSettings};
use super::manager::{DispatchStats, MessageManager, Normalizer};
use super::queue::MessageQueue;
use super::worker::{WorkerParts, spawn_worker, wake_channel};

type BoxedErrorSink = Box<dyn Fn(&WorkerError) + Send + Sync>;

/// Builder for [`DispatchPipeline`].
pub struct DispatchPipelineBuilder {
    resolver: Arc<dyn DestinationResolver>,
    config: DispatchConfig,
    errors: Arc<dyn ErrorSink>,
    normalizer: Option<Normalizer>,
}

impl DispatchPipelineBuilder {
    pub fn new(resolver: Arc<dyn DestinationResolver>) -> Self {
        Self {
            resolver,
            config: DispatchConfig::default(),
            errors: Arc::new(LogErrorSink),
            normalizer: None,
        }
    }

    pub fn with_config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// Receive dispatch failures. Repeats are rate limited by the configured
    /// error window before reaching `sink`.
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.errors = sink;
        self
    }

    pub fn with_normalizer<F>(mut self, normalizer: F) -> Self
    where
        F: Fn(BoundPackage) -> BoundPackage + Send + Sync + 'static,
    {
        self.normalizer = Some(Arc::new(normalizer));
        self
    }

    /// Validate the configuration and start the pipeline.
    ///
    /// In run mode this spawns the dispatch worker.
    pub fn build(self) -> Result<DispatchPipeline, DispatchError> {
        self.config.validate()?;
        let settings = Arc::new(DispatchSettings::new(&self.config));
        let queue = Arc::new(MessageQueue::new(Arc::clone(&settings)));
        let inner = self.errors;
        let forward: BoxedErrorSink = Box::new(move |err: &WorkerError| inner.report(err));
        let errors = Arc::new(RateLimitedErrorSink::new(forward, self.config.error_window));
        let normalizer: Normalizer = match self.normalizer {
            Some(normalizer) => normalizer,
            None => Arc::new(|package: BoundPackage| package),
        };

        let (wake_tx, wake_rx) = wake_channel();
        let manager = Arc::new(MessageManager::new(
            Arc::clone(&queue),
            Arc::clone(&settings),
            self.resolver,
            normalizer,
            Arc::clone(&errors) as Arc<dyn ErrorSink>,
            wake_tx,
        ));
        let worker = match self.config.mode {
            DispatchMode::Run => Some(spawn_worker(
                Arc::clone(&manager),
                wake_rx,
                Arc::clone(&errors) as Arc<dyn ErrorSink>,
            )?),
            DispatchMode::Debug => None,
        };
        debug!(
            "DispatchPipeline started in {} mode (throttle_ceiling={}, max_chunk_size={})",
            self.config.mode, self.config.throttle_ceiling, self.config.max_chunk_size
        );
        Ok(DispatchPipeline {
            queue,
            manager,
            settings,
            errors,
            worker: Mutex::new(worker),
            closed: RwLock::new(false),
        })
    }
}

/// A running dispatch pipeline.
///
/// Dropping the pipeline shuts it down, flushing whatever is still queued
/// to the active destinations.
pub struct DispatchPipeline {
    queue: Arc<MessageQueue>,
    manager: Arc<MessageManager>,
    settings: Arc<DispatchSettings>,
    errors: Arc<RateLimitedErrorSink<BoxedErrorSink>>,
    worker: Mutex<Option<WorkerParts>>,
    closed: RwLock<bool>,
}

impl DispatchPipeline {
    pub fn builder(resolver: Arc<dyn DestinationResolver>) -> DispatchPipelineBuilder {
        DispatchPipelineBuilder::new(resolver)
    }

    /// Start a run-mode pipeline with default limits.
    pub fn new(resolver: Arc<dyn DestinationResolver>) -> Result<Self, DispatchError> {
        Self::builder(resolver).build()
    }

    /// Start a pipeline with `config` and the default error sink.
    pub fn start(
        resolver: Arc<dyn DestinationResolver>,
        config: DispatchConfig,
    ) -> Result<Self, DispatchError> {
        Self::builder(resolver).with_config(config).build()
    }

    /// Queue one package for dispatch.
    ///
    /// May block when the backlog is at the throttle ceiling, or in debug
    /// mode while the calling thread drains the queue.
    pub fn send(&self, package: BoundPackage) -> Result<(), DispatchError> {
        let closed = self.closed.read();
        if *closed {
            return Err(DispatchError::ShutDown);
        }
        self.queue.send(package, self.manager.as_ref());
        Ok(())
    }

    /// Queue several packages, preserving their order.
    pub fn send_many<I>(&self, packages: I) -> Result<(), DispatchError>
    where
        I: IntoIterator<Item = BoundPackage>,
    {
        let closed = self.closed.read();
        if *closed {
            return Err(DispatchError::ShutDown);
        }
        self.queue.send_many(packages, self.manager.as_ref());
        Ok(())
    }

    /// Dispatch everything queued so far on the calling thread.
    pub fn flush(&self) -> DispatchStats {
        self.manager.flush()
    }

    /// Apply new limits and error window to the running pipeline.
    ///
    /// The mode is fixed at construction; a different mode is ignored with
    /// a warning.
    pub fn reload(&self, config: &DispatchConfig) -> Result<(), DispatchError> {
        self.settings.apply(config)?;
        self.errors.set_window(config.error_window);
        Ok(())
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    pub fn is_shut_down(&self) -> bool {
        *self.closed.read()
    }

    /// Stop accepting packages, stop the worker, and flush the remainder.
    ///
    /// Idempotent; later calls return empty stats.
    pub fn shutdown(&self) -> DispatchStats {
        if self.is_shut_down() {
            return DispatchStats::default();
        }
        // Release producers parked on the throttle before taking the gate.
        self.manager.stop();
        {
            let mut closed = self.closed.write();
            if *closed {
                return DispatchStats::default();
            }
            *closed = true;
        }

        if let Some(worker) = self.worker.lock().take() {
            if worker.shutdown_tx.send(()).is_err() {
                warn!("DispatchPipeline: worker already stopped");
            }
            if worker.handle.join().is_err() {
                warn!("DispatchPipeline: dispatch worker panicked during shutdown");
            }
        }
        let stats = self.manager.flush();
        self.queue.flush_warnings();
        let left = self.queue.len();
        if left > 0 {
            warn!("DispatchPipeline: {left} packages left undelivered; no active destinations");
        }
        debug!(
            "DispatchPipeline shut down after flushing {} packages",
            stats.packages
        );
        stats
    }

    delegate! {
        to self.queue {
            /// Number of packages waiting for dispatch.
            #[call(len)]
            pub fn queued(&self) -> usize;
        }
        to self.manager {
            pub fn is_processing(&self) -> bool;
            /// Block until no dispatch is in progress.
            pub fn wait_idle(&self);
            /// Run one dispatch pass on the calling thread.
            pub fn process_messages(&self) -> DispatchStats;
        }
    }
}

impl Drop for DispatchPipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for DispatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchPipeline")
            .field("queue", &self.queue)
            .field("manager", &self.manager)
            .field("closed", &self.is_shut_down())
            .finish()
    }
}
