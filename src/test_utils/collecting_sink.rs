//! Sinks that record or refuse what they are sent.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::destination::{Destination, MessageSink, SinkError};
use crate::log_package::BoundPackage;

/// Sink that stores every batch it receives for later inspection.
#[derive(Clone, Default)]
pub struct CollectingSink {
    batches: Arc<Mutex<Vec<Vec<BoundPackage>>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches received.
    pub fn batches(&self) -> usize {
        self.batches.lock().len()
    }

    /// Size of each batch, in arrival order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().iter().map(Vec::len).collect()
    }

    /// Every package received, flattened in arrival order.
    pub fn packages(&self) -> Vec<BoundPackage> {
        self.batches.lock().iter().flatten().cloned().collect()
    }

    /// Messages of every package received, in arrival order.
    pub fn messages(&self) -> Vec<String> {
        self.batches
            .lock()
            .iter()
            .flatten()
            .map(|p| p.package().message.clone())
            .collect()
    }
}

impl MessageSink for CollectingSink {
    fn send(&self, _destination: &Destination, packages: &[BoundPackage]) -> Result<(), SinkError> {
        self.batches.lock().push(packages.to_vec());
        Ok(())
    }
}

/// Sink that rejects every batch and counts the attempts.
pub struct FailingSink {
    reason: String,
    attempts: AtomicUsize,
}

impl FailingSink {
    pub fn new(reason: &str) -> Self {
        Self {
            reason: reason.to_owned(),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl MessageSink for FailingSink {
    fn send(&self, _destination: &Destination, _packages: &[BoundPackage]) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(SinkError::Rejected(self.reason.clone()))
    }
}

/// Sink that panics on every batch.
#[derive(Default)]
pub struct PanickingSink;

impl MessageSink for PanickingSink {
    fn send(&self, destination: &Destination, _packages: &[BoundPackage]) -> Result<(), SinkError> {
        panic!("sink for {} exploded", destination.name());
    }
}
