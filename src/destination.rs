//! Destinations receiving dispatched packages.
//!
//! A [`Destination`] bundles the sinks that actually deliver packages with
//! the routing rules deciding which packages it wants: an enabled flag, a
//! set of accepted binding groups (empty accepts every group), and an
//! optional [`MessageFilter`]. During a dispatch pass the manager appends
//! accepted packages to the destination's interim queue and later flushes
//! that batch to every sink at once.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::filters::MessageFilter;
use crate::log_package::{BoundPackage, GroupId};
use crate::transport::TransportError;

/// Failure reported by a sink while delivering a batch.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("failed to encode package: {0}")]
    Encode(String),
    #[error("failed to decode package: {0}")]
    Decode(String),
    #[error("sink rejected batch: {0}")]
    Rejected(String),
}

/// Delivers batches of packages on behalf of a destination.
pub trait MessageSink: Send + Sync {
    /// Deliver `packages`, in order, for `destination`.
    fn send(&self, destination: &Destination, packages: &[BoundPackage]) -> Result<(), SinkError>;
}

/// A configured recipient of dispatched packages.
pub struct Destination {
    name: String,
    enabled: AtomicBool,
    sinks: Vec<Arc<dyn MessageSink>>,
    groups: HashSet<GroupId>,
    filter: Option<Arc<dyn MessageFilter>>,
    interim: Mutex<Vec<BoundPackage>>,
}

impl Destination {
    pub fn builder(name: impl Into<String>) -> DestinationBuilder {
        DestinationBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Binding groups this destination accepts; empty means all.
    pub fn groups(&self) -> &HashSet<GroupId> {
        &self.groups
    }

    /// Whether `package` should be routed here.
    pub fn accepts(&self, package: &BoundPackage) -> bool {
        self.is_enabled()
            && (self.groups.is_empty() || self.groups.contains(&package.group()))
            && self.filter.as_ref().is_none_or(|f| f.accepts(package))
    }

    pub fn add_interim(&self, package: BoundPackage) {
        self.interim.lock().push(package);
    }

    pub fn interim_len(&self) -> usize {
        self.interim.lock().len()
    }

    /// Take the interim batch, leaving the queue empty.
    pub fn take_interim(&self) -> Vec<BoundPackage> {
        std::mem::take(&mut *self.interim.lock())
    }

    pub fn clear_interim(&self) {
        self.interim.lock().clear();
    }

    /// Send the interim batch to every sink, then discard it.
    ///
    /// Every sink sees the batch even if an earlier one fails; the first
    /// failure is returned. Returns the number of packages flushed.
    pub fn flush_interim(&self) -> Result<usize, SinkError> {
        let batch = self.take_interim();
        if batch.is_empty() {
            return Ok(0);
        }
        let mut first_err = None;
        for sink in &self.sinks {
            if let Err(err) = sink.send(self, &batch) {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(batch.len()),
        }
    }
}

impl std::fmt::Debug for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Destination")
            .field("name", &self.name)
            .field("enabled", &self.is_enabled())
            .field("sinks", &self.sinks.len())
            .field("groups", &self.groups)
            .field("filtered", &self.filter.is_some())
            .finish()
    }
}

/// Builder for [`Destination`].
pub struct DestinationBuilder {
    name: String,
    enabled: bool,
    sinks: Vec<Arc<dyn MessageSink>>,
    groups: HashSet<GroupId>,
    filter: Option<Arc<dyn MessageFilter>>,
}

impl DestinationBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            sinks: Vec::new(),
            groups: HashSet::new(),
            filter: None,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn MessageSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Restrict the destination to `group` (in addition to any already set).
    pub fn with_group(mut self, group: GroupId) -> Self {
        self.groups.insert(group);
        self
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = GroupId>) -> Self {
        self.groups.extend(groups);
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn MessageFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn build(self) -> Destination {
        Destination {
            name: self.name,
            enabled: AtomicBool::new(self.enabled),
            sinks: self.sinks,
            groups: self.groups,
            filter: self.filter,
            interim: Mutex::new(Vec::new()),
        }
    }
}

/// Snapshot of the destinations active for one dispatch pass.
pub type ActiveDestinations = Arc<Vec<Arc<Destination>>>;

/// Supplies the destinations a dispatch pass should fan out to.
pub trait DestinationResolver: Send + Sync {
    /// The active destination group, if one is configured.
    fn active_group(&self) -> Option<ActiveDestinations>;
}

/// Swappable destination group.
///
/// Reconfiguration replaces the whole group; passes already running keep
/// the snapshot they started with.
#[derive(Default)]
pub struct DestinationGroup {
    active: RwLock<Option<ActiveDestinations>>,
}

impl DestinationGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_destinations(destinations: impl IntoIterator<Item = Arc<Destination>>) -> Self {
        let group = Self::new();
        group.activate(destinations);
        group
    }

    /// Replace the active group.
    pub fn activate(&self, destinations: impl IntoIterator<Item = Arc<Destination>>) {
        *self.active.write() = Some(Arc::new(destinations.into_iter().collect()));
    }

    pub fn deactivate(&self) {
        *self.active.write() = None;
    }

    /// Find an active destination by name.
    pub fn get(&self, name: &str) -> Option<Arc<Destination>> {
        self.active
            .read()
            .as_ref()?
            .iter()
            .find(|d| d.name() == name)
            .cloned()
    }
}

impl DestinationResolver for DestinationGroup {
    fn active_group(&self) -> Option<ActiveDestinations> {
        self.active.read().clone()
    }
}
