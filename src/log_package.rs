//! Log package representation and binding-group routing.
//!
//! A [`LogPackage`] is produced by the logging front end and never
//! interpreted by the dispatch core beyond filtering. A [`BoundPackage`]
//! pairs one with the [`GroupId`] used to route it to destinations. Bound
//! packages are immutable once queued; cloning one only bumps a reference
//! count so fan-out to many destinations stays cheap.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::level::Level;

/// Identifier of the binding group a package was emitted under.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

/// Source and runtime context captured alongside a package.
#[derive(Clone, Debug, PartialEq)]
pub struct PackageMetadata {
    pub module_path: String,
    pub filename: String,
    pub line_number: u32,
    pub timestamp: SystemTime,
    pub thread_name: Option<String>,
    pub key_values: BTreeMap<String, String>,
}

impl Default for PackageMetadata {
    fn default() -> Self {
        Self {
            module_path: String::new(),
            filename: String::new(),
            line_number: 0,
            timestamp: SystemTime::now(),
            thread_name: thread::current().name().map(ToString::to_string),
            key_values: BTreeMap::new(),
        }
    }
}

/// A single emitted log message.
#[derive(Clone, Debug, PartialEq)]
pub struct LogPackage {
    /// Name of the logger that emitted the package.
    pub logger: String,
    pub level: Level,
    pub message: String,
    pub metadata: PackageMetadata,
}

impl LogPackage {
    /// Construct a package stamped with the current time and thread.
    pub fn new(logger: &str, level: Level, message: &str) -> Self {
        Self::with_metadata(logger, level, message, PackageMetadata::default())
    }

    pub fn with_metadata(
        logger: &str,
        level: Level,
        message: &str,
        metadata: PackageMetadata,
    ) -> Self {
        Self {
            logger: logger.to_owned(),
            level,
            message: message.to_owned(),
            metadata,
        }
    }
}

impl fmt::Display for LogPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.logger, self.level, self.message)
    }
}

/// A package bound to the group that decides which destinations see it.
#[derive(Clone, Debug)]
pub struct BoundPackage {
    package: Arc<LogPackage>,
    group: GroupId,
}

impl BoundPackage {
    pub fn new(package: LogPackage, group: GroupId) -> Self {
        Self {
            package: Arc::new(package),
            group,
        }
    }

    /// Rebind an already shared package to another group.
    pub fn from_shared(package: Arc<LogPackage>, group: GroupId) -> Self {
        Self { package, group }
    }

    pub fn package(&self) -> &LogPackage {
        &self.package
    }

    pub fn shared(&self) -> &Arc<LogPackage> {
        &self.package
    }

    pub fn group(&self) -> GroupId {
        self.group
    }
}

impl PartialEq for BoundPackage {
    fn eq(&self, other: &Self) -> bool {
        self.group == other.group
            && (Arc::ptr_eq(&self.package, &other.package) || self.package == other.package)
    }
}

impl fmt::Display for BoundPackage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.package, self.group)
    }
}
