//! Builder and implementation for a severity-threshold filter.

use crate::{filters::MessageFilter, level::Level, log_package::BoundPackage};

/// Accepts packages at or above a minimum severity.
#[derive(Debug)]
pub struct LevelFilter {
    min_level: Level,
}

impl MessageFilter for LevelFilter {
    fn accepts(&self, package: &BoundPackage) -> bool {
        package.package().level >= self.min_level
    }
}

/// Builder for [`LevelFilter`].
#[derive(Clone, Debug, Default)]
pub struct LevelFilterBuilder {
    min_level: Option<Level>,
}

impl LevelFilterBuilder {
    /// Create a new `LevelFilterBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the lowest level let through.
    pub fn with_min_level(mut self, level: Level) -> Self {
        self.min_level = Some(level);
        self
    }
}

impl super::FilterBuilderTrait for LevelFilterBuilder {
    type Filter = LevelFilter;

    fn build_inner(&self) -> Result<Self::Filter, super::FilterBuildError> {
        let min_level = self.min_level.ok_or_else(|| {
            super::FilterBuildError::InvalidConfig("min_level is required".into())
        })?;
        Ok(LevelFilter { min_level })
    }
}
