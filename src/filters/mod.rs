//! Message filters applied per destination.
//!
//! Provides the [`MessageFilter`] trait along with concrete filter builders.
//! A destination consults its filter after the binding-group check; a
//! destination without a filter accepts every package.

use std::sync::Arc;

use thiserror::Error;

use crate::log_package::BoundPackage;

/// Trait implemented by all message filters.
///
/// Filters are `Send + Sync` so the dispatch worker can share them.
pub trait MessageFilter: Send + Sync {
    /// Return `true` if `package` should be delivered.
    fn accepts(&self, package: &BoundPackage) -> bool;
}

impl<F> MessageFilter for F
where
    F: Fn(&BoundPackage) -> bool + Send + Sync,
{
    fn accepts(&self, package: &BoundPackage) -> bool {
        self(package)
    }
}

pub mod level_filter;
pub mod name_filter;

pub use level_filter::{LevelFilter, LevelFilterBuilder};
pub use name_filter::{NameFilter, NameFilterBuilder};

/// Errors that may occur while building a filter.
#[derive(Debug, Error)]
pub enum FilterBuildError {
    /// Invalid user supplied configuration.
    #[error("invalid filter configuration: {0}")]
    InvalidConfig(String),
}

/// Trait implemented by all filter builders.
pub trait FilterBuilderTrait: Send + Sync {
    type Filter: MessageFilter + 'static;

    fn build_inner(&self) -> Result<Self::Filter, FilterBuildError>;

    fn build(&self) -> Result<Arc<dyn MessageFilter>, FilterBuildError> {
        Ok(Arc::new(self.build_inner()?))
    }
}

/// Concrete filter builder variants.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum FilterBuilder {
    /// Build a [`LevelFilter`].
    Level(LevelFilterBuilder),
    /// Build a [`NameFilter`].
    Name(NameFilterBuilder),
}

impl FilterBuilder {
    pub fn build(&self) -> Result<Arc<dyn MessageFilter>, FilterBuildError> {
        match self {
            Self::Level(b) => <LevelFilterBuilder as FilterBuilderTrait>::build(b),
            Self::Name(b) => <NameFilterBuilder as FilterBuilderTrait>::build(b),
        }
    }
}

impl From<LevelFilterBuilder> for FilterBuilder {
    fn from(value: LevelFilterBuilder) -> Self {
        Self::Level(value)
    }
}

impl From<NameFilterBuilder> for FilterBuilder {
    fn from(value: NameFilterBuilder) -> Self {
        Self::Name(value)
    }
}
