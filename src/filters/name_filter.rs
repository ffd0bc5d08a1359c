//! Builder and implementation for a logger-name filter.

use crate::{filters::MessageFilter, log_package::BoundPackage};

/// Accepts packages whose logger name equals the prefix or is a dotted
/// descendant of it.
#[derive(Debug)]
pub struct NameFilter {
    prefix: String,
}

impl MessageFilter for NameFilter {
    fn accepts(&self, package: &BoundPackage) -> bool {
        let logger = package.package().logger.as_str();
        match logger.strip_prefix(self.prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('.'),
            None => false,
        }
    }
}

/// Builder for [`NameFilter`].
#[derive(Clone, Debug, Default)]
pub struct NameFilterBuilder {
    prefix: Option<String>,
}

impl NameFilterBuilder {
    /// Create a new `NameFilterBuilder`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the logger name (or ancestor name) to accept.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

impl super::FilterBuilderTrait for NameFilterBuilder {
    type Filter = NameFilter;

    fn build_inner(&self) -> Result<Self::Filter, super::FilterBuildError> {
        let prefix = self
            .prefix
            .clone()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| super::FilterBuildError::InvalidConfig("prefix is required".into()))?;
        Ok(NameFilter { prefix })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterBuilderTrait;
    use crate::level::Level;
    use crate::log_package::{GroupId, LogPackage};
    use rstest::rstest;

    fn package(name: &str) -> BoundPackage {
        BoundPackage::new(LogPackage::new(name, Level::Info, "msg"), GroupId(0))
    }

    #[rstest]
    #[case("core", "core", true)]
    #[case("core", "core.child", true)]
    #[case("core", "corelib", false)]
    #[case("core", "other", false)]
    fn name_filter_behaviour(
        #[case] prefix: &str,
        #[case] logger_name: &str,
        #[case] expected: bool,
    ) {
        let filter = NameFilterBuilder::new()
            .with_prefix(prefix)
            .build()
            .expect("build should succeed");
        assert_eq!(filter.accepts(&package(logger_name)), expected);
    }
}
