//! Helpers shared by unit tests and, behind the `test-util` feature, by the
//! integration tests.

mod collecting_sink;

pub use collecting_sink::{CollectingSink, FailingSink, PanickingSink};

use crate::level::Level;
use crate::log_package::{BoundPackage, GroupId, LogPackage};

/// Packages `0..count` bound to `group`, with the index as the message.
pub fn numbered_packages(count: usize, group: GroupId) -> Vec<BoundPackage> {
    (0..count)
        .map(|i| BoundPackage::new(LogPackage::new("test", Level::Info, &i.to_string()), group))
        .collect()
}

/// Shared capture of the global logger for this test binary.
///
/// `logtest` installs a process-wide logger that can only be set once, so
/// every log-asserting unit test goes through this guard. Records left over
/// from earlier tests are discarded before it is returned. Callers should
/// still be `#[serial]` and search for their record, since unrelated tests
/// may log concurrently.
#[cfg(test)]
pub(crate) fn log_capture() -> parking_lot::MutexGuard<'static, logtest::Logger> {
    use std::sync::OnceLock;

    static LOGGER: OnceLock<parking_lot::Mutex<logtest::Logger>> = OnceLock::new();
    let mut logger = LOGGER
        .get_or_init(|| parking_lot::Mutex::new(logtest::Logger::start()))
        .lock();
    while logger.pop().is_some() {}
    logger
}
