//! Dispatch configuration and the live settings shared by queue and manager.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use log::{debug, warn};

use crate::reporting::DEFAULT_ERROR_WINDOW;

use super::DispatchError;

/// Queue depth at which producers start being blocked until drained.
pub const DEFAULT_THROTTLE_CEILING: usize = 500_000;
/// Largest number of packages fanned out in one dispatch round.
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 50_000;

/// Pause around each pass of the run-mode worker.
pub const RUN_MODE_SLEEP: Duration = Duration::from_millis(10);

// Debug-mode tuning. These keep the library responsive while a debugger is
// single-stepping the host; they were measured for that use only.

/// Backlog above which a debug-mode trigger drains synchronously.
pub const DEBUG_BACKLOG_THRESHOLD: usize = 2_000;
/// Time since the last flush after which a debug-mode trigger drains.
pub const DEBUG_FLUSH_INTERVAL: Duration = Duration::from_millis(50);
/// Pause before a debug-mode drain begins.
pub const DEBUG_SETTLE_SLEEP: Duration = Duration::from_millis(1);
/// Poll interval while a debug-mode drain waits for the queue to empty.
pub const DEBUG_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How queued packages are driven to destinations.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// A background worker drains the queue whenever there is backlog.
    #[default]
    Run,
    /// Producers drain cooperatively on their own thread.
    Debug,
}

impl fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Run => "run",
            Self::Debug => "debug",
        })
    }
}

impl FromStr for DispatchMode {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "run" | "release" => Ok(Self::Run),
            "debug" => Ok(Self::Debug),
            other => Err(DispatchError::InvalidConfig(format!(
                "unknown dispatch mode '{other}'"
            ))),
        }
    }
}

/// User-facing dispatch configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchConfig {
    pub mode: DispatchMode,
    pub throttle_ceiling: usize,
    pub max_chunk_size: usize,
    /// Window within which a repeated dispatch failure is reported once.
    pub error_window: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Run,
            throttle_ceiling: DEFAULT_THROTTLE_CEILING,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            error_window: DEFAULT_ERROR_WINDOW,
        }
    }
}

impl DispatchConfig {
    pub fn with_mode(mut self, mode: DispatchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_throttle_ceiling(mut self, ceiling: usize) -> Self {
        self.throttle_ceiling = ceiling;
        self
    }

    pub fn with_max_chunk_size(mut self, size: usize) -> Self {
        self.max_chunk_size = size;
        self
    }

    pub fn with_error_window(mut self, window: Duration) -> Self {
        self.error_window = window;
        self
    }

    pub fn validate(&self) -> Result<(), DispatchError> {
        if self.throttle_ceiling == 0 {
            return Err(DispatchError::InvalidConfig(
                "throttle_ceiling must be greater than zero".into(),
            ));
        }
        if self.max_chunk_size == 0 {
            return Err(DispatchError::InvalidConfig(
                "max_chunk_size must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

/// Reloadable values read by the queue and manager on every operation.
#[derive(Debug)]
pub struct DispatchSettings {
    mode: DispatchMode,
    throttle_ceiling: AtomicUsize,
    max_chunk_size: AtomicUsize,
}

impl DispatchSettings {
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            mode: config.mode,
            throttle_ceiling: AtomicUsize::new(config.throttle_ceiling),
            max_chunk_size: AtomicUsize::new(config.max_chunk_size),
        }
    }

    /// Fixed at construction.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn throttle_ceiling(&self) -> usize {
        self.throttle_ceiling.load(Ordering::Relaxed)
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size.load(Ordering::Relaxed)
    }

    /// Apply a changed configuration.
    pub fn apply(&self, config: &DispatchConfig) -> Result<(), DispatchError> {
        config.validate()?;
        if config.mode != self.mode {
            warn!(
                "DispatchSettings: mode change to {} ignored; restart the pipeline to switch from {}",
                config.mode, self.mode
            );
        }
        self.throttle_ceiling
            .store(config.throttle_ceiling, Ordering::Relaxed);
        self.max_chunk_size
            .store(config.max_chunk_size, Ordering::Relaxed);
        debug!(
            "DispatchSettings reloaded: throttle_ceiling={} max_chunk_size={}",
            config.throttle_ceiling, config.max_chunk_size
        );
        Ok(())
    }
}
