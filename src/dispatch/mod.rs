//! Queueing and dispatch of bound packages to destinations.
//!
//! Producers append to a [`MessageQueue`]; a [`MessageManager`] drains it in
//! bounded chunks and hands each chunk to the destinations of the active
//! group. [`DispatchPipeline`] owns the pair plus the run-mode worker thread.

mod config;
mod manager;
mod pipeline;
mod queue;
mod worker;

#[cfg(test)]
mod tests;

use thiserror::Error;

pub use config::{
    DEBUG_BACKLOG_THRESHOLD, DEBUG_FLUSH_INTERVAL, DEBUG_POLL_INTERVAL, DEBUG_SETTLE_SLEEP,
    DEFAULT_MAX_CHUNK_SIZE, DEFAULT_THROTTLE_CEILING, DispatchConfig, DispatchMode,
    DispatchSettings, RUN_MODE_SLEEP,
};
pub use manager::{DispatchStats, MessageManager, Normalizer};
pub use pipeline::{DispatchPipeline, DispatchPipelineBuilder};
pub use queue::{MessageQueue, ProcessTrigger};

/// Errors surfaced by the dispatch layer to its callers.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid dispatch configuration: {0}")]
    InvalidConfig(String),
    #[error("dispatch pipeline has been shut down")]
    ShutDown,
    #[error("failed to start dispatch worker: {0}")]
    Spawn(#[from] std::io::Error),
}
