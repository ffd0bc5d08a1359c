//! Dispatch and transport core for a structured logging pipeline.
//!
//! Producers hand [`BoundPackage`]s to a [`DispatchPipeline`], which queues
//! them, throttles producers under overload and fans batches out to the
//! destinations of the active group. [`FrameWriterSink`] ships packages to
//! a remote process as length-prefixed frames; on the far side a
//! [`TcpReader`] collects frames and a [`MessageListener`] turns them back
//! into callbacks.

pub mod config;
pub mod destination;
pub mod dispatch;
pub mod filters;
pub mod level;
pub mod listener;
pub mod log_package;
pub mod rate_limited_warner;
pub mod reporting;
pub mod sinks;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod test_utils;

pub use config::{ConfigError, FileConfig, TransportProfile, load_ini, parse_ini};
pub use destination::{
    ActiveDestinations, Destination, DestinationBuilder, DestinationGroup, DestinationResolver,
    MessageSink, SinkError,
};
pub use dispatch::{
    DispatchConfig, DispatchError, DispatchMode, DispatchPipeline, DispatchPipelineBuilder,
    DispatchStats, MessageManager, MessageQueue,
};
pub use filters::{FilterBuildError, FilterBuilder, MessageFilter};
pub use level::{Level, ParseLevelError};
pub use listener::{ListenerError, ListenerOptions, MessageListener};
pub use log_package::{BoundPackage, GroupId, LogPackage, PackageMetadata};
pub use reporting::{
    ErrorSink, ErrorSlot, LogErrorSink, RateLimitedErrorSink, WorkerError,
};
pub use sinks::{FrameWriterSink, decode_package, encode_package};
pub use transport::{
    ConnectionSettings, ConnectionSettingsBuilder, FrameReader, FrameWriter, ReaderOptions,
    TcpReader, TcpWriter, TransportError, TransportRegistry,
};
