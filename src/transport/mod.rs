//! Framed TCP transport.
//!
//! Each frame on the wire is a 4-byte little-endian length followed by that
//! many payload bytes; see [`frame`]. [`TcpWriter`] ships frames to one
//! remote host, [`TcpReader`] accepts any number of inbound connections and
//! queues their frames for a consumer. Both are reachable through the
//! object-safe [`FrameWriter`] and [`FrameReader`] traits so a
//! [`TransportRegistry`] can construct them by configured type key.

pub mod backoff;
mod error;
pub mod frame;
mod reader;
mod registry;
mod settings;
mod writer;


use std::sync::Arc;
use std::time::Duration;

use crate::reporting::ErrorSlot;

pub use backoff::{BackoffPolicy, ReconnectBackoff};
pub use error::{TransportError, is_disconnect, is_transient};
pub use frame::{FrameAssembler, encode_frame};
pub use reader::TcpReader;
pub use registry::{ReaderFactory, TCP_TRANSPORT, TransportRegistry, WriterFactory};
pub use settings::{
    ConnectionSettings, ConnectionSettingsBuilder, DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT,
    ReaderOptions,
};
pub use writer::TcpWriter;

/// Inbound side of a framed transport.
pub trait FrameReader: Send + Sync {
    fn name(&self) -> &str;

    /// Start listening. Idempotent.
    fn open(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Block until a frame is available.
    fn read(&self) -> Result<Vec<u8>, TransportError>;

    /// Block until a frame is available or `timeout` elapses, in which case
    /// [`TransportError::Timeout`] is returned.
    fn read_timeout(&self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Stop listening and release sockets. Idempotent.
    fn close(&self);

    /// Channel through which background workers report failures.
    fn errors(&self) -> &Arc<ErrorSlot>;
}

/// Outbound side of a framed transport.
pub trait FrameWriter: Send + Sync {
    fn name(&self) -> &str;

    /// Establish the connection if it is not already live.
    fn open(&self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Write one frame. Fails with [`TransportError::NotConnected`] when not
    /// open; any I/O failure closes the connection.
    fn write(&self, payload: &[u8]) -> Result<(), TransportError>;

    /// Release the connection. Idempotent.
    fn close(&self);
}

impl std::fmt::Debug for dyn FrameReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameReader")
            .field("name", &self.name())
            .field("open", &self.is_open())
            .finish()
    }
}

impl std::fmt::Debug for dyn FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("name", &self.name())
            .field("open", &self.is_open())
            .finish()
    }
}
