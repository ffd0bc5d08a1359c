//! Error taxonomy shared by the framed transports.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by readers, writers, and the transport registry.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Required settings are missing or out of range.
    #[error("invalid transport configuration: {0}")]
    InvalidConfig(String),
    /// The outbound connection was not established within the bound.
    #[error("timed out after {timeout:?} connecting to {target}")]
    ConnectTimeout { target: String, timeout: Duration },
    /// A read or write was attempted on a closed transport.
    #[error("transport is not connected")]
    NotConnected,
    /// No frame arrived within the requested window.
    #[error("no frame available within {0:?}")]
    Timeout(Duration),
    /// The peer closed or reset the connection.
    #[error("peer disconnected")]
    Disconnected,
    /// The frame length does not fit the configured limit or the 32-bit prefix.
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    /// No factory is registered under the requested type key.
    #[error("no transport registered under '{0}'")]
    UnknownTransport(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl TransportError {
    /// True for the expected "nothing arrived" outcome of a bounded read.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}

/// Peer went away: graceful close surfaced as an error, reset, or abort.
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
    )
}

/// Worth retrying the same operation after a short pause.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}
