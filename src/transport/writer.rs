//! Outbound half of the framed transport.

use std::{
    io::{self, Write},
    net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs},
    time::Duration,
};

use log::{debug, warn};
use parking_lot::Mutex;

use super::{ConnectionSettings, FrameWriter, TransportError, frame::length_prefix};

/// Writes length-prefixed frames to a single remote host.
///
/// Every public operation serialises on one lock. The writer is built for
/// safe sequential use from several owners that may open or close it, not
/// for parallel writes.
pub struct TcpWriter {
    settings: ConnectionSettings,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpWriter {
    /// Snapshot `settings` and validate them for outbound use.
    pub fn new(settings: &ConnectionSettings) -> Result<Self, TransportError> {
        if settings.host().trim().is_empty() {
            return Err(TransportError::InvalidConfig(format!(
                "writer '{}' requires a hostname",
                settings.name()
            )));
        }
        if settings.port() == 0 {
            return Err(TransportError::InvalidConfig(format!(
                "writer '{}' requires a non-zero port",
                settings.name()
            )));
        }
        Ok(Self {
            settings: settings.clone(),
            stream: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    fn connect(&self) -> Result<TcpStream, TransportError> {
        let addrs = (self.settings.host(), self.settings.port()).to_socket_addrs()?;
        let stream = connect_first(
            addrs,
            &self.settings.target(),
            self.settings.connect_timeout(),
            TcpStream::connect_timeout,
        )?;
        stream.set_nodelay(true)?;
        stream.set_write_timeout(Some(self.settings.write_timeout()))?;
        Ok(stream)
    }
}

/// Try each resolved address in order until one connects.
///
/// If any attempt timed out the failure is reported as
/// [`TransportError::ConnectTimeout`]; otherwise the last io error wins.
fn connect_first<S, I, F>(
    addrs: I,
    target: &str,
    timeout: Duration,
    mut connect: F,
) -> Result<S, TransportError>
where
    I: IntoIterator<Item = SocketAddr>,
    F: FnMut(&SocketAddr, Duration) -> io::Result<S>,
{
    let mut timed_out = false;
    let mut last_err = None;
    for addr in addrs {
        match connect(&addr, timeout) {
            Ok(stream) => return Ok(stream),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => timed_out = true,
            Err(err) => last_err = Some(err),
        }
    }
    if timed_out {
        return Err(TransportError::ConnectTimeout {
            target: target.to_owned(),
            timeout,
        });
    }
    Err(last_err
        .unwrap_or_else(|| {
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("{target} did not resolve"),
            )
        })
        .into())
}

/// Probe a socket without consuming data: a zero-byte peek means the peer
/// has closed its side.
fn peer_alive(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return false;
    }
    let mut probe = [0u8; 1];
    let alive = match stream.peek(&mut probe) {
        Ok(0) => false,
        Ok(_) => true,
        Err(err) => err.kind() == io::ErrorKind::WouldBlock,
    };
    stream.set_nonblocking(false).is_ok() && alive
}

fn release(stream: TcpStream) {
    let _ = stream.shutdown(Shutdown::Both);
}

impl FrameWriter for TcpWriter {
    fn name(&self) -> &str {
        self.settings.name()
    }

    fn open(&self) -> Result<(), TransportError> {
        let mut guard = self.stream.lock();
        if let Some(stream) = guard.take() {
            if peer_alive(&stream) {
                *guard = Some(stream);
                return Ok(());
            }
            release(stream);
        }
        let stream = self.connect()?;
        debug!(
            "TcpWriter '{}' connected to {}",
            self.settings.name(),
            self.settings.target()
        );
        *guard = Some(stream);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.lock().as_ref().is_some_and(peer_alive)
    }

    fn write(&self, payload: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.stream.lock();
        let Some(stream) = guard.as_mut() else {
            return Err(TransportError::NotConnected);
        };
        if !peer_alive(stream) {
            debug!(
                "TcpWriter '{}': {} closed the connection",
                self.settings.name(),
                self.settings.target()
            );
            if let Some(stream) = guard.take() {
                release(stream);
            }
            return Err(TransportError::NotConnected);
        }
        let prefix = length_prefix(payload.len())?;
        let result = stream
            .write_all(&prefix)
            .and_then(|()| stream.write_all(payload))
            .and_then(|()| stream.flush());
        if let Err(err) = result {
            warn!(
                "TcpWriter '{}' write to {} failed: {err}",
                self.settings.name(),
                self.settings.target()
            );
            if let Some(stream) = guard.take() {
                release(stream);
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn close(&self) {
        if let Some(stream) = self.stream.lock().take() {
            release(stream);
            debug!("TcpWriter '{}' closed", self.settings.name());
        }
    }
}

impl Drop for TcpWriter {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for TcpWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpWriter")
            .field("settings", &self.settings)
            .finish()
    }
}
