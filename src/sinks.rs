//! Shipping packages to a remote collector over a [`FrameWriter`].
//!
//! Each package becomes one frame holding a MessagePack map with the
//! package fields plus its binding group. [`decode_package`] turns such a
//! frame back into a [`BoundPackage`] on the receiving side.

use std::collections::BTreeMap;
use std::time::{Duration, Instant, UNIX_EPOCH};

use log::{debug, warn};
use parking_lot::Mutex;
use rmp_serde::Serializer;
use serde::{Deserialize, Serialize};

use crate::destination::{Destination, MessageSink, SinkError};
use crate::level::Level;
use crate::log_package::{BoundPackage, GroupId, LogPackage, PackageMetadata};
use crate::rate_limited_warner::RateLimitedWarner;
use crate::transport::{BackoffPolicy, FrameWriter, ReconnectBackoff, TransportError};

#[derive(Serialize)]
struct WirePackage<'a> {
    logger: &'a str,
    level: Level,
    message: &'a str,
    timestamp_ns: u128,
    filename: &'a str,
    line_number: u32,
    module_path: &'a str,
    thread_name: Option<&'a str>,
    key_values: &'a BTreeMap<String, String>,
    group: GroupId,
}

impl<'a> From<&'a BoundPackage> for WirePackage<'a> {
    fn from(bound: &'a BoundPackage) -> Self {
        let package = bound.package();
        let timestamp_ns = package
            .metadata
            .timestamp
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_nanos())
            .unwrap_or_default();
        Self {
            logger: &package.logger,
            level: package.level,
            message: &package.message,
            timestamp_ns,
            filename: &package.metadata.filename,
            line_number: package.metadata.line_number,
            module_path: &package.metadata.module_path,
            thread_name: package.metadata.thread_name.as_deref(),
            key_values: &package.metadata.key_values,
            group: bound.group(),
        }
    }
}

#[derive(Deserialize)]
struct OwnedWirePackage {
    logger: String,
    level: Level,
    message: String,
    timestamp_ns: u128,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    line_number: u32,
    #[serde(default)]
    module_path: String,
    #[serde(default)]
    thread_name: Option<String>,
    #[serde(default)]
    key_values: BTreeMap<String, String>,
    #[serde(default)]
    group: GroupId,
}

/// Serialise a bound package into a MessagePack payload.
pub fn encode_package(bound: &BoundPackage) -> Result<Vec<u8>, SinkError> {
    let mut buf = Vec::with_capacity(128);
    WirePackage::from(bound)
        .serialize(&mut Serializer::new(&mut buf).with_struct_map())
        .map_err(|err| SinkError::Encode(err.to_string()))?;
    Ok(buf)
}

/// Rebuild a bound package from a payload produced by [`encode_package`].
pub fn decode_package(payload: &[u8]) -> Result<BoundPackage, SinkError> {
    let wire: OwnedWirePackage =
        rmp_serde::from_slice(payload).map_err(|err| SinkError::Decode(err.to_string()))?;
    let nanos = u64::try_from(wire.timestamp_ns).unwrap_or(u64::MAX);
    let metadata = PackageMetadata {
        module_path: wire.module_path,
        filename: wire.filename,
        line_number: wire.line_number,
        timestamp: UNIX_EPOCH + Duration::from_nanos(nanos),
        thread_name: wire.thread_name,
        key_values: wire.key_values,
    };
    let package = LogPackage::with_metadata(&wire.logger, wire.level, &wire.message, metadata);
    Ok(BoundPackage::new(package, wire.group))
}

/// [`MessageSink`] writing one frame per package to a remote reader.
///
/// The connection is opened lazily. After a failed open or write the sink
/// fails fast with [`TransportError::NotConnected`] until the reconnect
/// backoff allows another attempt.
pub struct FrameWriterSink {
    writer: Box<dyn FrameWriter>,
    backoff: Mutex<ReconnectBackoff>,
    dropped: RateLimitedWarner,
}

impl FrameWriterSink {
    pub fn new(writer: Box<dyn FrameWriter>) -> Self {
        Self::with_backoff(writer, BackoffPolicy::default())
    }

    pub fn with_backoff(writer: Box<dyn FrameWriter>, policy: BackoffPolicy) -> Self {
        Self {
            writer,
            backoff: Mutex::new(ReconnectBackoff::new(policy)),
            dropped: RateLimitedWarner::default(),
        }
    }

    pub fn writer(&self) -> &dyn FrameWriter {
        self.writer.as_ref()
    }

    fn ensure_open(&self, backoff: &mut ReconnectBackoff) -> Result<(), TransportError> {
        if self.writer.is_open() {
            return Ok(());
        }
        let now = Instant::now();
        if !backoff.ready(now) {
            return Err(TransportError::NotConnected);
        }
        match self.writer.open() {
            Ok(()) => {
                backoff.record_success();
                Ok(())
            }
            Err(err) => {
                let delay = backoff.record_failure(now);
                debug!(
                    "FrameWriterSink '{}': connect failed ({err}); next attempt in {delay:?}",
                    self.writer.name()
                );
                Err(err)
            }
        }
    }

    fn note_dropped(&self, count: usize) {
        self.dropped.record();
        self.dropped.warn_if_due(|times| self.warn_dropped(times));
        debug!(
            "FrameWriterSink '{}': dropped a batch of {count} packages",
            self.writer.name()
        );
    }

    fn warn_dropped(&self, times: u64) {
        warn!(
            "FrameWriterSink '{}': dropped {times} batches",
            self.writer.name()
        );
    }
}

impl MessageSink for FrameWriterSink {
    fn send(&self, _destination: &Destination, packages: &[BoundPackage]) -> Result<(), SinkError> {
        let mut backoff = self.backoff.lock();
        if let Err(err) = self.ensure_open(&mut backoff) {
            self.note_dropped(packages.len());
            return Err(err.into());
        }
        for (sent, package) in packages.iter().enumerate() {
            let payload = encode_package(package)?;
            if let Err(err) = self.writer.write(&payload) {
                backoff.record_failure(Instant::now());
                self.note_dropped(packages.len() - sent);
                return Err(err.into());
            }
        }
        Ok(())
    }
}

impl Drop for FrameWriterSink {
    fn drop(&mut self) {
        self.dropped.flush(|times| self.warn_dropped(times));
        self.writer.close();
    }
}

impl std::fmt::Debug for FrameWriterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriterSink")
            .field("writer", &self.writer.name())
            .field("failures", &self.backoff.lock().failures())
            .finish()
    }
}
