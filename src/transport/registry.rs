//! Explicit registry mapping a transport type key to its constructors.

use std::collections::HashMap;

use super::{
    ConnectionSettings, FrameReader, FrameWriter, TcpReader, TcpWriter, TransportError,
};

/// Constructs a reader from a settings snapshot.
pub type ReaderFactory = fn(&ConnectionSettings) -> Result<Box<dyn FrameReader>, TransportError>;
/// Constructs a writer from a settings snapshot.
pub type WriterFactory = fn(&ConnectionSettings) -> Result<Box<dyn FrameWriter>, TransportError>;

/// Key under which the built-in TCP transport is registered.
pub const TCP_TRANSPORT: &str = "tcp";

fn tcp_reader(settings: &ConnectionSettings) -> Result<Box<dyn FrameReader>, TransportError> {
    Ok(Box::new(TcpReader::new(settings)?))
}

fn tcp_writer(settings: &ConnectionSettings) -> Result<Box<dyn FrameWriter>, TransportError> {
    Ok(Box::new(TcpWriter::new(settings)?))
}

fn normalise(key: &str) -> String {
    key.trim().to_ascii_lowercase()
}

/// Reader and writer factories keyed by configured type name.
///
/// Keys are case-insensitive.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    readers: HashMap<String, ReaderFactory>,
    writers: HashMap<String, WriterFactory>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the TCP transport registered under `"tcp"`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_reader(TCP_TRANSPORT, tcp_reader);
        registry.register_writer(TCP_TRANSPORT, tcp_writer);
        registry
    }

    /// Register a reader factory, returning any factory it replaces.
    pub fn register_reader(&mut self, key: &str, factory: ReaderFactory) -> Option<ReaderFactory> {
        self.readers.insert(normalise(key), factory)
    }

    /// Register a writer factory, returning any factory it replaces.
    pub fn register_writer(&mut self, key: &str, factory: WriterFactory) -> Option<WriterFactory> {
        self.writers.insert(normalise(key), factory)
    }

    pub fn create_reader(
        &self,
        key: &str,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn FrameReader>, TransportError> {
        let factory = self
            .readers
            .get(&normalise(key))
            .ok_or_else(|| TransportError::UnknownTransport(key.to_owned()))?;
        factory(settings)
    }

    pub fn create_writer(
        &self,
        key: &str,
        settings: &ConnectionSettings,
    ) -> Result<Box<dyn FrameWriter>, TransportError> {
        let factory = self
            .writers
            .get(&normalise(key))
            .ok_or_else(|| TransportError::UnknownTransport(key.to_owned()))?;
        factory(settings)
    }

    /// Registered reader keys, sorted.
    pub fn reader_keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.readers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }

    /// Registered writer keys, sorted.
    pub fn writer_keys(&self) -> Vec<&str> {
        let mut keys: Vec<_> = self.writers.keys().map(String::as_str).collect();
        keys.sort_unstable();
        keys
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field("readers", &self.reader_keys())
            .field("writers", &self.writer_keys())
            .finish()
    }
}
