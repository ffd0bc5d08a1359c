//! Connection settings shared by readers and writers.
//!
//! [`ConnectionSettings`] is immutable once built. Transports clone the
//! value they are given at construction, so later changes to a profile held
//! elsewhere cannot affect a transport that is already open.

use std::time::Duration;

use super::{TransportError, frame::DEFAULT_MAX_FRAME_SIZE};

/// Default TCP port for transport profiles.
pub const DEFAULT_PORT: u16 = 8081;
/// Default bound on establishing an outbound connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_millis(2_000);
/// Default bound on a single frame write.
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
/// Default capacity of a reader's inbound frame FIFO.
pub const DEFAULT_READER_CAPACITY: usize = 10_000;
/// Default socket read timeout used so connection workers can observe shutdown.
pub const DEFAULT_READ_POLL: Duration = Duration::from_millis(100);
/// Pause before retrying a read that would block or timed out.
pub const DEFAULT_TRANSIENT_BACKOFF: Duration = Duration::from_millis(50);

/// A named transport endpoint.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConnectionSettings {
    name: String,
    host: String,
    port: u16,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl ConnectionSettings {
    /// Settings for `host:port` with default timeouts.
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
        }
    }

    pub fn builder(name: impl Into<String>) -> ConnectionSettingsBuilder {
        ConnectionSettingsBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub fn write_timeout(&self) -> Duration {
        self.write_timeout
    }

    /// `host:port` as used in diagnostics.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

macro_rules! ensure_positive {
    ($value:expr, $field:expr) => {{
        if $value == 0 {
            Err(TransportError::InvalidConfig(format!(
                "{} must be greater than zero",
                $field
            )))
        } else {
            Ok($value)
        }
    }};
}

macro_rules! option_setter {
    ($(#[$meta:meta])* $fn_name:ident, $field:ident, $ty:ty) => {
        $(#[$meta])*
        pub fn $fn_name(mut self, value: $ty) -> Self {
            self.$field = Some(value);
            self
        }
    };
}

/// Builder for [`ConnectionSettings`].
#[derive(Clone, Debug, Default)]
pub struct ConnectionSettingsBuilder {
    name: String,
    host: Option<String>,
    port: Option<u16>,
    connect_timeout_ms: Option<u64>,
    write_timeout_ms: Option<u64>,
}

impl ConnectionSettingsBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the hostname or IP address.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    option_setter!(
        #[doc = "Set the TCP port (defaults to 8081)."]
        with_port,
        port,
        u16
    );
    option_setter!(with_connect_timeout_ms, connect_timeout_ms, u64);
    option_setter!(with_write_timeout_ms, write_timeout_ms, u64);

    /// Validate and produce the settings.
    ///
    /// The hostname may be empty here; writers reject an empty host when
    /// they are constructed, readers bind to every interface instead.
    pub fn build(&self) -> Result<ConnectionSettings, TransportError> {
        if self.name.trim().is_empty() {
            return Err(TransportError::InvalidConfig(
                "profile name must not be empty".into(),
            ));
        }
        let connect_ms = match self.connect_timeout_ms {
            Some(ms) => ensure_positive!(ms, "connect_timeout_ms")?,
            None => DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
        };
        let write_ms = match self.write_timeout_ms {
            Some(ms) => ensure_positive!(ms, "write_timeout_ms")?,
            None => DEFAULT_WRITE_TIMEOUT.as_millis() as u64,
        };
        Ok(ConnectionSettings {
            name: self.name.clone(),
            host: self.host.clone().unwrap_or_default(),
            port: self.port.unwrap_or(DEFAULT_PORT),
            connect_timeout: Duration::from_millis(connect_ms),
            write_timeout: Duration::from_millis(write_ms),
        })
    }
}

/// Tuning knobs for [`TcpReader`](super::TcpReader).
#[derive(Clone, Debug)]
pub struct ReaderOptions {
    pub capacity: usize,
    pub read_poll: Duration,
    pub transient_backoff: Duration,
    pub max_frame_size: usize,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_READER_CAPACITY,
            read_poll: DEFAULT_READ_POLL,
            transient_backoff: DEFAULT_TRANSIENT_BACKOFF,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ReaderOptions {
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    pub(crate) fn validate(&self) -> Result<(), TransportError> {
        ensure_positive!(self.capacity, "reader capacity")?;
        ensure_positive!(self.read_poll.as_millis(), "read_poll")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn builder_applies_defaults() {
        let settings = ConnectionSettings::builder("collector")
            .with_host("logs.internal")
            .build()
            .expect("defaults are valid");
        assert_eq!(settings.port(), DEFAULT_PORT);
        assert_eq!(settings.connect_timeout(), Duration::from_millis(2_000));
        assert_eq!(settings.target(), "logs.internal:8081");
    }

    #[rstest]
    fn builder_rejects_zero_connect_timeout() {
        let err = ConnectionSettings::builder("collector")
            .with_host("localhost")
            .with_connect_timeout_ms(0)
            .build()
            .expect_err("zero timeout must fail");
        assert!(matches!(err, TransportError::InvalidConfig(msg) if msg.contains("connect_timeout_ms")));
    }

    #[rstest]
    fn builder_requires_a_name() {
        let err = ConnectionSettings::builder("  ")
            .build()
            .expect_err("blank name must fail");
        assert!(matches!(err, TransportError::InvalidConfig(msg) if msg.contains("name")));
    }

    #[rstest]
    fn reader_options_reject_zero_capacity() {
        let err = ReaderOptions::default()
            .with_capacity(0)
            .validate()
            .expect_err("zero capacity must fail");
        assert!(matches!(err, TransportError::InvalidConfig(msg) if msg.contains("capacity")));
    }
}
