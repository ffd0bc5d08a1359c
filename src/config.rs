//! INI configuration for transport profiles and dispatch settings.
//!
//! ```ini
//! [dispatch]
//! mode = run
//! throttle_ceiling = 500000
//! max_chunk_size = 50000
//! error_window_secs = 1200
//!
//! [transport.collector]
//! type = tcp
//! host = logs.internal
//! port = 8081
//! connect_timeout_ms = 2000
//! ```
//!
//! Every `[transport.<name>]` section becomes a [`TransportProfile`]. The
//! `host` key is required; an empty value makes a reader bind to every
//! interface.

use std::fmt::Display;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use log::{debug, warn};
use thiserror::Error;

use crate::dispatch::{DispatchConfig, DispatchMode};
use crate::transport::{
    ConnectionSettings, FrameReader, FrameWriter, TCP_TRANSPORT, TransportError, TransportRegistry,
};

const DISPATCH_SECTION: &str = "dispatch";
const TRANSPORT_PREFIX: &str = "transport.";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path} is invalid: {message}")]
    Ini { path: String, message: String },
    #[error("section [{section}] is missing required key '{key}'")]
    MissingKey { section: String, key: String },
    #[error("invalid value '{value}' for '{key}' in [{section}]: {reason}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
        reason: String,
    },
}

/// A named transport endpoint and the type key used to construct it.
#[derive(Clone, Debug)]
pub struct TransportProfile {
    pub kind: String,
    pub settings: ConnectionSettings,
}

impl TransportProfile {
    pub fn name(&self) -> &str {
        self.settings.name()
    }

    pub fn create_reader(
        &self,
        registry: &TransportRegistry,
    ) -> Result<Box<dyn FrameReader>, TransportError> {
        registry.create_reader(&self.kind, &self.settings)
    }

    pub fn create_writer(
        &self,
        registry: &TransportRegistry,
    ) -> Result<Box<dyn FrameWriter>, TransportError> {
        registry.create_writer(&self.kind, &self.settings)
    }
}

/// Parsed configuration file.
#[derive(Clone, Debug, Default)]
pub struct FileConfig {
    pub dispatch: DispatchConfig,
    /// Profiles in file order.
    pub profiles: Vec<TransportProfile>,
}

impl FileConfig {
    pub fn profile(&self, name: &str) -> Option<&TransportProfile> {
        self.profiles.iter().find(|p| p.name() == name)
    }
}

/// Read and parse an INI file.
pub fn load_ini(path: impl AsRef<Path>) -> Result<FileConfig, ConfigError> {
    let path = path.as_ref();
    let label = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: label.clone(),
        source,
    })?;
    parse_document(&label, &text)
}

/// Parse INI text.
pub fn parse_ini(text: &str) -> Result<FileConfig, ConfigError> {
    parse_document("<inline>", text)
}

fn parse_document(label: &str, text: &str) -> Result<FileConfig, ConfigError> {
    let ini = Ini::load_from_str(text).map_err(|err| ConfigError::Ini {
        path: label.to_owned(),
        message: err.to_string(),
    })?;

    let mut config = FileConfig::default();
    for (section, props) in ini.iter() {
        match section {
            None => {}
            Some(DISPATCH_SECTION) => config.dispatch = parse_dispatch(props)?,
            Some(name) => match name.strip_prefix(TRANSPORT_PREFIX) {
                Some(profile) => config.profiles.push(parse_profile(name, profile, props)?),
                None => debug!("config: ignoring section [{name}] in {label}"),
            },
        }
    }
    Ok(config)
}

fn parse_dispatch(props: &Properties) -> Result<DispatchConfig, ConfigError> {
    let mut dispatch = DispatchConfig::default();
    for (key, value) in props.iter() {
        match key {
            "mode" => {
                dispatch.mode = parse_value::<DispatchMode>(DISPATCH_SECTION, key, value)?;
            }
            "throttle_ceiling" => {
                dispatch.throttle_ceiling = parse_value(DISPATCH_SECTION, key, value)?;
            }
            "max_chunk_size" => {
                dispatch.max_chunk_size = parse_value(DISPATCH_SECTION, key, value)?;
            }
            "error_window_secs" => {
                dispatch.error_window =
                    Duration::from_secs(parse_value(DISPATCH_SECTION, key, value)?);
            }
            other => warn!("config: ignoring unknown key '{other}' in [{DISPATCH_SECTION}]"),
        }
    }
    dispatch
        .validate()
        .map_err(|err| invalid(DISPATCH_SECTION, "dispatch", "", err))?;
    Ok(dispatch)
}

fn parse_profile(
    section: &str,
    name: &str,
    props: &Properties,
) -> Result<TransportProfile, ConfigError> {
    let host = props.get("host").ok_or_else(|| ConfigError::MissingKey {
        section: section.to_owned(),
        key: "host".into(),
    })?;
    let mut builder = ConnectionSettings::builder(name).with_host(host.trim());
    let mut kind = TCP_TRANSPORT.to_owned();
    for (key, value) in props.iter() {
        match key {
            "host" => {}
            "type" => kind = value.trim().to_ascii_lowercase(),
            "port" => builder = builder.with_port(parse_value(section, key, value)?),
            "connect_timeout_ms" => {
                builder = builder.with_connect_timeout_ms(parse_value(section, key, value)?);
            }
            "write_timeout_ms" => {
                builder = builder.with_write_timeout_ms(parse_value(section, key, value)?);
            }
            other => warn!("config: ignoring unknown key '{other}' in [{section}]"),
        }
    }
    let settings = builder
        .build()
        .map_err(|err| invalid(section, "transport", name, err))?;
    Ok(TransportProfile { kind, settings })
}

fn parse_value<T>(section: &str, key: &str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse()
        .map_err(|err| invalid(section, key, value, err))
}

fn invalid(section: &str, key: &str, value: &str, reason: impl Display) -> ConfigError {
    ConfigError::InvalidValue {
        section: section.to_owned(),
        key: key.to_owned(),
        value: value.to_owned(),
        reason: reason.to_string(),
    }
}
