use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bot::DEFAULT_SIGNAL_TEXT;
use crate::channel::{
    ChannelConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_MAX_RECONNECT_ATTEMPTS,
    DEFAULT_RECONNECT_DELAY, DEFAULT_RESPONSE_TIMEOUT,
};
use crate::detector::DEFAULT_POLL_INTERVAL;

pub const DEFAULT_ENDPOINT_URL: &str = "ws://127.0.0.1:8080/ws";

/// Top-level ewok config, loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub endpoint: EndpointConfig,
    pub store: StoreConfig,
    pub detector: DetectorConfig,
}

/// Bot service connection. Durations are in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub response_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENDPOINT_URL.to_string(),
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT.as_millis() as u64,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY.as_millis() as u64,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

/// Where the persisted state lives. Defaults to the user data directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub poll_interval_ms: u64,
    /// Text of the "new task available" message.
    pub signal_text: String,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL.as_millis() as u64,
            signal_text: DEFAULT_SIGNAL_TEXT.to_string(),
        }
    }
}

impl Config {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    ///
    /// The endpoint must be a `ws://` or `wss://` URL.
    pub fn load(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        if !is_websocket_url(&config.endpoint.url) {
            return Err(ConfigError::InvalidEndpoint(
                path.to_path_buf(),
                config.endpoint.url,
            ));
        }
        Ok(Some(config))
    }

    /// Like [`Config::load`], falling back to defaults when the file is absent.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        Ok(Self::load(path)?.unwrap_or_default())
    }

    /// `<config dir>/ewok/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("ewok").join("config.toml"))
    }

    /// Configured store path, else `<data dir>/ewok/store.json`, else the
    /// current directory.
    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .or_else(|| dirs::data_dir().map(|dir| dir.join("ewok").join("store.json")))
            .unwrap_or_else(|| PathBuf::from("ewok-store.json"))
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_millis(self.endpoint.connect_timeout_ms),
            response_timeout: Duration::from_millis(self.endpoint.response_timeout_ms),
            reconnect_delay: Duration::from_millis(self.endpoint.reconnect_delay_ms),
            max_reconnect_attempts: self.endpoint.max_reconnect_attempts,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.detector.poll_interval_ms.max(1))
    }
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(PathBuf, std::io::Error),
    ParseFailed(PathBuf, toml::de::Error),
    InvalidEndpoint(PathBuf, String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::InvalidEndpoint(path, url) => write!(
                f,
                "Invalid endpoint in {}: {:?} is not a ws:// or wss:// URL",
                path.display(),
                url
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

/// True for `ws://` and `wss://` URLs with a non-empty host part.
pub fn is_websocket_url(url: &str) -> bool {
    ["ws://", "wss://"]
        .iter()
        .any(|scheme| url.strip_prefix(scheme).is_some_and(|rest| !rest.is_empty()))
}
