//! scattergather configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::broker::BrokerConfig;
use crate::queue::DEFAULT_SIGNAL_CAPACITY;
use crate::transport::DEFAULT_INBOX_PREFIX;
use crate::wire::{DEFAULT_MAX_PAYLOAD_BYTES, frame_limit};

/// Default broker server address
pub const DEFAULT_SERVER: &str = "127.0.0.1:4242";

/// Main scattergather configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Requestor settings
    pub client: ClientConfig,

    /// Broker server settings
    pub server: ServerConfig,

    /// Responder settings
    pub responder: ResponderConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        // Project-local: .scattergather.yml
        let local_config = PathBuf::from(".scattergather.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        // User: ~/.config/scattergather/scattergather.yml
        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("scattergather").join("scattergather.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Requestor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Broker server address (host:port)
    pub server: String,

    /// Connection name sent to the server
    pub name: String,

    /// Default reply window in seconds
    #[serde(rename = "reply-window-secs")]
    pub reply_window_secs: u64,

    /// Default maximum number of replies
    #[serde(rename = "max-replies")]
    pub max_replies: usize,

    /// Buffered reply signals before deliveries wait
    #[serde(rename = "signal-capacity")]
    pub signal_capacity: usize,

    /// Prefix for generated reply addresses
    #[serde(rename = "inbox-prefix")]
    pub inbox_prefix: String,

    /// Connect timeout in milliseconds
    #[serde(rename = "connect-timeout-ms")]
    pub connect_timeout_ms: u64,
}

impl ClientConfig {
    pub fn reply_window(&self) -> Duration {
        Duration::from_secs(self.reply_window_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: DEFAULT_SERVER.to_string(),
            name: "sg-req".to_string(),
            reply_window_secs: 2,
            max_replies: 1,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
            inbox_prefix: DEFAULT_INBOX_PREFIX.to_string(),
            connect_timeout_ms: 5000,
        }
    }
}

/// Broker server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (host:port)
    pub listen: String,

    /// Token clients must present in Connect; no auth when unset
    #[serde(rename = "auth-token")]
    pub auth_token: Option<String>,

    /// Largest accepted payload in bytes; the frame limit follows from it
    #[serde(rename = "max-payload-bytes")]
    pub max_payload_bytes: usize,

    /// Broker request channel buffer
    #[serde(rename = "channel-buffer")]
    pub channel_buffer: usize,
}

impl ServerConfig {
    /// Broker settings derived from the server section
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            channel_buffer: self.channel_buffer,
            max_payload_bytes: self.max_payload_bytes,
            ..Default::default()
        }
    }

    /// Largest accepted frame in bytes
    pub fn max_frame_bytes(&self) -> usize {
        frame_limit(self.max_payload_bytes)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_SERVER.to_string(),
            auth_token: None,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            channel_buffer: 1000,
        }
    }
}

/// Responder settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResponderConfig {
    /// Delay before each response in milliseconds
    #[serde(rename = "delay-ms")]
    pub delay_ms: u64,
}
