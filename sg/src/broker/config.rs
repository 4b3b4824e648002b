//! Broker configuration

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::transport::DEFAULT_INBOX_PREFIX;

/// Broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Channel buffer size for broker requests
    #[serde(default = "default_channel_buffer", rename = "channel-buffer")]
    pub channel_buffer: usize,

    /// Max payload size in bytes (1MB default)
    #[serde(default = "default_max_payload_bytes", rename = "max-payload-bytes")]
    pub max_payload_bytes: usize,

    /// Prefix for reply addresses minted by in-process handles
    #[serde(default = "default_inbox_prefix", rename = "inbox-prefix")]
    pub inbox_prefix: String,
}

fn default_channel_buffer() -> usize {
    debug!("default_channel_buffer: called");
    1000
}

fn default_max_payload_bytes() -> usize {
    debug!("default_max_payload_bytes: called");
    1024 * 1024 // 1MB
}

fn default_inbox_prefix() -> String {
    DEFAULT_INBOX_PREFIX.to_string()
}

impl Default for BrokerConfig {
    fn default() -> Self {
        debug!("BrokerConfig::default: called");
        Self {
            channel_buffer: default_channel_buffer(),
            max_payload_bytes: default_max_payload_bytes(),
            inbox_prefix: default_inbox_prefix(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.channel_buffer, 1000);
        assert_eq!(config.max_payload_bytes, 1024 * 1024);
        assert_eq!(config.inbox_prefix, "_INBOX");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: BrokerConfig = serde_yaml::from_str("max-payload-bytes: 64").unwrap();
        assert_eq!(config.max_payload_bytes, 64);
        assert_eq!(config.channel_buffer, 1000);
    }
}
