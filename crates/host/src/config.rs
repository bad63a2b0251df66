//! Host engine configuration

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::stream::{OverflowPolicy, StreamConfig};

/// Top-level configuration, loadable from TOML.
///
/// Every knob has a default, so an empty file (or no file at all) yields a
/// working configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default)]
    pub host: HostSettings,
    #[serde(default)]
    pub transfers: TransferSettings,
    #[serde(default)]
    pub streams: StreamSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    /// Default log filter when RUST_LOG is not set
    #[serde(default = "HostSettings::default_log_level")]
    pub log_level: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

impl HostSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Timeout applied to one-shot transfers that don't specify their own,
    /// in milliseconds (0 = no timeout)
    #[serde(default = "TransferSettings::default_timeout_ms")]
    pub default_timeout_ms: u64,
    /// How long close/stop waits for in-flight transfers to quiesce before
    /// reporting incomplete teardown, in milliseconds
    #[serde(default = "TransferSettings::default_teardown_ms")]
    pub teardown_timeout_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_timeout_ms: Self::default_timeout_ms(),
            teardown_timeout_ms: Self::default_teardown_ms(),
        }
    }
}

impl TransferSettings {
    fn default_timeout_ms() -> u64 {
        5000
    }

    fn default_teardown_ms() -> u64 {
        2000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Transfers kept in flight per stream
    #[serde(default = "StreamSettings::default_pool_size")]
    pub pool_size: usize,
    /// Delivered payloads buffered before the oldest is dropped
    #[serde(default = "StreamSettings::default_queue_depth")]
    pub queue_depth: usize,
    /// Consecutive transient failures tolerated per slot before the
    /// failure is escalated to frame loss
    #[serde(default = "StreamSettings::default_max_retries")]
    pub max_retries: u32,
    /// What to do when the delivery queue is full
    #[serde(default)]
    pub overflow: OverflowPolicy,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            pool_size: Self::default_pool_size(),
            queue_depth: Self::default_queue_depth(),
            max_retries: Self::default_max_retries(),
            overflow: OverflowPolicy::default(),
        }
    }
}

impl StreamSettings {
    fn default_pool_size() -> usize {
        4
    }

    fn default_queue_depth() -> usize {
        8
    }

    fn default_max_retries() -> u32 {
        3
    }

    /// Stream configuration seeded from these settings. `transfer_size`
    /// stays 0, which sizes each transfer to the endpoint's max packet.
    pub fn stream_config(&self) -> StreamConfig {
        StreamConfig {
            pool_size: self.pool_size,
            queue_depth: self.queue_depth,
            max_retries: self.max_retries,
            overflow: self.overflow,
            ..StreamConfig::default()
        }
    }
}

impl HostConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/usb-host/config.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: HostConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        config.validate()?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-host").join("config.toml")
        } else {
            PathBuf::from(".config/usb-host/config.toml")
        }
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.host.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.host.log_level,
                valid_levels.join(", ")
            ));
        }

        if self.streams.pool_size == 0 {
            return Err(anyhow!("streams.pool_size must be at least 1"));
        }
        if self.streams.queue_depth == 0 {
            return Err(anyhow!("streams.queue_depth must be at least 1"));
        }

        Ok(())
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.transfers.default_timeout_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_millis(self.transfers.teardown_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = HostConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.streams.pool_size, 4);
        assert_eq!(config.streams.queue_depth, 8);
        assert_eq!(config.default_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn empty_toml_yields_defaults() {
        let config: HostConfig = toml::from_str("").unwrap();
        assert_eq!(config.host.log_level, "info");
        assert_eq!(config.streams.max_retries, 3);
        assert_eq!(config.transfers.teardown_timeout_ms, 2000);
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let config: HostConfig = toml::from_str(
            r#"
            [streams]
            pool_size = 8
            overflow = "notify"
            "#,
        )
        .unwrap();
        assert_eq!(config.streams.pool_size, 8);
        assert_eq!(config.streams.overflow, OverflowPolicy::Notify);
        assert_eq!(config.streams.queue_depth, 8);
        assert_eq!(config.host.log_level, "info");
    }

    #[test]
    fn zero_pool_size_is_rejected() {
        let config: HostConfig = toml::from_str("[streams]\npool_size = 0\n").unwrap();
        assert!(config.validate().is_err());
    }
}
