//! Configuration management for Pipedrop.
//!
//! This module handles loading, saving, and validating Pipedrop configuration.
//! Both peers must agree on `transfer.chunk_size`: chunk offsets on the wire
//! are derived from it.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/pipedrop/config.toml` |
//! | macOS | `~/Library/Application Support/com.pipedrop.Pipedrop/config.toml` |
//! | Windows | `%APPDATA%\pipedrop\Pipedrop\config\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use pipedrop_core::config::Config;
//!
//! let config = Config::load()?;
//! println!("Chunk size: {}", config.transfer.chunk_size);
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for Pipedrop.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,
    /// Transfer settings
    pub transfer: TransferConfig,
    /// Send pacing settings
    pub backpressure: BackpressureConfig,
    /// Progress reporting settings
    pub progress: ProgressConfig,
}

/// General configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default output directory for received files
    pub default_output: Option<PathBuf>,
    /// Save received files to disk (false keeps them in memory)
    pub save_to_disk: bool,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            default_output: None,
            save_to_disk: true,
        }
    }
}

/// Transfer configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Network chunk size in bytes
    pub chunk_size: usize,
    /// Network chunks read per disk batch
    pub batch_chunks: usize,
    /// Out-of-order chunks held before a forced seek-write
    pub reorder_buffer_chunks: usize,
    /// Allowed slack between declared and assembled size
    pub size_tolerance: u64,
    /// Require exact size equality on in-memory assembly
    pub strict_size_check: bool,
    /// Maximum bytes per text piece
    pub string_chunk_size: usize,
    /// Largest single message the channel accepts
    pub max_message_size: usize,
    /// Interval between checks while waiting for a receipt
    #[serde(with = "humantime_serde")]
    pub ack_poll_interval: Duration,
    /// Upper bound on waiting for a receipt
    #[serde(with = "humantime_serde")]
    pub ack_timeout: Duration,
    /// A reception with no new chunk for this long is aborted
    #[serde(with = "humantime_serde")]
    pub receive_idle_timeout: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            batch_chunks: crate::DEFAULT_BATCH_CHUNKS,
            reorder_buffer_chunks: crate::DEFAULT_REORDER_BUFFER_CHUNKS,
            size_tolerance: crate::DEFAULT_SIZE_TOLERANCE,
            strict_size_check: false,
            string_chunk_size: crate::DEFAULT_STRING_CHUNK_SIZE,
            max_message_size: crate::DEFAULT_MAX_MESSAGE_SIZE,
            ack_poll_interval: Duration::from_millis(50),
            ack_timeout: Duration::from_secs(300),
            receive_idle_timeout: Duration::from_secs(60),
        }
    }
}

impl TransferConfig {
    /// Disk batch size in bytes.
    #[must_use]
    pub const fn batch_size(&self) -> usize {
        self.chunk_size * self.batch_chunks
    }
}

/// Adaptive send pacing options.
///
/// The ratio `buffered / adaptive_threshold` picks one of four strategies:
/// below `aggressive_cutoff` send at once, below `normal_cutoff` after
/// `short_delay`, below `cautious_cutoff` after `long_delay`, otherwise poll
/// until the buffer drains to `drain_target` of the threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackpressureConfig {
    /// Ratio under which chunks go out immediately
    pub aggressive_cutoff: f64,
    /// Ratio under which a short delay is applied
    pub normal_cutoff: f64,
    /// Ratio under which a long delay is applied
    pub cautious_cutoff: f64,
    /// Delay for the normal band
    #[serde(with = "humantime_serde")]
    pub short_delay: Duration,
    /// Delay for the cautious band
    #[serde(with = "humantime_serde")]
    pub long_delay: Duration,
    /// Fraction of the threshold the buffer must drain to
    pub drain_target: f64,
    /// Buffered-amount polling interval while draining
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Longest drain wait before sending anyway
    #[serde(with = "humantime_serde")]
    pub max_wait: Duration,
    /// Weight of a new sample in the moving averages
    pub ema_weight: f64,
    /// Threshold used before any sample was taken
    pub initial_threshold: u64,
    /// Threshold for poor clearing rates
    pub poor_threshold: u64,
    /// Threshold for average clearing rates
    pub average_threshold: u64,
    /// Threshold for good clearing rates
    pub good_threshold: u64,
    /// Clearing rate (bytes/s) below which the link is poor
    pub poor_rate: f64,
    /// Clearing rate (bytes/s) from which the link is good
    pub good_rate: f64,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            aggressive_cutoff: 0.3,
            normal_cutoff: 0.6,
            cautious_cutoff: 0.9,
            short_delay: Duration::from_millis(2),
            long_delay: Duration::from_millis(10),
            drain_target: 0.3,
            poll_interval: Duration::from_millis(10),
            max_wait: Duration::from_secs(2),
            ema_weight: 0.3,
            initial_threshold: 3 * 1024 * 1024,
            poor_threshold: 1536 * 1024,
            average_threshold: 3 * 1024 * 1024,
            good_threshold: 6 * 1024 * 1024,
            poor_rate: 1024.0 * 1024.0,
            good_rate: 8.0 * 1024.0 * 1024.0,
        }
    }
}

/// Progress reporting options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    /// Minimum time between two progress events for one target
    #[serde(with = "humantime_serde")]
    pub throttle: Duration,
    /// Weight of a new sample in the smoothed speed
    pub speed_smoothing: f64,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(100),
            speed_smoothing: 0.3,
        }
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML or fails validation.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(&path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Check that the values are usable together.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidConfig` naming the first offending key.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;
        if t.chunk_size == 0 {
            return Err(invalid("transfer.chunk_size", "must be greater than zero"));
        }
        // Packet header and JSON metadata share the message with the payload.
        if t.chunk_size + 1024 > t.max_message_size {
            return Err(invalid(
                "transfer.chunk_size",
                "chunk plus packet header exceeds transfer.max_message_size",
            ));
        }
        if t.batch_chunks == 0 {
            return Err(invalid("transfer.batch_chunks", "must be greater than zero"));
        }
        if t.reorder_buffer_chunks == 0 {
            return Err(invalid(
                "transfer.reorder_buffer_chunks",
                "must be greater than zero",
            ));
        }
        if t.string_chunk_size < 4 {
            return Err(invalid(
                "transfer.string_chunk_size",
                "must hold at least one UTF-8 character",
            ));
        }
        if t.receive_idle_timeout.is_zero() {
            return Err(invalid(
                "transfer.receive_idle_timeout",
                "must be greater than zero",
            ));
        }

        let b = &self.backpressure;
        if !(0.0 < b.aggressive_cutoff
            && b.aggressive_cutoff <= b.normal_cutoff
            && b.normal_cutoff <= b.cautious_cutoff)
        {
            return Err(invalid(
                "backpressure",
                "cutoffs must satisfy 0 < aggressive <= normal <= cautious",
            ));
        }
        if !(0.0..=1.0).contains(&b.ema_weight) || b.ema_weight == 0.0 {
            return Err(invalid("backpressure.ema_weight", "must be in (0, 1]"));
        }
        if b.poor_rate > b.good_rate {
            return Err(invalid(
                "backpressure.poor_rate",
                "must not exceed backpressure.good_rate",
            ));
        }
        if b.initial_threshold == 0 || b.poor_threshold == 0 {
            return Err(invalid("backpressure", "thresholds must be greater than zero"));
        }

        if !(0.0..=1.0).contains(&self.progress.speed_smoothing) {
            return Err(invalid("progress.speed_smoothing", "must be in [0, 1]"));
        }

        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "pipedrop", "Pipedrop")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 || duration.as_secs() == 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.strip_suffix("ms")
            .map(|millis| {
                millis
                    .parse()
                    .map(Duration::from_millis)
                    .map_err(serde::de::Error::custom)
            })
            .or_else(|| {
                s.strip_suffix('s').map(|secs| {
                    secs.parse()
                        .map(Duration::from_secs)
                        .map_err(serde::de::Error::custom)
                })
            })
            .or_else(|| {
                s.strip_suffix('m').map(|mins| {
                    mins.parse::<u64>()
                        .map(|m| Duration::from_secs(m * 60))
                        .map_err(serde::de::Error::custom)
                })
            })
            .unwrap_or_else(|| Err(serde::de::Error::custom("invalid duration format")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.transfer.chunk_size, crate::DEFAULT_CHUNK_SIZE);
        assert_eq!(config.transfer.batch_size(), 32 * 1024 * 1024);
        assert_eq!(config.transfer.reorder_buffer_chunks, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");

        let mut original = Config::default();
        original.transfer.chunk_size = 32 * 1024;
        original.general.save_to_disk = false;
        original.backpressure.max_wait = Duration::from_millis(1500);

        let content = toml::to_string_pretty(&original).expect("serialize");
        std::fs::write(&config_path, &content).expect("write");

        let loaded_content = std::fs::read_to_string(&config_path).expect("read");
        let loaded = Config::from_toml(&loaded_content).expect("parse");

        assert_eq!(loaded.transfer.chunk_size, 32 * 1024);
        assert!(!loaded.general.save_to_disk);
        assert_eq!(loaded.backpressure.max_wait, Duration::from_millis(1500));
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[transfer]
chunk_size = 16384
ack_timeout = "2m"

[progress]
throttle = "250ms"
"#;

        let config = Config::from_toml(partial_toml).expect("parse partial config");

        assert_eq!(config.transfer.chunk_size, 16384);
        assert_eq!(config.transfer.ack_timeout, Duration::from_secs(120));
        assert_eq!(config.progress.throttle, Duration::from_millis(250));
        assert_eq!(config.transfer.batch_chunks, crate::DEFAULT_BATCH_CHUNKS);
    }

    #[test]
    fn test_humantime_duration_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");

        assert!(toml_str.contains("ack_timeout = \"300s\""));
        assert!(toml_str.contains("poll_interval = \"10ms\""));
        assert!(toml_str.contains("[backpressure]"));
    }

    #[test]
    fn test_validate_rejects_oversized_chunk() {
        let mut config = Config::default();
        config.transfer.chunk_size = config.transfer.max_message_size;

        match config.validate() {
            Err(Error::InvalidConfig { key, .. }) => assert_eq!(key, "transfer.chunk_size"),
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_zero_idle_timeout() {
        let mut config = Config::default();
        config.transfer.receive_idle_timeout = Duration::ZERO;

        match config.validate() {
            Err(Error::InvalidConfig { key, .. }) => {
                assert_eq!(key, "transfer.receive_idle_timeout");
            }
            other => panic!("expected InvalidConfig, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_rejects_unordered_cutoffs() {
        let mut config = Config::default();
        config.backpressure.normal_cutoff = 0.95;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_path() {
        let path = Config::config_path();
        assert!(path.ends_with("config.toml"));
    }
}
