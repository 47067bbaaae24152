//! Stream configuration management

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::{Error, Result};

/// Geometry and timing of the isochronous capture pipeline.
///
/// The defaults match a full-speed UAC microphone at 48 kHz / 16-bit
/// stereo: 192 bytes per 1 ms frame, ten frames per transfer, ten
/// transfers queued so the host controller always has work scheduled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Number of transfer slots kept in flight
    #[serde(default = "StreamConfig::default_transfers")]
    pub transfers: usize,
    /// Isochronous packets per transfer
    #[serde(default = "StreamConfig::default_packets")]
    pub packets: usize,
    /// Bytes per isochronous packet
    #[serde(default = "StreamConfig::default_packet_size")]
    pub packet_size: usize,
    /// Sample rate requested from the device at setup
    #[serde(default = "StreamConfig::default_sample_rate")]
    pub sample_rate_hz: u32,
    /// Per-transfer timeout handed to the USB stack
    #[serde(default = "StreamConfig::default_transfer_timeout_ms")]
    pub transfer_timeout_ms: u32,
    /// Drain behaviour on stop()
    #[serde(default)]
    pub drain: DrainSettings,
}

/// Bounded condition-variable wait used while draining the pool.
///
/// Exceeding the bound is accepted as a timeout, not an error: stop()
/// returns with the remaining slots still occupied and logs how many
/// were left behind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrainSettings {
    /// Maximum number of condvar wake retries before giving up
    #[serde(default = "DrainSettings::default_max_waits")]
    pub max_waits: usize,
    /// Upper bound on each individual wait
    #[serde(default = "DrainSettings::default_wait_ms")]
    pub wait_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            transfers: Self::default_transfers(),
            packets: Self::default_packets(),
            packet_size: Self::default_packet_size(),
            sample_rate_hz: Self::default_sample_rate(),
            transfer_timeout_ms: Self::default_transfer_timeout_ms(),
            drain: DrainSettings::default(),
        }
    }
}

impl Default for DrainSettings {
    fn default() -> Self {
        Self {
            max_waits: Self::default_max_waits(),
            wait_ms: Self::default_wait_ms(),
        }
    }
}

impl StreamConfig {
    fn default_transfers() -> usize {
        10
    }

    fn default_packets() -> usize {
        10
    }

    fn default_packet_size() -> usize {
        192
    }

    fn default_sample_rate() -> u32 {
        48_000
    }

    fn default_transfer_timeout_ms() -> u32 {
        1_000
    }

    /// Total buffer size of one transfer
    pub fn transfer_size(&self) -> usize {
        self.packets * self.packet_size
    }

    /// Per-transfer timeout as a Duration
    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(u64::from(self.transfer_timeout_ms))
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("serialize: {}", e)))?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }

    /// Reject geometries the transfer layer cannot express
    pub fn validate(&self) -> Result<()> {
        if self.transfers == 0 {
            return Err(Error::Config("transfers must be at least 1".into()));
        }
        if self.packets == 0 || self.packet_size == 0 {
            return Err(Error::Config(
                "packets and packet_size must be at least 1".into(),
            ));
        }
        if self.packets > i32::MAX as usize || self.transfer_size() > i32::MAX as usize {
            return Err(Error::Config("transfer geometry exceeds i32 range".into()));
        }
        // The UAC sampling-frequency payload is 24 bits.
        if self.sample_rate_hz >= 1 << 24 {
            return Err(Error::Config(
                "sample_rate_hz must fit in 24 bits".into(),
            ));
        }
        Ok(())
    }
}

impl DrainSettings {
    fn default_max_waits() -> usize {
        10
    }

    fn default_wait_ms() -> u64 {
        100
    }

    /// Upper bound on one condvar wait
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_stream_geometry() {
        let config = StreamConfig::default();
        assert_eq!(config.transfers, 10);
        assert_eq!(config.packets, 10);
        assert_eq!(config.packet_size, 192);
        assert_eq!(config.transfer_size(), 1920);
        assert_eq!(config.sample_rate_hz, 48_000);
        assert_eq!(config.drain.max_waits, 10);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: StreamConfig = toml::from_str("packet_size = 96\n").unwrap();
        assert_eq!(config.packet_size, 96);
        assert_eq!(config.transfers, 10);
        assert_eq!(config.sample_rate_hz, 48_000);
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let mut config = StreamConfig::default();
        config.transfers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_packet() {
        let mut config = StreamConfig::default();
        config.packet_size = 0;
        assert!(config.validate().is_err());
    }
}
