//! Minimal configuration loading for samplewell.
//!
//! Configuration is split into three sections:
//!
//! - **Device** (`DeviceConfig`): power-on defaults for the capture unit. These
//!   seed the device at boot; afterwards the device itself is the source of
//!   truth and is reconfigured through its own setters.
//! - **Timing** (`TimingConfig`): handshake and stop deadlines, wait granularity.
//! - **Telemetry** (`TelemetryConfig`): log filter.
//!
//! # Usage
//!
//! ```rust,no_run
//! use wellconf::WellConfig;
//!
//! let config = WellConfig::load().expect("Failed to load config");
//! println!("sample rate: {} Hz", config.device.sample_rate);
//! println!("stop timeout: {:?}", config.timing.stop_timeout());
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/samplewell/config.toml` (system)
//! 2. `~/.config/samplewell/config.toml` (user)
//! 3. `./samplewell.toml` (local override)
//! 4. Environment variables (`SAMPLEWELL_*`, plus `RUST_LOG`)
//!
//! # Example Config
//!
//! ```toml
//! [device]
//! core_clock_hz = 200000000
//! sample_rate = 50000000
//! sample_unit = "wide"
//! trigger = "continuous"
//! buffer_unit_size = 4194304
//! total_buffer_size = 33554432
//!
//! [timing]
//! stop_timeout_ms = 10000
//!
//! [telemetry]
//! log_level = "info,samplewell=debug"
//! ```

pub mod device;
pub mod loader;

pub use device::{DeviceConfig, SampleUnitSetting, TelemetryConfig, TimingConfig, TriggerSetting};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    Invalid { key: String, message: String },
}

/// Complete samplewell configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WellConfig {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub timing: TimingConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl WellConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/samplewell/config.toml`
    /// 3. `~/.config/samplewell/config.toml`
    /// 4. `./samplewell.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with an explicit file taking the place of `./samplewell.toml`.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        loader::load_layers(&files, |key| std::env::var(key).ok())
    }

    /// Check cross-field constraints that serde defaults cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, message: String| ConfigError::Invalid {
            key: key.to_string(),
            message,
        };

        if self.device.core_clock_hz < 2 {
            return Err(invalid(
                "device.core_clock_hz",
                format!("{} Hz cannot drive a sampler", self.device.core_clock_hz),
            ));
        }
        let max_rate = self.device.core_clock_hz / 2;
        if self.device.sample_rate == 0 || self.device.sample_rate > max_rate {
            return Err(invalid(
                "device.sample_rate",
                format!("{} Hz outside 1..={}", self.device.sample_rate, max_rate),
            ));
        }
        if self.device.buffer_unit_size < 32 {
            return Err(invalid(
                "device.buffer_unit_size",
                format!("{} bytes is below the 32 byte minimum", self.device.buffer_unit_size),
            ));
        }
        if self.timing.command_timeout_ms == 0 {
            return Err(invalid("timing.command_timeout_ms", "must be nonzero".into()));
        }
        if self.timing.command_spin_limit == 0 {
            return Err(invalid("timing.command_spin_limit", "must be nonzero".into()));
        }
        if self.timing.stop_timeout_ms == 0 {
            return Err(invalid("timing.stop_timeout_ms", "must be nonzero".into()));
        }
        if self.timing.wait_slice_ms == 0 {
            return Err(invalid("timing.wait_slice_ms", "must be nonzero".into()));
        }
        Ok(())
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        let mut output = String::new();

        output.push_str("# samplewell configuration\n\n");

        output.push_str("[device]\n");
        output.push_str(&format!("core_clock_hz = {}\n", self.device.core_clock_hz));
        output.push_str(&format!("sample_rate = {}\n", self.device.sample_rate));
        output.push_str(&format!("sample_unit = \"{}\"\n", self.device.sample_unit));
        output.push_str(&format!("trigger = \"{}\"\n", self.device.trigger));
        output.push_str(&format!("buffer_unit_size = {}\n", self.device.buffer_unit_size));
        output.push_str(&format!("total_buffer_size = {}\n", self.device.total_buffer_size));

        output.push_str("\n[timing]\n");
        output.push_str(&format!("command_timeout_ms = {}\n", self.timing.command_timeout_ms));
        output.push_str(&format!("command_spin_limit = {}\n", self.timing.command_spin_limit));
        output.push_str(&format!("stop_timeout_ms = {}\n", self.timing.stop_timeout_ms));
        output.push_str(&format!("wait_slice_ms = {}\n", self.timing.wait_slice_ms));
        output.push_str(&format!("read_timeout_ms = {}\n", self.timing.read_timeout_ms));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!("log_level = \"{}\"\n", self.telemetry.log_level));

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WellConfig::default();
        assert_eq!(config.device.core_clock_hz, 200_000_000);
        assert_eq!(config.device.sample_rate, 100_000_000);
        assert_eq!(config.device.sample_unit, SampleUnitSetting::Narrow);
        assert_eq!(config.device.trigger, TriggerSetting::Oneshot);
        assert_eq!(config.device.buffer_unit_size, 4 * 1024 * 1024);
        assert_eq!(config.timing.stop_timeout_ms, 10_000);
        config.validate().unwrap();
    }

    #[test]
    fn test_to_toml_parses_back() {
        let mut config = WellConfig::default();
        config.device.sample_unit = SampleUnitSetting::Wide;
        config.timing.read_timeout_ms = 250;

        let text = config.to_toml();
        assert!(text.contains("[device]"));
        assert!(text.contains("sample_unit = \"wide\""));

        let parsed: WellConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_validate_rejects_rate_above_half_clock() {
        let mut config = WellConfig::default();
        config.device.sample_rate = config.device.core_clock_hz / 2 + 1;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "device.sample_rate"));
    }

    #[test]
    fn test_validate_rejects_tiny_unit() {
        let mut config = WellConfig::default();
        config.device.buffer_unit_size = 16;
        assert!(config.validate().is_err());
    }
}
