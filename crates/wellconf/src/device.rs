//! Device, timing and telemetry sections.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Width of one captured sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleUnitSetting {
    /// 16 channels, two bytes per sample.
    Wide,
    /// 8 channels, one byte per sample.
    Narrow,
}

impl fmt::Display for SampleUnitSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wide => write!(f, "wide"),
            Self::Narrow => write!(f, "narrow"),
        }
    }
}

impl FromStr for SampleUnitSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "wide" | "16" | "0" => Ok(Self::Wide),
            "narrow" | "8" | "1" => Ok(Self::Narrow),
            other => Err(format!("unknown sample unit '{}'", other)),
        }
    }
}

/// What the co-processor does after filling the last buffer of the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSetting {
    Oneshot,
    Continuous,
}

impl fmt::Display for TriggerSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oneshot => write!(f, "oneshot"),
            Self::Continuous => write!(f, "continuous"),
        }
    }
}

impl FromStr for TriggerSetting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "oneshot" | "0" => Ok(Self::Oneshot),
            "continuous" | "1" => Ok(Self::Continuous),
            other => Err(format!("unknown trigger mode '{}'", other)),
        }
    }
}

/// Power-on defaults for the capture unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Co-processor core clock. The sampler runs at most at half of it.
    /// Default: 200 MHz
    #[serde(default = "DeviceConfig::default_core_clock_hz")]
    pub core_clock_hz: u32,

    /// Requested sample rate in Hz, rounded to an integer divisor at boot.
    /// Default: 100 MHz
    #[serde(default = "DeviceConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Default: narrow (8 bit)
    #[serde(default = "DeviceConfig::default_sample_unit")]
    pub sample_unit: SampleUnitSetting,

    /// Default: oneshot
    #[serde(default = "DeviceConfig::default_trigger")]
    pub trigger: TriggerSetting,

    /// Size of each ring buffer in bytes, rounded up to a multiple of 32.
    /// Default: 4 MiB
    #[serde(default = "DeviceConfig::default_buffer_unit_size")]
    pub buffer_unit_size: u32,

    /// Ring size allocated at boot. 0 leaves the device Initialized with no ring.
    /// Default: 0
    #[serde(default)]
    pub total_buffer_size: u32,
}

impl DeviceConfig {
    fn default_core_clock_hz() -> u32 {
        200_000_000
    }

    fn default_sample_rate() -> u32 {
        100_000_000
    }

    fn default_sample_unit() -> SampleUnitSetting {
        SampleUnitSetting::Narrow
    }

    fn default_trigger() -> TriggerSetting {
        TriggerSetting::Oneshot
    }

    fn default_buffer_unit_size() -> u32 {
        4 * 1024 * 1024
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            core_clock_hz: Self::default_core_clock_hz(),
            sample_rate: Self::default_sample_rate(),
            sample_unit: Self::default_sample_unit(),
            trigger: Self::default_trigger(),
            buffer_unit_size: Self::default_buffer_unit_size(),
            total_buffer_size: 0,
        }
    }
}

/// Deadlines and wait granularity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Wall-clock bound on one command handshake.
    /// Default: 10 ms
    #[serde(default = "TimingConfig::default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Poll iteration bound on one command handshake, checked alongside the deadline.
    /// Default: 1_000_000
    #[serde(default = "TimingConfig::default_command_spin_limit")]
    pub command_spin_limit: u64,

    /// How long a cooperative stop waits for the completion signal.
    /// Default: 10 s
    #[serde(default = "TimingConfig::default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    /// How often blocked waiters re-check cancellation and deadlines.
    /// Default: 20 ms
    #[serde(default = "TimingConfig::default_wait_slice_ms")]
    pub wait_slice_ms: u64,

    /// Upper bound on a blocking read. 0 blocks until data or cancellation.
    /// Default: 0
    #[serde(default)]
    pub read_timeout_ms: u64,
}

impl TimingConfig {
    fn default_command_timeout_ms() -> u64 {
        10
    }

    fn default_command_spin_limit() -> u64 {
        1_000_000
    }

    fn default_stop_timeout_ms() -> u64 {
        10_000
    }

    fn default_wait_slice_ms() -> u64 {
        20
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn wait_slice(&self) -> Duration {
        Duration::from_millis(self.wait_slice_ms)
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        (self.read_timeout_ms > 0).then(|| Duration::from_millis(self.read_timeout_ms))
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            command_timeout_ms: Self::default_command_timeout_ms(),
            command_spin_limit: Self::default_command_spin_limit(),
            stop_timeout_ms: Self::default_stop_timeout_ms(),
            wait_slice_ms: Self::default_wait_slice_ms(),
            read_timeout_ms: 0,
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive (trace, debug, info, warn, error, or per-target).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_unit_from_str() {
        assert_eq!("wide".parse::<SampleUnitSetting>().unwrap(), SampleUnitSetting::Wide);
        assert_eq!("8".parse::<SampleUnitSetting>().unwrap(), SampleUnitSetting::Narrow);
        assert!("2".parse::<SampleUnitSetting>().is_err());
    }

    #[test]
    fn test_trigger_from_str() {
        assert_eq!(
            "Continuous".parse::<TriggerSetting>().unwrap(),
            TriggerSetting::Continuous
        );
        assert!("sometimes".parse::<TriggerSetting>().is_err());
    }

    #[test]
    fn test_read_timeout_zero_means_unbounded() {
        let timing = TimingConfig::default();
        assert_eq!(timing.read_timeout(), None);
        assert_eq!(timing.stop_timeout(), Duration::from_secs(10));
    }
}
