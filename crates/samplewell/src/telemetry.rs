//! Logging setup for binaries and tests that drive a device.
//!
//! The filter comes from `RUST_LOG` when set, otherwise from the configured
//! `telemetry.log_level`. Calling [`init`] twice is harmless; the second call
//! leaves the existing subscriber in place.

use anyhow::Context;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use wellconf::TelemetryConfig;

/// Install a fmt subscriber filtered per `config`.
pub fn init(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.log_level)
            .with_context(|| format!("invalid log filter {:?}", config.log_level))?,
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .try_init()
        .is_ok();

    if installed {
        tracing::debug!(filter = %config.log_level, "logging initialized");
    }
    Ok(())
}
