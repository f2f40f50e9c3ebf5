//! Config file discovery, layered loading, and environment variable overlay.

use crate::{ConfigError, WellConfig};
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with an explicit override path.
///
/// If `override_path` is provided and exists, it replaces the local file.
pub fn discover_config_files_with_override(override_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/samplewell/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("samplewell/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = override_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("samplewell.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read one file as a raw TOML table, checking that it deserializes on its own.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    toml::Value::Table(table.clone())
        .try_into::<WellConfig>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(table)
}

/// Merge `overlay` into `base`. Nested tables merge key by key; everything else is replaced.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => {
                merge_tables(existing, incoming);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Load the given files in order, then apply overrides looked up through `env`.
pub fn load_layers<F>(files: &[PathBuf], env: F) -> Result<(WellConfig, ConfigSources), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut sources = ConfigSources::default();
    let mut merged = toml::Table::new();

    for path in files {
        let table = load_table(path)?;
        merge_tables(&mut merged, table);
        sources.files.push(path.clone());
    }

    let mut config: WellConfig =
        toml::Value::Table(merged)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: files.last().cloned().unwrap_or_default(),
                message: e.to_string(),
            })?;

    apply_env_overrides(&mut config, &mut sources, env)?;
    config.validate()?;

    Ok((config, sources))
}

fn parse_env<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse::<T>().map_err(|e| ConfigError::Invalid {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Apply `SAMPLEWELL_*` overrides. Unparseable values are errors rather than silently ignored.
pub fn apply_env_overrides<F>(
    config: &mut WellConfig,
    sources: &mut ConfigSources,
    env: F,
) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    macro_rules! overlay {
        ($key:literal, $field:expr) => {
            if let Some(raw) = env($key) {
                $field = parse_env($key, &raw)?;
                sources.env_overrides.push($key.to_string());
            }
        };
    }

    overlay!("SAMPLEWELL_CORE_CLOCK_HZ", config.device.core_clock_hz);
    overlay!("SAMPLEWELL_SAMPLE_RATE", config.device.sample_rate);
    overlay!("SAMPLEWELL_SAMPLE_UNIT", config.device.sample_unit);
    overlay!("SAMPLEWELL_TRIGGER", config.device.trigger);
    overlay!("SAMPLEWELL_BUFFER_UNIT_SIZE", config.device.buffer_unit_size);
    overlay!("SAMPLEWELL_TOTAL_BUFFER_SIZE", config.device.total_buffer_size);

    overlay!("SAMPLEWELL_COMMAND_TIMEOUT_MS", config.timing.command_timeout_ms);
    overlay!("SAMPLEWELL_STOP_TIMEOUT_MS", config.timing.stop_timeout_ms);
    overlay!("SAMPLEWELL_READ_TIMEOUT_MS", config.timing.read_timeout_ms);

    if let Some(v) = env("SAMPLEWELL_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("SAMPLEWELL_LOG_LEVEL".to_string());
    }
    // RUST_LOG wins, matching EnvFilter::from_default_env
    if let Some(v) = env("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SampleUnitSetting, TriggerSetting};
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_later_file_wins_per_key() {
        let system = write_config(
            r#"
[device]
sample_rate = 50000000
trigger = "continuous"
"#,
        );
        let local = write_config(
            r#"
[device]
sample_rate = 25000000
"#,
        );

        let files = vec![system.path().to_path_buf(), local.path().to_path_buf()];
        let (config, sources) = load_layers(&files, no_env).unwrap();

        assert_eq!(config.device.sample_rate, 25_000_000);
        assert_eq!(config.device.trigger, TriggerSetting::Continuous);
        assert_eq!(config.device.core_clock_hz, 200_000_000);
        assert_eq!(sources.files.len(), 2);
    }

    #[test]
    fn test_env_overrides_files() {
        let file = write_config("[device]\nsample_unit = \"narrow\"\n");
        let env: HashMap<&str, &str> = [
            ("SAMPLEWELL_SAMPLE_UNIT", "wide"),
            ("SAMPLEWELL_STOP_TIMEOUT_MS", "500"),
            ("RUST_LOG", "samplewell=trace"),
        ]
        .into_iter()
        .collect();

        let (config, sources) = load_layers(&[file.path().to_path_buf()], |k| {
            env.get(k).map(|v| v.to_string())
        })
        .unwrap();

        assert_eq!(config.device.sample_unit, SampleUnitSetting::Wide);
        assert_eq!(config.timing.stop_timeout_ms, 500);
        assert_eq!(config.telemetry.log_level, "samplewell=trace");
        assert_eq!(sources.env_overrides.len(), 3);
    }

    #[test]
    fn test_bad_env_value_is_an_error() {
        let result = load_layers(&[], |k| {
            (k == "SAMPLEWELL_SAMPLE_RATE").then(|| "fast".to_string())
        });
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_parse_error_names_file() {
        let file = write_config("[device]\nsample_unit = \"quad\"\n");
        let err = load_layers(&[file.path().to_path_buf()], no_env).unwrap_err();
        match err {
            ConfigError::Parse { path, .. } => assert_eq!(path, file.path()),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = load_table(Path::new("/nonexistent/samplewell.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }

    #[test]
    fn test_merge_tables_nested() {
        let mut base: toml::Table = "[device]\na = 1\nb = 2\n".parse().unwrap();
        let overlay: toml::Table = "[device]\nb = 3\n[timing]\nc = 4\n".parse().unwrap();
        merge_tables(&mut base, overlay);

        let device = base["device"].as_table().unwrap();
        assert_eq!(device["a"].as_integer(), Some(1));
        assert_eq!(device["b"].as_integer(), Some(3));
        assert_eq!(base["timing"]["c"].as_integer(), Some(4));
    }
}
