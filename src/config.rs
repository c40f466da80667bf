//! CLI configuration.
//!
//! Loaded from (later sources win):
//! 1. built-in defaults
//! 2. `labctl.toml` (or the file given with `--app-config`), if present
//! 3. environment variables prefixed with `LABCTL_`, e.g.
//!    `LABCTL_LOG__LEVEL=debug`
//!
//! Command-line flags are applied on top by the caller.

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::logging::{parse_log_level, LogFormat, LoggingConfig};

/// Default application config file, relative to the working directory.
pub const DEFAULT_APP_CONFIG: &str = "labctl.toml";

/// Top-level CLI configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Hardware file listing the devices
    pub hardware_config: PathBuf,
    /// Logging settings
    #[serde(default)]
    pub log: LogSettings,
}

/// Logging section of [`AppConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogSettings {
    /// trace, debug, info, warn or error
    pub level: String,
    /// Line format
    pub format: LogFormat,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            hardware_config: PathBuf::from("config/hardware.toml"),
            log: LogSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load defaults, then `path`, then `LABCTL_` environment overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LABCTL_").split("__"))
            .extract()
    }

    /// Load with [`DEFAULT_APP_CONFIG`].
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_APP_CONFIG)
    }

    /// Subscriber settings for [`crate::logging::init`].
    pub fn logging(&self) -> Result<LoggingConfig, crate::logging::LoggingError> {
        Ok(LoggingConfig::new(parse_log_level(&self.log.level)?).with_format(self.log.format))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_without_file() {
        let config = AppConfig::load_from("/nonexistent/labctl.toml").unwrap();
        assert_eq!(config.log.format, LogFormat::Compact);
        assert_eq!(config.hardware_config, PathBuf::from("config/hardware.toml"));
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "hardware_config = \"/etc/lab/bench.toml\"\n[log]\nlevel = \"debug\"\nformat = \"json\"\n"
        )
        .unwrap();
        let config = AppConfig::load_from(file.path()).unwrap();
        assert_eq!(config.hardware_config, PathBuf::from("/etc/lab/bench.toml"));
        let logging = config.logging().unwrap();
        assert_eq!(logging.level, tracing::Level::DEBUG);
        assert_eq!(logging.format, LogFormat::Json);
    }

    #[test]
    fn test_bad_level_rejected() {
        let config = AppConfig {
            log: LogSettings {
                level: "chatty".to_string(),
                format: LogFormat::Pretty,
            },
            ..Default::default()
        };
        assert!(config.logging().is_err());
    }
}
