//! Hardware configuration.
//!
//! A hardware file lists the devices to bring up:
//!
//! ```toml
//! [[devices]]
//! id = "power_meter"
//! name = "Newport 1830-C"
//! driver = "newport1830_c"
//!
//! [devices.config]
//! connection = { type = "serial", port = "/dev/ttyS0" }
//! ```
//!
//! `config` is handed to the driver's factory untouched; each factory
//! validates its own table. Environment variables prefixed with `LABCTL_`
//! are merged over the file, `__` separating nested keys.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const ENV_PREFIX: &str = "LABCTL_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Hardware config file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to parse hardware config: {0}")]
    Parse(#[from] Box<figment::Error>),

    #[error("Hardware config validation failed: {0}")]
    Validation(String),
}

/// One device entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Registry key, unique within a file
    pub id: String,
    /// Human-readable name; defaults to the id
    #[serde(default)]
    pub name: Option<String>,
    /// Factory `driver_type`, e.g. "sr830"
    pub driver: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Driver-specific table
    #[serde(default = "empty_table")]
    pub config: toml::Value,
}

fn default_enabled() -> bool {
    true
}

fn empty_table() -> toml::Value {
    toml::Value::Table(toml::map::Map::new())
}

impl DeviceConfig {
    pub fn new(id: impl Into<String>, driver: impl Into<String>, config: toml::Value) -> Self {
        Self {
            id: id.into(),
            name: None,
            driver: driver.into(),
            enabled: true,
            config,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HardwareConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl HardwareConfig {
    /// Load from a TOML file with `LABCTL_` environment overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let config: Self = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), devices = config.devices.len(), "Loaded hardware config");
        Ok(config)
    }

    /// Parse a TOML string without environment overrides.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::string(text))
            .extract()
            .map_err(Box::new)?;
        config.validate()?;
        Ok(config)
    }

    /// Ids must be unique and non-empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for device in &self.devices {
            if device.id.trim().is_empty() {
                return Err(ConfigError::Validation(format!(
                    "device with driver '{}' has an empty id",
                    device.driver
                )));
            }
            if !ids.insert(device.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate device id: {}",
                    device.id
                )));
            }
        }
        Ok(())
    }

    pub fn enabled_devices(&self) -> impl Iterator<Item = &DeviceConfig> {
        self.devices.iter().filter(|d| d.enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [[devices]]
        id = "lockin"
        name = "SR830"
        driver = "sr830"

        [devices.config]
        connection = { type = "gpib", controller = { port = "/dev/ttyUSB0" }, address = 8 }

        [[devices]]
        id = "switch"
        driver = "ippower9258"
        enabled = false
        config = { url = "http://10.0.0.5" }
    "#;

    #[test]
    fn parses_devices() {
        let config = HardwareConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].display_name(), "SR830");
        assert_eq!(config.devices[1].display_name(), "switch");
        assert_eq!(
            config.devices[0].config["connection"]["address"].as_integer(),
            Some(8)
        );
        assert_eq!(config.enabled_devices().count(), 1);
    }

    #[test]
    fn config_table_defaults_to_empty() {
        let config = HardwareConfig::from_toml_str(
            r#"
            [[devices]]
            id = "a"
            driver = "mock"
        "#,
        )
        .unwrap();
        assert_eq!(config.devices[0].config, empty_table());
    }

    #[test]
    fn duplicate_ids_rejected() {
        let result = HardwareConfig::from_toml_str(
            r#"
            [[devices]]
            id = "a"
            driver = "x"
            [[devices]]
            id = "a"
            driver = "y"
        "#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn missing_driver_is_parse_error() {
        let result = HardwareConfig::from_toml_str("[[devices]]\nid = \"a\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            HardwareConfig::load("/nonexistent/hardware.toml"),
            Err(ConfigError::NotFound(_))
        ));
    }
}
