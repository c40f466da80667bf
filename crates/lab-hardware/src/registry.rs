//! Device registry.
//!
//! Factories are registered by `driver_type`; devices are built from
//! [`DeviceConfig`] entries, initialized, and then looked up by id and
//! capability. Capability lookups return the trait objects the factory put
//! in its [`DeviceComponents`], so no downcasting is involved.
//!
//! # Example
//!
//! ```rust,ignore
//! let config = HardwareConfig::load("config/hardware.toml")?;
//! let registry = create_registry_from_config(&config).await?;
//!
//! if let Some(meter) = registry.get_readable("power_meter") {
//!     let watts = meter.read().await?;
//! }
//! registry.shutdown().await?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use lab_core::{
    Capability, DeviceCategory, DeviceComponents, DriverFactory, EmissionControl, Instrument,
    LabError, Movable, Readable, ShutterControl, Triggerable, WavelengthTunable,
};
use serde::Serialize;
use serde_json::Value;

use crate::config::{DeviceConfig, HardwareConfig};
use crate::factories::default_factories;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Device '{0}' is already registered")]
    DuplicateId(String),

    #[error("Driver factory '{0}' is already registered")]
    DuplicateFactory(&'static str),

    #[error("Unknown driver '{driver}' for device '{id}' (available: {available})")]
    UnknownDriver {
        id: String,
        driver: String,
        available: String,
    },

    /// Factory validation or build failed.
    #[error("Device '{id}' ({driver}): {message}")]
    Driver {
        id: String,
        driver: String,
        message: String,
    },

    #[error("Device '{id}': driver '{driver}' produced no instrument")]
    MissingInstrument { id: String, driver: String },

    #[error("Device '{id}' failed to initialize: {source}")]
    Initialize {
        id: String,
        #[source]
        source: LabError,
    },
}

/// Listing entry for a registered device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub driver: String,
    pub capabilities: Vec<Capability>,
    pub category: Option<DeviceCategory>,
}

/// Listing entry for a registered factory.
#[derive(Debug, Clone, Serialize)]
pub struct DriverInfo {
    pub driver_type: &'static str,
    pub name: &'static str,
    pub capabilities: Vec<Capability>,
}

struct RegisteredDevice {
    config: DeviceConfig,
    instrument: Arc<dyn Instrument>,
    components: DeviceComponents,
}

impl RegisteredDevice {
    fn info(&self) -> DeviceInfo {
        DeviceInfo {
            id: self.config.id.clone(),
            name: self.config.display_name().to_string(),
            driver: self.config.driver.clone(),
            capabilities: self.components.capabilities(),
            category: self.instrument.category(),
        }
    }
}

#[derive(Default)]
pub struct DeviceRegistry {
    factories: BTreeMap<&'static str, Box<dyn DriverFactory>>,
    devices: HashMap<String, RegisteredDevice>,
}

impl DeviceRegistry {
    /// Empty registry with no factories.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every factory enabled by cargo features.
    pub fn with_default_factories() -> Self {
        let mut registry = Self::new();
        for factory in default_factories() {
            if let Err(e) = registry.register_factory(factory) {
                tracing::warn!(error = %e, "Skipping factory");
            }
        }
        registry
    }

    pub fn register_factory(&mut self, factory: Box<dyn DriverFactory>) -> Result<(), RegistryError> {
        let driver_type = factory.driver_type();
        if self.factories.contains_key(driver_type) {
            return Err(RegistryError::DuplicateFactory(driver_type));
        }
        tracing::debug!(driver = driver_type, "Registered driver factory");
        self.factories.insert(driver_type, factory);
        Ok(())
    }

    /// Registered factories, sorted by driver type.
    pub fn drivers(&self) -> Vec<DriverInfo> {
        self.factories
            .values()
            .map(|f| DriverInfo {
                driver_type: f.driver_type(),
                name: f.name(),
                capabilities: f.capabilities().to_vec(),
            })
            .collect()
    }

    fn factory_for(&self, config: &DeviceConfig) -> Result<&dyn DriverFactory, RegistryError> {
        self.factories
            .get(config.driver.as_str())
            .map(|f| f.as_ref())
            .ok_or_else(|| RegistryError::UnknownDriver {
                id: config.id.clone(),
                driver: config.driver.clone(),
                available: self.factories.keys().copied().collect::<Vec<_>>().join(", "),
            })
    }

    /// Check a device entry against its factory without touching hardware.
    pub fn validate(&self, config: &DeviceConfig) -> Result<(), RegistryError> {
        self.factory_for(config)?
            .validate(&config.config)
            .map_err(|e| RegistryError::Driver {
                id: config.id.clone(),
                driver: config.driver.clone(),
                message: format!("{e:#}"),
            })
    }

    /// Validate, build and initialize a device.
    ///
    /// Nothing is registered unless every step succeeds.
    #[tracing::instrument(skip(self, config), fields(id = %config.id, driver = %config.driver), err)]
    pub async fn register(&mut self, config: DeviceConfig) -> Result<(), RegistryError> {
        if self.devices.contains_key(&config.id) {
            return Err(RegistryError::DuplicateId(config.id));
        }
        self.validate(&config)?;

        let build = self.factory_for(&config)?.build(config.config.clone());
        let components = build.await.map_err(|e| RegistryError::Driver {
            id: config.id.clone(),
            driver: config.driver.clone(),
            message: format!("{e:#}"),
        })?;
        let instrument = components
            .instrument
            .clone()
            .ok_or_else(|| RegistryError::MissingInstrument {
                id: config.id.clone(),
                driver: config.driver.clone(),
            })?;

        instrument
            .initialize()
            .await
            .map_err(|source| RegistryError::Initialize {
                id: config.id.clone(),
                source,
            })?;

        tracing::info!(
            id = %config.id,
            name = config.display_name(),
            capabilities = ?components.capabilities(),
            "Registered device"
        );
        self.devices.insert(
            config.id.clone(),
            RegisteredDevice {
                config,
                instrument,
                components,
            },
        );
        Ok(())
    }

    /// Validate every enabled device, then register each one.
    ///
    /// Validation failures abort before any hardware is opened, with every
    /// problem listed. Build and initialization failures are logged and the
    /// remaining devices still come up. Returns the number registered.
    pub async fn register_all(&mut self, config: &HardwareConfig) -> anyhow::Result<usize> {
        let errors: Vec<String> = config
            .enabled_devices()
            .filter_map(|device| self.validate(device).err())
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            anyhow::bail!(
                "Hardware configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }

        let mut registered = 0;
        for device in config.devices.iter() {
            if !device.enabled {
                tracing::info!(id = %device.id, "Device disabled, skipping");
                continue;
            }
            match self.register(device.clone()).await {
                Ok(()) => registered += 1,
                Err(e) => {
                    tracing::warn!(
                        id = %device.id,
                        error = %e,
                        "Failed to register device (continuing with other devices)"
                    );
                }
            }
        }
        Ok(registered)
    }

    /// Finalize and remove a device. Returns false if it was not registered.
    pub async fn unregister(&mut self, id: &str) -> bool {
        let Some(device) = self.devices.remove(id) else {
            return false;
        };
        if let Err(e) = device.instrument.finalize().await {
            tracing::warn!(id, error = %e, "Finalize failed during unregister");
        }
        true
    }

    /// Registered devices, sorted by id.
    pub fn list_devices(&self) -> Vec<DeviceInfo> {
        let mut devices: Vec<_> = self.devices.values().map(RegisteredDevice::info).collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn get_device_info(&self, id: &str) -> Option<DeviceInfo> {
        self.devices.get(id).map(RegisteredDevice::info)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.devices.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get_instrument(&self, id: &str) -> Option<Arc<dyn Instrument>> {
        self.devices.get(id).map(|d| Arc::clone(&d.instrument))
    }

    pub fn get_readable(&self, id: &str) -> Option<Arc<dyn Readable>> {
        self.devices.get(id).and_then(|d| d.components.readable.clone())
    }

    pub fn get_movable(&self, id: &str) -> Option<Arc<dyn Movable>> {
        self.devices.get(id).and_then(|d| d.components.movable.clone())
    }

    pub fn get_wavelength_tunable(&self, id: &str) -> Option<Arc<dyn WavelengthTunable>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.wavelength_tunable.clone())
    }

    pub fn get_emission_control(&self, id: &str) -> Option<Arc<dyn EmissionControl>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.emission_control.clone())
    }

    pub fn get_shutter_control(&self, id: &str) -> Option<Arc<dyn ShutterControl>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.shutter_control.clone())
    }

    pub fn get_triggerable(&self, id: &str) -> Option<Arc<dyn Triggerable>> {
        self.devices
            .get(id)
            .and_then(|d| d.components.triggerable.clone())
    }

    /// Ids of devices providing `capability`, sorted.
    pub fn devices_with_capability(&self, capability: Capability) -> Vec<String> {
        let mut ids: Vec<_> = self
            .devices
            .iter()
            .filter(|(_, d)| d.components.capabilities().contains(&capability))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Current value of every readable scalar feat, per device.
    pub async fn snapshot_all(&self) -> BTreeMap<String, BTreeMap<String, Value>> {
        let mut all = BTreeMap::new();
        for (id, device) in &self.devices {
            all.insert(id.clone(), device.instrument.feats().snapshot().await);
        }
        all
    }

    /// Finalize and remove every device.
    ///
    /// Every device is finalized even if some fail; the failures are
    /// reported together.
    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        let mut ids: Vec<_> = self.devices.keys().cloned().collect();
        ids.sort();
        let mut errors = Vec::new();
        for id in ids {
            let Some(device) = self.devices.remove(&id) else {
                continue;
            };
            match device.instrument.finalize().await {
                Ok(()) => tracing::debug!(id = %id, "Finalized device"),
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "Finalize failed");
                    errors.push(format!("{id}: {e}"));
                }
            }
        }
        if !errors.is_empty() {
            anyhow::bail!("Failed to finalize:\n  - {}", errors.join("\n  - "));
        }
        Ok(())
    }
}

/// Build a registry with the default factories and register every device.
pub async fn create_registry_from_config(config: &HardwareConfig) -> anyhow::Result<DeviceRegistry> {
    let mut registry = DeviceRegistry::with_default_factories();
    let registered = registry.register_all(config).await?;
    tracing::info!(
        registered,
        configured = config.devices.len(),
        "Device registry ready"
    );
    Ok(registry)
}

pub async fn create_registry_from_file(path: &Path) -> anyhow::Result<DeviceRegistry> {
    let config = HardwareConfig::load(path)
        .with_context(|| format!("Failed to load hardware config from {}", path.display()))?;
    create_registry_from_config(&config).await
}
