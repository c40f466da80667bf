//! Device registry and hardware configuration.
//!
//! [`HardwareConfig`] lists devices by driver type; [`DeviceRegistry`]
//! builds each one with its vendor crate's factory, initializes it, and
//! hands out capability trait objects by device id.

pub mod config;
pub mod factories;
pub mod registry;

pub use config::{ConfigError, DeviceConfig, HardwareConfig};
pub use factories::default_factories;
pub use registry::{
    create_registry_from_config, create_registry_from_file, DeviceInfo, DeviceRegistry,
    DriverInfo, RegistryError,
};
