//! Thorlabs hardware drivers.
//!
//! This crate provides drivers for Thorlabs devices, including:
//! - PM100D Optical Power Meter (SCPI over USBTMC or serial)
//! - FW102C Motorized Filter Wheel (RS-232)
//! - ELL14 Rotation Mount (RS-485 bus)
//! - Variable attenuator: an ELL14 turning a polarizer or ND wheel,
//!   calibrated from angle to transmission
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! lab-driver-thorlabs = { path = "../lab-driver-thorlabs" }
//! ```
//!
//! Register the factories with your device registry:
//!
//! ```rust,ignore
//! use lab_driver_thorlabs::{Ell14Factory, Pm100dFactory};
//!
//! registry.register_factory(Box::new(Ell14Factory))?;
//! registry.register_factory(Box::new(Pm100dFactory))?;
//! ```

mod attenuator;
mod ell14;
mod fw102c;
mod pm100d;
pub mod shared_ports;

pub use attenuator::{AttenuatorConfig, Ell14Attenuator, Ell14AttenuatorFactory};
pub use ell14::{Ell14Config, Ell14Driver, Ell14Factory, Ell14Info, Ell14StatusCode};
pub use fw102c::{Fw102cConfig, Fw102cDriver, Fw102cFactory};
pub use pm100d::{Pm100dConfig, Pm100dDriver, Pm100dFactory};
pub use shared_ports::get_or_open_bus;
