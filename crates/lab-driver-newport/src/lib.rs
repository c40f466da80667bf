//! Newport instrument drivers.
//!
//! This crate provides drivers for Newport instruments, including:
//! - ESP300 Universal Motion Controller (RS-232)
//! - 1830-C Optical Power Meter (RS-232 or GPIB)
//!
//! # Usage
//!
//! Add to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! lab-driver-newport = { path = "../lab-driver-newport" }
//! ```
//!
//! Register the factories with your device registry:
//!
//! ```rust,ignore
//! use lab_driver_newport::{Esp300Factory, Newport1830CFactory};
//!
//! registry.register_factory(Box::new(Esp300Factory))?;
//! registry.register_factory(Box::new(Newport1830CFactory))?;
//! ```

pub mod esp300;
pub mod newport_1830c;

pub use esp300::{Esp300Config, Esp300Driver, Esp300Factory};
pub use newport_1830c::{Newport1830CConfig, Newport1830CDriver, Newport1830CFactory};
