//! Coherent laser drivers.
//!
//! - Innova 300C ion laser over its RS-232 port

pub mod innova300c;

pub use innova300c::{Innova300cConfig, Innova300cDriver, Innova300cFactory};
