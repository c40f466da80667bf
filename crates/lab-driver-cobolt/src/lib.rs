//! Cobolt diode-pumped laser drivers.
//!
//! - 06-01 series (06-MLD, 06-DPL) over the USB virtual serial port or RS-232

pub mod cobolt0601;

pub use cobolt0601::{Cobolt0601Config, Cobolt0601Driver, Cobolt0601Factory};
