//! Aviosys network power switch drivers.
//!
//! - IP Power 9258: four mains outlets switched over the device's HTTP CGI
//!   interface

pub mod ippower9258;

pub use ippower9258::{IpPower9258Config, IpPower9258Driver, IpPower9258Factory};
