//! Sutter Instrument drivers.
//!
//! - Lambda 10-3 optical filter changer: two filter wheels and two shutters
//!   driven over a binary serial protocol

pub mod lambda10_3;

pub use lambda10_3::{Lambda103Config, Lambda103Driver, Lambda103Factory};
