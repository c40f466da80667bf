//! Stanford Research Systems instrument drivers.
//!
//! - SR830 DSP lock-in amplifier (GPIB or RS-232)
//! - DG645 digital delay/pulse generator (Ethernet, GPIB or RS-232)
//!
//! ```rust,ignore
//! use lab_driver_stanford::{Dg645Factory, Sr830Factory};
//!
//! registry.register_factory(Box::new(Sr830Factory))?;
//! registry.register_factory(Box::new(Dg645Factory))?;
//! ```

pub mod dg645;
pub mod sr830;

pub use dg645::{DelaySetting, Dg645Config, Dg645Driver, Dg645Factory};
pub use sr830::{SnapParam, Sr830Config, Sr830Driver, Sr830Factory};
