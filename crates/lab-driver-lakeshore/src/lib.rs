//! Lake Shore Cryotronics temperature controller drivers.
//!
//! - Model 332 two-input, two-loop cryogenic temperature controller

pub mod ls332;

pub use ls332::{ControlMode, Ls332Config, Ls332Driver, Ls332Factory, Pid, Ramp};
