//! Tektronix oscilloscope drivers.
//!
//! - TDS2000/TDS1000 series digital storage oscilloscopes (USBTMC, GPIB or
//!   RS-232 via the TDS2CM module)

pub mod tds2000;

pub use tds2000::{MeasurementKind, Tds2000Config, Tds2000Driver, Tds2000Factory, Waveform};
