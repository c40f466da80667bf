//! Keysight (Agilent) waveform generator drivers.
//!
//! - 33220A 20 MHz function/arbitrary waveform generator (LAN, USBTMC, GPIB)

pub mod ks33220a;

pub use ks33220a::{Ks33220aConfig, Ks33220aDriver, Ks33220aFactory, Waveshape};
