//! Hardware capability traits.
//!
//! Small async traits that let code drive an instrument without knowing
//! which driver is behind it. A power meter is `Readable`, a rotation mount
//! is `Movable`, a laser may be `EmissionControl + Readable`. The registry
//! hands these out per device; the full feat surface stays available through
//! [`crate::driver::Instrument::feats`].
//!
//! All methods take `&self`; drivers keep state in feats and transports that
//! synchronize internally.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// Device category for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    PowerMeter,
    Stage,
    FilterWheel,
    Attenuator,
    LockIn,
    PulseGenerator,
    Oscilloscope,
    FunctionGenerator,
    Laser,
    TemperatureController,
    Shutter,
    PowerSwitch,
}

impl DeviceCategory {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PowerMeter => "Power Meter",
            Self::Stage => "Stage",
            Self::FilterWheel => "Filter Wheel",
            Self::Attenuator => "Attenuator",
            Self::LockIn => "Lock-in Amplifier",
            Self::PulseGenerator => "Pulse Generator",
            Self::Oscilloscope => "Oscilloscope",
            Self::FunctionGenerator => "Function Generator",
            Self::Laser => "Laser",
            Self::TemperatureController => "Temperature Controller",
            Self::Shutter => "Shutter",
            Self::PowerSwitch => "Power Switch",
        }
    }
}

/// Devices that produce one scalar measurement (power, temperature, R).
#[async_trait]
pub trait Readable: Send + Sync {
    /// Measure and return the value in the device's documented unit.
    async fn read(&self) -> Result<f64>;

    /// Unit symbol of [`read`](Self::read), if any.
    fn unit(&self) -> Option<&'static str> {
        None
    }
}

/// Motion control (stages, rotation mounts, filter wheels).
///
/// Positions are in device-native units: mm, degrees or slot index.
/// `move_abs`/`move_rel` may return before motion completes.
#[async_trait]
pub trait Movable: Send + Sync {
    async fn move_abs(&self, position: f64) -> Result<()>;

    async fn move_rel(&self, distance: f64) -> Result<()>;

    async fn position(&self) -> Result<f64>;

    /// Wait until the device reports motion complete.
    async fn wait_settled(&self) -> Result<()>;

    async fn stop(&self) -> Result<()> {
        Err(LabError::Unsupported("stop".into()))
    }
}

/// Devices with a settable output or detection wavelength, in nm.
#[async_trait]
pub trait WavelengthTunable: Send + Sync {
    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()>;

    async fn get_wavelength(&self) -> Result<f64>;

    fn wavelength_range(&self) -> (f64, f64);
}

/// Lasers and sources with emission on/off.
#[async_trait]
pub trait EmissionControl: Send + Sync {
    async fn enable_emission(&self) -> Result<()>;

    async fn disable_emission(&self) -> Result<()>;

    async fn is_emission_enabled(&self) -> Result<bool> {
        Err(LabError::Unsupported("emission state query".into()))
    }
}

/// Beam shutters.
#[async_trait]
pub trait ShutterControl: Send + Sync {
    async fn open_shutter(&self) -> Result<()>;

    async fn close_shutter(&self) -> Result<()>;

    async fn is_shutter_open(&self) -> Result<bool>;
}

/// Devices that can be armed and software-triggered.
#[async_trait]
pub trait Triggerable: Send + Sync {
    async fn arm(&self) -> Result<()>;

    async fn trigger(&self) -> Result<()>;

    async fn is_armed(&self) -> Result<bool> {
        Err(LabError::Unsupported("armed state query".into()))
    }
}
