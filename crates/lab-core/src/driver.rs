//! Instrument lifecycle, capability bag and the driver factory API.
//!
//! Drivers implement [`DriverFactory`] and are registered with the
//! `DeviceRegistry` at startup. A factory turns one `[[devices]]` TOML
//! table into a connected driver and returns it as [`DeviceComponents`]:
//! the [`Instrument`] itself (feats, actions, lifecycle) plus whichever
//! capability traits it implements.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ registry.register_factory(Box::new(Sr830Factory));          │
//! └──────────────────────────────────────────────────────────────┘
//!                               │  [[devices]] driver = "sr830"
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ DriverFactory::validate(&config)   (no I/O)                  │
//! │ DriverFactory::build(config)       (opens the connection)    │
//! └──────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌──────────────────────────────────────────────────────────────┐
//! │ DeviceComponents { instrument, readable, movable, ... }      │
//! │ Instrument::initialize()  ...  Instrument::finalize()        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::capabilities::{
    DeviceCategory, EmissionControl, Movable, Readable, ShutterControl, Triggerable,
    WavelengthTunable,
};
use crate::error::Result;
use crate::feat_set::FeatSet;

// =============================================================================
// Instrument lifecycle
// =============================================================================

/// A connected instrument with a named feat surface.
///
/// `initialize` brings the device into the state the driver's parsers
/// expect (echo off, units, header mode); `finalize` returns it to local
/// control. Both default to doing nothing.
#[async_trait]
pub trait Instrument: Send + Sync {
    fn name(&self) -> &str;

    fn feats(&self) -> &FeatSet;

    fn category(&self) -> Option<DeviceCategory> {
        None
    }

    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        Ok(())
    }
}

/// Run `body` between `initialize` and `finalize`.
///
/// `finalize` runs even if `body` fails; the body's error is returned in
/// preference to a finalize error.
pub async fn scoped<I, F, Fut, R>(instrument: Arc<I>, body: F) -> Result<R>
where
    I: Instrument + ?Sized,
    F: FnOnce(Arc<I>) -> Fut,
    Fut: Future<Output = Result<R>>,
{
    instrument.initialize().await?;
    let outcome = body(Arc::clone(&instrument)).await;
    let closed = instrument.finalize().await;
    match (outcome, closed) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(e)) => Err(e),
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(finalize_err)) => {
            tracing::warn!(
                device = instrument.name(),
                error = %finalize_err,
                "finalize failed after error"
            );
            Err(e)
        }
    }
}

// =============================================================================
// Capability Enum
// =============================================================================

/// Runtime capability flags mirroring the capability traits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Readable,
    Movable,
    WavelengthTunable,
    EmissionControl,
    ShutterControl,
    Triggerable,
}

impl Capability {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Readable => "Readable",
            Self::Movable => "Movable",
            Self::WavelengthTunable => "Wavelength Tunable",
            Self::EmissionControl => "Emission Control",
            Self::ShutterControl => "Shutter Control",
            Self::Triggerable => "Triggerable",
        }
    }
}

// =============================================================================
// Device Components (Capability Bag)
// =============================================================================

/// Trait objects a factory hands to the registry.
///
/// Each capability is stored separately so the registry can look devices up
/// by capability without downcasting.
#[derive(Default, Clone)]
pub struct DeviceComponents {
    pub instrument: Option<Arc<dyn Instrument>>,
    pub readable: Option<Arc<dyn Readable>>,
    pub movable: Option<Arc<dyn Movable>>,
    pub wavelength_tunable: Option<Arc<dyn WavelengthTunable>>,
    pub emission_control: Option<Arc<dyn EmissionControl>>,
    pub shutter_control: Option<Arc<dyn ShutterControl>>,
    pub triggerable: Option<Arc<dyn Triggerable>>,
}

impl DeviceComponents {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn capabilities(&self) -> Vec<Capability> {
        let mut caps = Vec::new();
        if self.readable.is_some() {
            caps.push(Capability::Readable);
        }
        if self.movable.is_some() {
            caps.push(Capability::Movable);
        }
        if self.wavelength_tunable.is_some() {
            caps.push(Capability::WavelengthTunable);
        }
        if self.emission_control.is_some() {
            caps.push(Capability::EmissionControl);
        }
        if self.shutter_control.is_some() {
            caps.push(Capability::ShutterControl);
        }
        if self.triggerable.is_some() {
            caps.push(Capability::Triggerable);
        }
        caps
    }

    pub fn category(&self) -> Option<DeviceCategory> {
        self.instrument.as_ref().and_then(|i| i.category())
    }

    pub fn with_instrument(mut self, i: Arc<dyn Instrument>) -> Self {
        self.instrument = Some(i);
        self
    }

    pub fn with_readable(mut self, r: Arc<dyn Readable>) -> Self {
        self.readable = Some(r);
        self
    }

    pub fn with_movable(mut self, m: Arc<dyn Movable>) -> Self {
        self.movable = Some(m);
        self
    }

    pub fn with_wavelength_tunable(mut self, w: Arc<dyn WavelengthTunable>) -> Self {
        self.wavelength_tunable = Some(w);
        self
    }

    pub fn with_emission_control(mut self, e: Arc<dyn EmissionControl>) -> Self {
        self.emission_control = Some(e);
        self
    }

    pub fn with_shutter_control(mut self, s: Arc<dyn ShutterControl>) -> Self {
        self.shutter_control = Some(s);
        self
    }

    pub fn with_triggerable(mut self, t: Arc<dyn Triggerable>) -> Self {
        self.triggerable = Some(t);
        self
    }
}

impl std::fmt::Debug for DeviceComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceComponents")
            .field("instrument", &self.instrument.as_ref().map(|i| i.name().to_string()))
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// =============================================================================
// Driver Factory Trait
// =============================================================================

/// Creates driver instances from configuration.
///
/// Factories are registered once and live for the program's lifetime.
/// `validate` must not touch hardware; `build` opens the connection and
/// returns the driver's components (the registry calls `initialize`).
pub trait DriverFactory: Send + Sync + 'static {
    /// Value of the `driver` field in device configuration.
    fn driver_type(&self) -> &'static str;

    /// Human-readable name, e.g. "Stanford Research SR830 Lock-in Amplifier".
    fn name(&self) -> &'static str;

    fn capabilities(&self) -> &'static [Capability] {
        &[]
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()>;

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>>;
}

/// Deserialize a driver config table, naming the driver on failure.
pub fn parse_config<T: DeserializeOwned>(driver: &str, config: &toml::Value) -> anyhow::Result<T> {
    use anyhow::Context;
    config
        .clone()
        .try_into()
        .with_context(|| format!("invalid {driver} config"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LabError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        feats: FeatSet,
        initialized: AtomicUsize,
        finalized: AtomicUsize,
    }

    #[async_trait]
    impl Instrument for Counting {
        fn name(&self) -> &str {
            "counting"
        }

        fn feats(&self) -> &FeatSet {
            &self.feats
        }

        async fn initialize(&self) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn finalize(&self) -> Result<()> {
            self.finalized.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn scoped_finalizes_after_success() {
        let dev = Arc::new(Counting::default());
        let out = scoped(dev.clone(), |d| async move { Ok(d.name().len()) })
            .await
            .unwrap();
        assert_eq!(out, 8);
        assert_eq!(dev.initialized.load(Ordering::SeqCst), 1);
        assert_eq!(dev.finalized.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn scoped_finalizes_after_failure() {
        let dev = Arc::new(Counting::default());
        let out: Result<()> = scoped(dev.clone(), |_| async {
            Err(LabError::instrument("counting", "boom"))
        })
        .await;
        assert!(matches!(out, Err(LabError::Instrument { .. })));
        assert_eq!(dev.finalized.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn components_report_capabilities() {
        let empty = DeviceComponents::new();
        assert!(empty.capabilities().is_empty());

        let dev: Arc<dyn Instrument> = Arc::new(Counting::default());
        let components = DeviceComponents::new().with_instrument(dev);
        assert!(components.capabilities().is_empty());
        assert!(components.category().is_none());
    }

    #[test]
    fn capability_serde() {
        assert_eq!(
            serde_json::to_string(&Capability::WavelengthTunable).unwrap(),
            "\"wavelength_tunable\""
        );
        let cap: Capability = serde_json::from_str("\"emission_control\"").unwrap();
        assert_eq!(cap, Capability::EmissionControl);
        assert_eq!(Capability::Movable.name(), "Movable");
    }

    #[test]
    fn parse_config_names_driver() {
        #[derive(Debug, Deserialize)]
        struct Cfg {
            #[allow(dead_code)]
            port: String,
        }
        let bad = toml::Value::Table(toml::toml! { baud = 9600 });
        let err = parse_config::<Cfg>("sr830", &bad).unwrap_err();
        assert!(err.to_string().contains("sr830"));
    }
}
