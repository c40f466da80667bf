//! Variable attenuator: an ELL14 rotating a polarizer or waveplate.
//!
//! Transmission is a calibrated function of mount angle, measured once per
//! setup and stored either as a polynomial fit or as a CSV table:
//!
//! ```toml
//! [devices.config]
//! address = "2"
//! connection = { type = "serial", port = "/dev/ttyUSB1" }
//! calibration = { kind = "table", path = "cal/attenuator.csv" }
//! ```
//!
//! Reading `transmission` reads the angle and maps it forward; setting it
//! solves the inverse calibration for an angle and moves there.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    units, Calibration, CalibrationConfig, Capability, DeviceCategory, DeviceComponents,
    DriverFactory, Feat, FeatSet, Instrument, Limits, Readable, Result,
};
use serde::Deserialize;
use tracing::instrument;

use crate::ell14::{Ell14Config, Ell14Driver};

/// Configuration for the ELL14 attenuator.
#[derive(Debug, Clone, Deserialize)]
pub struct AttenuatorConfig {
    #[serde(flatten)]
    pub mount: Ell14Config,
    /// Angle (degrees) to transmission (0..1)
    pub calibration: CalibrationConfig,
}

pub struct Ell14AttenuatorFactory;

static ATTENUATOR_CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for Ell14AttenuatorFactory {
    fn driver_type(&self) -> &'static str {
        "ell14_attenuator"
    }

    fn name(&self) -> &'static str {
        "Thorlabs ELL14 Variable Attenuator"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ATTENUATOR_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: AttenuatorConfig = lab_core::parse_config(self.driver_type(), config)?;
        cfg.mount.check()?;
        // Loads the CSV so a bad path fails at validation time
        Calibration::load(&cfg.calibration)?;
        Ok(())
    }

    fn build(
        &self,
        config: toml::Value,
    ) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: AttenuatorConfig = lab_core::parse_config("ell14_attenuator", &config)?;
            let calibration = Calibration::load(&cfg.calibration)?;
            let mount = cfg.mount.open().await?;
            let driver = Arc::new(Ell14Attenuator::new(mount, calibration));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_readable(driver))
        })
    }
}

/// ELL14 mount plus an angle → transmission calibration.
pub struct Ell14Attenuator {
    mount: Ell14Driver,
    /// Fraction of light transmitted (0..1)
    pub transmission: Feat<f64>,
    feats: FeatSet,
}

impl Ell14Attenuator {
    pub fn new(mount: Ell14Driver, calibration: Calibration) -> Self {
        let calibration = Arc::new(calibration);
        let (read_angle, read_cal) = (mount.position.clone(), calibration.clone());
        let (move_to, write_cal) = (mount.position.clone(), calibration);

        let transmission = Feat::<f64>::new("transmission")
            .describe("Fraction of light transmitted")
            .with_unit(units::DIMENSIONLESS)
            .with_limits(Limits::new(0.0, 1.0))
            .with_reader(move || -> BoxFuture<'static, Result<f64>> {
                let (angle, cal) = (read_angle.clone(), read_cal.clone());
                Box::pin(async move { cal.forward(angle.refresh().await?) })
            })
            .with_writer(move |t: f64| -> BoxFuture<'static, Result<()>> {
                let (angle, cal) = (move_to.clone(), write_cal.clone());
                Box::pin(async move {
                    let deg = cal.inverse(t)?;
                    tracing::debug!(transmission = t, angle = deg, "attenuator setpoint");
                    angle.set_forced(deg).await
                })
            });

        let mut feats = FeatSet::new();
        feats
            .register(transmission.clone())
            .register(mount.position.clone())
            .register(mount.info.clone());

        Self {
            mount,
            transmission,
            feats,
        }
    }

    pub fn mount(&self) -> &Ell14Driver {
        &self.mount
    }
}

#[async_trait]
impl Instrument for Ell14Attenuator {
    fn name(&self) -> &str {
        self.mount.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::Attenuator)
    }

    async fn initialize(&self) -> Result<()> {
        self.mount.initialize().await
    }
}

#[async_trait]
impl Readable for Ell14Attenuator {
    #[instrument(skip(self), fields(address = %self.mount.address()), err)]
    async fn read(&self) -> Result<f64> {
        self.transmission.refresh().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::MockInstrument;
    use lab_core::LabError;
    use std::io::Write;

    fn attenuator(mock: MockInstrument) -> (Ell14Attenuator, lab_core::mock::MockLog) {
        let options = Ell14Driver::connection_defaults()
            .options
            .with_termination("\r", b'\n');
        let (bus, log) = mock.spawn_transport("attenuator", options);
        let mount = Ell14Driver::on_bus(Arc::new(bus), "2")
            .unwrap()
            .with_pulses_per_degree(100.0);
        // transmission = angle / 90 on [0, 90]
        let cal = Calibration::load(&CalibrationConfig::Polynomial {
            coefficients: vec![0.0, 1.0 / 90.0],
            domain: (0.0, 90.0),
        })
        .unwrap();
        (Ell14Attenuator::new(mount, cal), log)
    }

    #[test]
    fn config_flattens_mount_settings() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "angle,transmission\n0,0\n90,1").unwrap();

        let config: toml::Value = toml::from_str(&format!(
            r#"
            address = "2"
            connection = {{ type = "serial", port = "/dev/ttyUSB1" }}
            calibration = {{ kind = "table", path = "{}" }}
            "#,
            file.path().display()
        ))
        .unwrap();
        assert!(Ell14AttenuatorFactory.validate(&config).is_ok());

        let missing: toml::Value = toml::from_str(
            r#"
            address = "2"
            connection = { type = "serial", port = "/dev/ttyUSB1" }
            calibration = { kind = "table", path = "/nonexistent/cal.csv" }
            "#,
        )
        .unwrap();
        assert!(Ell14AttenuatorFactory.validate(&missing).is_err());
    }

    #[tokio::test]
    async fn read_maps_angle_through_calibration() {
        // 4500 pulses = 45 degrees at 100 pulses/degree
        let (att, _log) = attenuator(MockInstrument::new().on("2gp", "2PO00001194"));
        let t = att.read().await.unwrap();
        assert!((t - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn set_solves_inverse_and_moves() {
        // 0.25 -> 22.5 degrees -> 2250 pulses = 0x8CA
        let (att, log) = attenuator(MockInstrument::new().on("2ma000008CA", "2PO000008CA"));
        att.transmission.set(0.25).await.unwrap();
        assert_eq!(log.commands(), vec!["2ma000008CA"]);
    }

    #[tokio::test]
    async fn out_of_range_transmission_is_rejected() {
        let (att, log) = attenuator(MockInstrument::new());
        assert!(matches!(
            att.transmission.set(1.5).await,
            Err(LabError::OutOfRange { .. })
        ));
        assert!(log.commands().is_empty());
    }
}
