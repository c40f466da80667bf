//! Thorlabs PM100D Optical Power Meter Driver
//!
//! Reference: PM100D Operation Manual, "SCPI Commands"
//!
//! Protocol Overview:
//! - SCPI over USBTMC (`/dev/usbtmcN`) or the serial adapter
//! - Terminator: LF (\n)
//! - The valid wavelength range depends on the attached sensor and is read
//!   with `SENS:CORR:WAV? MIN|MAX`
//! - Errors are queued and read with `SYST:ERR?`

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, scpi, units, Action, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DriverFactory, Feat, FeatSet, Instrument, LabError, Limits,
    MessageTransport, Readable, Result, SerialSettings, TransportOptions, WavelengthTunable,
};
use serde::Deserialize;
use tracing::instrument;

/// Range assumed before the sensor limits were read (S120C photodiode).
const FALLBACK_WAVELENGTH_NM: (f64, f64) = (400.0, 1100.0);

/// Configuration for the PM100D driver
#[derive(Debug, Clone, Deserialize)]
pub struct Pm100dConfig {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub wavelength_nm: Option<f64>,
    #[serde(default)]
    pub average_count: Option<u32>,
}

pub struct Pm100dFactory;

static PM100D_CAPABILITIES: &[Capability] =
    &[Capability::Readable, Capability::WavelengthTunable];

impl DriverFactory for Pm100dFactory {
    fn driver_type(&self) -> &'static str {
        "pm100d"
    }

    fn name(&self) -> &'static str {
        "Thorlabs PM100D Power Meter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        PM100D_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Pm100dConfig = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Pm100dConfig = lab_core::parse_config("pm100d", &config)?;
            let transport = cfg
                .connection
                .open("PM100D", &Pm100dDriver::connection_defaults())
                .await
                .context("Failed to open PM100D connection")?;
            let driver = Arc::new(
                Pm100dDriver::with_transport(transport)
                    .with_initial_settings(cfg.wavelength_nm, cfg.average_count),
            );
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_readable(driver.clone())
                .with_wavelength_tunable(driver))
        })
    }
}

/// Driver for the Thorlabs PM100D handheld power meter console.
pub struct Pm100dDriver {
    transport: Arc<MessageTransport>,
    /// `*IDN?` reply (read once)
    pub idn: Feat<String>,
    /// Lower wavelength limit of the attached sensor (read once)
    pub wavelength_min: Feat<f64>,
    /// Upper wavelength limit of the attached sensor (read once)
    pub wavelength_max: Feat<f64>,
    pub wavelength: Feat<f64>,
    /// Samples averaged per reading (about 3 ms each)
    pub average_count: Feat<u32>,
    pub auto_range: Feat<bool>,
    /// Beam diameter used for power density (mm)
    pub beam_diameter: Feat<f64>,
    /// Optical power (W)
    pub power: Feat<f64>,
    initial_wavelength: Option<f64>,
    initial_average_count: Option<u32>,
    feats: FeatSet,
}

impl Pm100dDriver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(115_200),
            TransportOptions::default()
                .with_termination("\n", b'\n')
                .with_timeout(Duration::from_secs(3)),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);

        let idn = Feat::<String>::new("idn")
            .read_once()
            .with_reader(bind::reader(&t, "*IDN?", bind::text));

        let wavelength_min = Feat::<f64>::new("wavelength_min")
            .with_unit(units::NANOMETER)
            .read_once()
            .with_reader(bind::reader(&t, "SENS:CORR:WAV? MIN", bind::number::<f64>));
        let wavelength_max = Feat::<f64>::new("wavelength_max")
            .with_unit(units::NANOMETER)
            .read_once()
            .with_reader(bind::reader(&t, "SENS:CORR:WAV? MAX", bind::number::<f64>));

        let wavelength = Feat::<f64>::new("wavelength")
            .describe("Sensor correction wavelength")
            .with_unit(units::NANOMETER)
            .with_validator({
                let (lo, hi) = (wavelength_min.clone(), wavelength_max.clone());
                move |nm: &f64| {
                    let (min, max) = sensor_range(&lo, &hi);
                    if (min..=max).contains(nm) {
                        Ok(())
                    } else {
                        Err(LabError::OutOfRange {
                            feat: "wavelength".into(),
                            value: *nm,
                            min,
                            max,
                        })
                    }
                }
            })
            .with_reader(bind::reader(&t, "SENS:CORR:WAV?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |nm: &f64| Ok(format!("SENS:CORR:WAV {nm}"))));

        let average_count = Feat::<u32>::new("average_count")
            .with_limits(Limits::new(1.0, 10_000.0).with_step(1.0))
            .with_reader(bind::reader(&t, "SENS:AVER:COUN?", bind::number::<u32>))
            .with_writer(bind::writer(&t, |n: &u32| Ok(format!("SENS:AVER:COUN {n}"))));

        let auto_range = Feat::<bool>::new("auto_range")
            .with_reader(bind::reader(&t, "SENS:POW:RANG:AUTO?", bind::flag))
            .with_writer(bind::writer(&t, |on: &bool| {
                Ok(format!("SENS:POW:RANG:AUTO {}", if *on { "ON" } else { "OFF" }))
            }));

        let beam_diameter = Feat::<f64>::new("beam_diameter")
            .with_unit(units::MILLIMETER)
            .with_reader(bind::reader(&t, "SENS:CORR:BEAM?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |mm: &f64| Ok(format!("SENS:CORR:BEAM {mm}"))));

        let power = Feat::<f64>::new("power")
            .describe("Optical power")
            .with_unit(units::WATT)
            .with_reader(bind::reader(&t, "MEAS:POW?", bind::number::<f64>));

        let mut feats = FeatSet::new();
        feats
            .register(idn.clone())
            .register(wavelength_min.clone())
            .register(wavelength_max.clone())
            .register(wavelength.clone())
            .register(average_count.clone())
            .register(auto_range.clone())
            .register(beam_diameter.clone())
            .register(power.clone());

        let zero_port = Arc::clone(&t);
        feats.register_action(
            Action::new("zero", move |_| {
                let t = Arc::clone(&zero_port);
                Box::pin(async move {
                    zero(&t).await?;
                    Ok(serde_json::Value::Null)
                })
            })
            .describe("Dark-current zero adjustment; block the sensor first"),
        );

        Self {
            transport: t,
            idn,
            wavelength_min,
            wavelength_max,
            wavelength,
            average_count,
            auto_range,
            beam_diameter,
            power,
            initial_wavelength: None,
            initial_average_count: None,
            feats,
        }
    }

    /// Wavelength and averaging applied during `initialize`.
    pub fn with_initial_settings(
        mut self,
        wavelength_nm: Option<f64>,
        average_count: Option<u32>,
    ) -> Self {
        self.initial_wavelength = wavelength_nm;
        self.initial_average_count = average_count;
        self
    }

    /// Drain the SCPI error queue.
    pub async fn check_errors(&self) -> Result<()> {
        scpi::check_errors(&self.transport).await
    }
}

fn sensor_range(min: &Feat<f64>, max: &Feat<f64>) -> (f64, f64) {
    match (min.cached(), max.cached()) {
        (Some(lo), Some(hi)) => (lo, hi),
        _ => FALLBACK_WAVELENGTH_NM,
    }
}

async fn zero(t: &MessageTransport) -> Result<()> {
    t.write("SENS:CORR:COLL:ZERO").await?;
    // *OPC? blocks until the adjustment finished
    let done = t.query("*OPC?").await?;
    if done.trim() != "1" {
        return Err(LabError::parse(t.name(), "*OPC?", done, "expected 1"));
    }
    scpi::check_errors(t).await
}

#[async_trait]
impl Instrument for Pm100dDriver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::PowerMeter)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        let idn = self.idn.get().await?;
        if !idn.to_ascii_uppercase().contains("PM100") {
            return Err(LabError::instrument(
                self.name(),
                format!("*IDN? reply {idn:?} is not a PM100"),
            ));
        }
        let min = self.wavelength_min.get().await?;
        let max = self.wavelength_max.get().await?;
        if let Some(nm) = self.initial_wavelength {
            self.wavelength.set_forced(nm).await?;
        }
        if let Some(n) = self.initial_average_count {
            self.average_count.set_forced(n).await?;
        }
        self.check_errors().await?;
        tracing::info!(device = %self.name(), idn = %idn, min, max, "PM100D ready");
        Ok(())
    }
}

#[async_trait]
impl Readable for Pm100dDriver {
    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn read(&self) -> Result<f64> {
        self.power.refresh().await
    }

    fn unit(&self) -> Option<&'static str> {
        Some("W")
    }
}

#[async_trait]
impl WavelengthTunable for Pm100dDriver {
    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()> {
        self.wavelength.set(wavelength_nm).await?;
        self.check_errors().await
    }

    async fn get_wavelength(&self) -> Result<f64> {
        self.wavelength.refresh().await
    }

    fn wavelength_range(&self) -> (f64, f64) {
        sensor_range(&self.wavelength_min, &self.wavelength_max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::{MockInstrument, MockLog};

    fn meter(mock: MockInstrument) -> (Pm100dDriver, MockLog) {
        let options = Pm100dDriver::connection_defaults()
            .options
            .with_timeout(Duration::from_millis(500));
        let (t, log) = mock
            .on("*IDN?", "Thorlabs,PM100D,P0012345,2.4.0")
            .on("SENS:CORR:WAV? MIN", "4.000000E+02")
            .on("SENS:CORR:WAV? MAX", "1.100000E+03")
            .on("SYST:ERR?", "+0,\"No error\"")
            .spawn_transport("PM100D", options);
        (Pm100dDriver::with_transport(t), log)
    }

    #[test]
    fn factory_metadata() {
        assert_eq!(Pm100dFactory.driver_type(), "pm100d");
        assert!(Pm100dFactory
            .capabilities()
            .contains(&Capability::WavelengthTunable));
        let config = toml::Value::Table(toml::toml! {
            [connection]
            type = "usbtmc"
            path = "/dev/usbtmc0"
        });
        assert!(Pm100dFactory.validate(&config).is_ok());
    }

    #[tokio::test]
    async fn initialize_reads_sensor_limits() {
        let (pm, log) = meter(MockInstrument::new());
        pm.initialize().await.unwrap();
        assert_eq!(pm.wavelength_range(), (400.0, 1100.0));
        assert_eq!(log.count("SENS:CORR:WAV? MIN"), 1);

        pm.initialize().await.unwrap();
        assert_eq!(log.count("SENS:CORR:WAV? MIN"), 1);
    }

    #[tokio::test]
    async fn wavelength_limited_by_sensor() {
        let (pm, log) = meter(MockInstrument::new());
        pm.initialize().await.unwrap();
        log.clear();

        pm.set_wavelength(633.0).await.unwrap();
        assert_eq!(log.commands(), vec!["SENS:CORR:WAV 633", "SYST:ERR?"]);
        assert!(matches!(
            pm.set_wavelength(1550.0).await,
            Err(LabError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn power_reading() {
        let (pm, _log) = meter(MockInstrument::new().on("MEAS:POW?", "1.234000E-03"));
        assert!((pm.read().await.unwrap() - 1.234e-3).abs() < 1e-12);
    }

    #[tokio::test]
    async fn zero_waits_for_completion_and_checks_errors() {
        let (pm, log) = meter(
            MockInstrument::new()
                .on("*OPC?", "1")
                .on("SYST:ERR?", "-221,\"Settings conflict\""),
        );
        let err = pm
            .feats()
            .call("zero", serde_json::Value::Null)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Settings conflict"));
        assert_eq!(log.commands()[..2], ["SENS:CORR:COLL:ZERO", "*OPC?"]);
    }

    #[tokio::test]
    async fn auto_range_uses_on_off() {
        let (pm, log) = meter(MockInstrument::new().on("SENS:POW:RANG:AUTO?", "1"));
        assert!(pm.auto_range.get().await.unwrap());
        pm.auto_range.set(false).await.unwrap();
        assert!(log.wait_for("SENS:POW:RANG:AUTO OFF", Duration::from_secs(1)).await);
    }
}
