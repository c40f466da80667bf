//! Newport 1830-C Optical Power Meter Driver
//!
//! Reference: Newport 1830-C User's Manual
//!
//! Protocol Overview:
//! - Format: Simple ASCII commands (NOT SCPI)
//! - Baud: 9600, 8N1, no flow control
//! - Terminator: LF only (\n) - NOT CRLF
//! - Commands: A0/A1 (attenuator), F1/F2/F3 (filter), Wxxxx (wavelength),
//!   U1-U4 (units), R0-R8 (range, 0 = auto), Z0/Z1 (zero)
//! - Queries: D? (power), W? (wavelength), A?, F?, R?, U?
//!
//! Unit Commands (1-indexed):
//! - U1 = Watts (scientific notation, e.g., "+.11E-9")
//! - U2 = dBm (decimal, e.g., "-15.24")
//! - U3 = dB (relative, decimal)
//! - U4 = REL (relative linear)
//!
//! The driver puts the meter in Watts mode (U1) at initialization, and the
//! `power` feat re-sends U1 before every `D?`, so a front-panel switch to
//! dBm never reaches the parser.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lab_driver_newport::Newport1830CFactory;
//! use lab_core::DriverFactory;
//!
//! let config = toml::toml! {
//!     wavelength_nm = 633.0
//!     [connection]
//!     type = "serial"
//!     port = "/dev/ttyS0"
//! };
//! let components = Newport1830CFactory.build(config.into()).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, units, Action, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DriverFactory, Feat, FeatSet, Instrument, LabError, Limits,
    MessageTransport, Readable, Result, SerialSettings, TransportOptions, ValueMap,
    WavelengthTunable,
};
use serde::Deserialize;
use tracing::instrument;

/// Calibration wavelength range of the 818-series detectors.
pub const WAVELENGTH_RANGE_NM: (f64, f64) = (300.0, 1100.0);

/// Time the meter needs to settle after a zero command.
const ZERO_SETTLE: Duration = Duration::from_millis(500);

const WATTS: &str = "watts";

/// Error replies to `D?`.
const POWER_FAULTS: &[(&str, &str)] = &[
    ("ERR", "meter error"),
    ("OVER", "overrange (signal too bright)"),
    ("UNDER", "underrange (signal too dim)"),
    ("SAT", "detector saturated"),
];

// =============================================================================
// Newport1830CFactory - DriverFactory implementation
// =============================================================================

/// Configuration for the Newport 1830-C driver
#[derive(Debug, Clone, Deserialize)]
pub struct Newport1830CConfig {
    pub connection: ConnectionConfig,
    /// Wavelength applied at initialization, in nm
    #[serde(default)]
    pub wavelength_nm: Option<f64>,
}

/// Factory for creating Newport 1830-C driver instances.
pub struct Newport1830CFactory;

/// Static capabilities for Newport 1830-C
static NEWPORT_1830C_CAPABILITIES: &[Capability] =
    &[Capability::Readable, Capability::WavelengthTunable];

impl DriverFactory for Newport1830CFactory {
    fn driver_type(&self) -> &'static str {
        "newport1830_c"
    }

    fn name(&self) -> &'static str {
        "Newport 1830-C Optical Power Meter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        NEWPORT_1830C_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Newport1830CConfig = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        if let Some(wl) = cfg.wavelength_nm {
            let (min, max) = WAVELENGTH_RANGE_NM;
            if !(min..=max).contains(&wl) {
                return Err(anyhow!("Wavelength {wl} nm out of range ({min}-{max} nm)"));
            }
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Newport1830CConfig = lab_core::parse_config("newport1830_c", &config)?;
            let transport = cfg
                .connection
                .open("Newport 1830-C", &Newport1830CDriver::connection_defaults())
                .await
                .context("Failed to open Newport 1830-C connection")?;

            let driver = Arc::new(
                Newport1830CDriver::with_transport(transport).with_initial_wavelength(cfg.wavelength_nm),
            );

            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_readable(driver.clone())
                .with_wavelength_tunable(driver))
        })
    }
}

// =============================================================================
// Newport1830CDriver
// =============================================================================

/// Driver for Newport 1830-C optical power meter
///
/// Implements Readable and WavelengthTunable capability traits.
/// Uses Newport's simple ASCII protocol (not SCPI).
pub struct Newport1830CDriver {
    transport: Arc<MessageTransport>,
    /// Detector calibration wavelength (nm)
    pub wavelength: Feat<f64>,
    /// Attenuator in the beam path
    pub attenuator: Feat<bool>,
    /// Digital filter: slow, medium, fast
    pub filter: Feat<String>,
    /// Display units: watts, dbm, db, rel
    pub units: Feat<String>,
    /// Signal range, 0 = auto
    pub range: Feat<u8>,
    /// Optical power (W)
    pub power: Feat<f64>,
    initial_wavelength: Option<f64>,
    feats: FeatSet,
}

impl Newport1830CDriver {
    /// Serial line settings and framing of the 1830-C.
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(9600),
            TransportOptions::default()
                .with_termination("\n", b'\n')
                .with_timeout(Duration::from_secs(1))
                // 9600 baud replies arrive in gaps; leftovers would shift
                // every later reply by one
                .with_drain(true)
                .with_write_delay(Duration::from_millis(50)),
        )
    }

    /// Wrap an open transport. No I/O happens until `initialize`.
    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);

        let wavelength = Feat::<f64>::new("wavelength")
            .describe("Detector calibration wavelength")
            .with_unit(units::NANOMETER)
            .with_limits(Limits::new(WAVELENGTH_RANGE_NM.0, WAVELENGTH_RANGE_NM.1).with_step(1.0))
            .with_reader(bind::reader(&t, "W?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |nm: &f64| Ok(format!("W{:04}", nm.round() as u16))));

        let attenuator = Feat::<bool>::new("attenuator")
            .with_reader(bind::reader(&t, "A?", bind::flag))
            .with_writer(bind::writer(&t, |on: &bool| {
                Ok(if *on { "A1" } else { "A0" }.to_string())
            }));

        let filters = ValueMap::strings([("slow", "1"), ("medium", "2"), ("fast", "3")]);
        let filter = Feat::<String>::new("filter")
            .describe("Digital averaging filter")
            .with_values(&filters)
            .with_reader(bind::reader(&t, "F?", {
                let map = filters.clone();
                move |reply: &str| map.from_wire("filter", reply)
            }))
            .with_writer(bind::writer(&t, move |f: &String| {
                Ok(format!("F{}", filters.to_wire("filter", f)?))
            }));

        let unit_modes =
            ValueMap::strings([(WATTS, "1"), ("dbm", "2"), ("db", "3"), ("rel", "4")]);
        let units_feat = Feat::<String>::new("units")
            .with_values(&unit_modes)
            .with_reader(bind::reader(&t, "U?", {
                let map = unit_modes.clone();
                move |reply: &str| map.from_wire("units", reply)
            }))
            .with_writer(bind::writer(&t, move |u: &String| {
                Ok(format!("U{}", unit_modes.to_wire("units", u)?))
            }));

        let range = Feat::<u8>::new("range")
            .describe("Signal range, 0 selects auto-ranging")
            .with_limits(Limits::new(0.0, 8.0).with_step(1.0))
            .with_reader(bind::reader(&t, "R?", bind::number::<u8>))
            .with_writer(bind::writer(&t, |r: &u8| Ok(format!("R{r}"))));

        let power = Feat::<f64>::new("power")
            .describe("Optical power")
            .with_unit(units::WATT)
            .with_reader({
                let (t, units_feat) = (Arc::clone(&t), units_feat.clone());
                move || -> BoxFuture<'static, Result<f64>> {
                    let (t, units_feat) = (Arc::clone(&t), units_feat.clone());
                    Box::pin(async move {
                        units_feat.set_forced(WATTS.to_string()).await?;
                        let reply = t.query_with_retry("D?", 2).await?;
                        parse_power(t.name(), &reply)
                    })
                }
            });

        let mut feats = FeatSet::new();
        feats
            .register(wavelength.clone())
            .register(attenuator.clone())
            .register(filter.clone())
            .register(units_feat.clone())
            .register(range.clone())
            .register(power.clone());

        let zero_port = Arc::clone(&t);
        feats.register_action(
            Action::new("zero", move |args| {
                let t = Arc::clone(&zero_port);
                Box::pin(async move {
                    let args: ZeroArgs = Action::args(args)?;
                    send_zero(&t, args.attenuator).await?;
                    Ok(serde_json::Value::Null)
                })
            })
            .describe("Take the current reading as zero; block the beam first"),
        );

        Self {
            transport: t,
            wavelength,
            attenuator,
            filter,
            units: units_feat,
            range,
            power,
            initial_wavelength: None,
            feats,
        }
    }

    /// Wavelength to apply during `initialize`.
    pub fn with_initial_wavelength(mut self, wavelength_nm: Option<f64>) -> Self {
        self.initial_wavelength = wavelength_nm;
        self
    }

    /// Zero the power meter
    ///
    /// Sets the current optical power level as the zero reference. Block
    /// the detector before zeroing.
    ///
    /// * `use_attenuator` - zero with the attenuator in (Z1) or out (Z0)
    pub async fn zero(&self, use_attenuator: bool) -> Result<()> {
        send_zero(&self.transport, use_attenuator).await
    }
}

#[derive(Debug, Default, Deserialize)]
struct ZeroArgs {
    #[serde(default)]
    attenuator: bool,
}

async fn send_zero(t: &MessageTransport, use_attenuator: bool) -> Result<()> {
    t.write(if use_attenuator { "Z1" } else { "Z0" }).await?;
    tokio::time::sleep(ZERO_SETTLE).await;
    tracing::info!(device = %t.name(), use_attenuator, "zeroed");
    Ok(())
}

/// Parse a `D?` reply (scientific notation in Watts mode).
///
/// Expected format: "1.234E-06", "+.75E-9", "5E-9". The meter reports
/// faults in-band as ERR, OVER, UNDER or SAT.
fn parse_power(device: &str, reply: &str) -> Result<f64> {
    let upper = reply.trim().to_ascii_uppercase();
    if let Some((_, meaning)) = POWER_FAULTS.iter().find(|(flag, _)| upper.contains(flag)) {
        return Err(LabError::instrument(device, format!("{meaning}: {}", reply.trim())));
    }
    bind::number::<f64>(reply)
        .map_err(|_| LabError::parse(device, "D?", reply, "expected power in watts"))
}

#[async_trait]
impl Instrument for Newport1830CDriver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::PowerMeter)
    }

    /// Disable echo (E0) first so replies are not prefixed by the command,
    /// then select Watts and check the meter answers a wavelength query.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.transport.write("E0").await?;
        self.units.set_forced(WATTS.to_string()).await?;

        let wavelength = self.wavelength.refresh().await.map_err(|e| {
            LabError::instrument(
                self.name(),
                format!("no response to wavelength query: {e}"),
            )
        })?;
        let (min, max) = WAVELENGTH_RANGE_NM;
        if !(min..=max).contains(&wavelength) {
            return Err(LabError::instrument(
                self.name(),
                format!("wavelength {wavelength} nm out of expected range"),
            ));
        }
        tracing::info!(device = %self.name(), wavelength, "Newport 1830-C validated");

        if let Some(nm) = self.initial_wavelength {
            self.wavelength.set(nm).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Readable for Newport1830CDriver {
    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn read(&self) -> Result<f64> {
        let power = self.power.get().await?;
        tracing::debug!(device = %self.name(), power, "power reading");
        Ok(power)
    }

    fn unit(&self) -> Option<&'static str> {
        Some("W")
    }
}

#[async_trait]
impl WavelengthTunable for Newport1830CDriver {
    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()> {
        self.wavelength.set(wavelength_nm).await
    }

    async fn get_wavelength(&self) -> Result<f64> {
        self.wavelength.get().await
    }

    fn wavelength_range(&self) -> (f64, f64) {
        WAVELENGTH_RANGE_NM
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::{MockInstrument, MockLog};

    const WAIT: Duration = Duration::from_secs(1);

    fn meter(mock: MockInstrument) -> (Newport1830CDriver, MockLog) {
        let options = Newport1830CDriver::connection_defaults()
            .options
            .with_write_delay(Duration::ZERO);
        let (transport, log) = mock.spawn_transport("1830-C", options);
        (Newport1830CDriver::with_transport(transport), log)
    }

    #[test]
    fn test_factory_driver_type() {
        let factory = Newport1830CFactory;
        assert_eq!(factory.driver_type(), "newport1830_c");
        assert_eq!(factory.name(), "Newport 1830-C Optical Power Meter");
    }

    #[test]
    fn test_factory_capabilities() {
        let caps = Newport1830CFactory.capabilities();
        assert!(caps.contains(&Capability::Readable));
        assert!(caps.contains(&Capability::WavelengthTunable));
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = Newport1830CFactory;

        let valid = toml::Value::Table(toml::toml! {
            wavelength_nm = 800.0
            [connection]
            type = "serial"
            port = "/dev/ttyS0"
        });
        assert!(factory.validate(&valid).is_ok());

        let invalid_wl = toml::Value::Table(toml::toml! {
            wavelength_nm = 2000.0
            [connection]
            type = "serial"
            port = "/dev/ttyS0"
        });
        assert!(factory.validate(&invalid_wl).is_err());

        let missing_connection = toml::Value::Table(toml::toml! {
            wavelength_nm = 800.0
        });
        assert!(factory.validate(&missing_connection).is_err());
    }

    #[test]
    fn test_parse_power_response() {
        for (input, expected) in [
            ("5E-9", 5e-9),
            ("1.234E-6", 1.234e-6),
            ("+.75E-9", 0.75e-9),
            ("1E0", 1.0),
        ] {
            assert_eq!(parse_power("1830-C", input).unwrap(), expected, "{input}");
        }
        for fault in ["ERR", "OVER", "UNDER", "SAT"] {
            assert!(matches!(
                parse_power("1830-C", fault),
                Err(LabError::Instrument { .. })
            ));
        }
        assert!(matches!(
            parse_power("1830-C", "-15.2x"),
            Err(LabError::Parse { .. })
        ));
    }

    #[tokio::test]
    async fn initialize_disables_echo_selects_watts_and_validates() {
        let (driver, log) = meter(MockInstrument::new().on("W?", "0800"));

        driver.initialize().await.unwrap();

        assert_eq!(log.commands(), vec!["E0", "U1", "W?"]);
        assert_eq!(driver.wavelength.cached(), Some(800.0));
        assert_eq!(driver.units.cached().as_deref(), Some("watts"));
    }

    #[tokio::test]
    async fn initialize_rejects_implausible_wavelength() {
        let (driver, _log) = meter(MockInstrument::new().on("W?", "0000"));
        assert!(matches!(
            driver.initialize().await,
            Err(LabError::Instrument { .. })
        ));
    }

    #[tokio::test]
    async fn initial_wavelength_is_applied_after_validation() {
        let (driver, log) = meter(MockInstrument::new().on("W?", "0800"));
        let driver = driver.with_initial_wavelength(Some(632.8));

        driver.initialize().await.unwrap();

        assert!(log.wait_for("W0633", WAIT).await);
        assert_eq!(driver.get_wavelength().await.unwrap(), 800.0);
    }

    #[tokio::test]
    async fn wavelength_writes_four_digit_command() {
        let (driver, log) = meter(MockInstrument::new());

        driver.set_wavelength(800.0).await.unwrap();
        assert!(log.wait_for("W0800", WAIT).await);

        let err = driver.set_wavelength(1500.0).await.unwrap_err();
        assert!(matches!(err, LabError::OutOfRange { .. }));
    }

    #[tokio::test]
    async fn power_reasserts_watts_before_every_read() {
        let (driver, log) = meter(MockInstrument::new().on("D?", "+.75E-9"));

        assert_eq!(driver.read().await.unwrap(), 0.75e-9);
        assert_eq!(driver.read().await.unwrap(), 0.75e-9);

        assert_eq!(log.commands(), vec!["U1", "D?", "U1", "D?"]);
    }

    #[tokio::test]
    async fn power_fault_is_an_instrument_error() {
        let (driver, _log) = meter(MockInstrument::new().on("D?", "OVER"));
        assert!(matches!(
            driver.read().await,
            Err(LabError::Instrument { .. })
        ));
    }

    #[tokio::test]
    async fn enumerated_feats_map_labels() {
        let (driver, log) = meter(
            MockInstrument::new()
                .on("F?", "3")
                .on("U?", "2")
                .on("A?", "1")
                .on("R?", "0"),
        );

        assert_eq!(driver.filter.get().await.unwrap(), "fast");
        assert_eq!(driver.units.get().await.unwrap(), "dbm");
        assert!(driver.attenuator.get().await.unwrap());
        assert_eq!(driver.range.get().await.unwrap(), 0);

        driver.filter.set("slow".into()).await.unwrap();
        assert!(log.wait_for("F1", WAIT).await);
        driver.attenuator.set(false).await.unwrap();
        assert!(log.wait_for("A0", WAIT).await);
        driver.range.set(4).await.unwrap();
        assert!(log.wait_for("R4", WAIT).await);

        let err = driver.filter.set("turbo".into()).await.unwrap_err();
        assert!(matches!(err, LabError::InvalidChoice { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_action_selects_attenuator_variant() {
        let (driver, log) = meter(MockInstrument::new());

        driver
            .feats()
            .call("zero", serde_json::json!({ "attenuator": true }))
            .await
            .unwrap();
        driver.zero(false).await.unwrap();

        assert_eq!(log.commands(), vec!["Z1", "Z0"]);
    }
}
