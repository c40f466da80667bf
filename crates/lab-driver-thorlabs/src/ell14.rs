//! Thorlabs Elliptec ELL14 Rotation Mount Driver
//!
//! Protocol: RS-485 multidrop bus, 9600 baud, ASCII encoded
//! Reference: ELLx modules protocol manual Issue 10
//!
//! Commands are `{addr}{cmd}{data}` with no terminator; replies are
//! `{addr}{CODE}{data}\r\n`. Positions travel as 8 hex digits of motor
//! pulses (two's complement for relative moves). Moves answer with `PO`
//! (final position) or `GS` (status) once the motor stops.
//!
//! # Usage
//!
//! ```rust,ignore
//! use lab_driver_thorlabs::Ell14Factory;
//! use lab_core::DriverFactory;
//!
//! let config = toml::toml! {
//!     address = "2"
//!     [connection]
//!     type = "serial"
//!     port = "/dev/ttyUSB1"
//! };
//! let components = Ell14Factory.build(config.into()).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    units, Action, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DriverFactory, Feat, FeatSet, Instrument, LabError, MessageTransport,
    Movable, Result, SerialSettings, TransportOptions,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::shared_ports::get_or_open_bus;

// =============================================================================
// Ell14Factory - DriverFactory implementation
// =============================================================================

/// Configuration for ELL14 driver
#[derive(Debug, Clone, Deserialize)]
pub struct Ell14Config {
    pub connection: ConnectionConfig,
    /// Device address on RS-485 bus (0-9, A-F)
    pub address: String,
    /// Optional custom calibration (pulses per degree); the device's own
    /// `in` record is used otherwise
    #[serde(default)]
    pub pulses_per_degree: Option<f64>,
    /// Optional reply timeout in milliseconds (default: 3000)
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl Ell14Config {
    pub(crate) fn check(&self) -> anyhow::Result<()> {
        self.connection.validate()?;
        check_address(&self.address)?;
        if let Some(ppd) = self.pulses_per_degree {
            if !(ppd.is_finite() && ppd > 0.0) {
                return Err(anyhow!("pulses_per_degree must be positive, got {ppd}"));
            }
        }
        Ok(())
    }

    /// Open (or join) the bus and build the driver.
    pub(crate) async fn open(&self) -> anyhow::Result<Ell14Driver> {
        let mut defaults = Ell14Driver::connection_defaults();
        if let Some(ms) = self.timeout_ms {
            defaults.options.timeout = Duration::from_millis(ms);
        }
        let bus = get_or_open_bus(&self.connection, "ELL14 bus", &defaults)
            .await
            .context("Failed to open ELL14 bus")?;
        let driver = Ell14Driver::on_bus(bus, &self.address)?;
        Ok(match self.pulses_per_degree {
            Some(ppd) => driver.with_pulses_per_degree(ppd),
            None => driver,
        })
    }
}

/// Factory for creating ELL14 driver instances.
pub struct Ell14Factory;

/// Static capabilities for ELL14
static ELL14_CAPABILITIES: &[Capability] = &[Capability::Movable];

impl DriverFactory for Ell14Factory {
    fn driver_type(&self) -> &'static str {
        "ell14"
    }

    fn name(&self) -> &'static str {
        "Thorlabs ELL14 Rotation Mount"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ELL14_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Ell14Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.check()
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Ell14Config = lab_core::parse_config("ell14", &config)?;
            let driver = Arc::new(cfg.open().await?);
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_movable(driver))
        })
    }
}

fn check_address(address: &str) -> Result<()> {
    let valid = address.len() == 1 && address.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(LabError::Configuration(format!(
            "ELL14 address must be one hex digit (0-9, A-F), got {address:?}"
        )))
    }
}

// =============================================================================
// ELL14 Status Codes
// =============================================================================

/// ELL14 status/error codes returned in GS responses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Ell14StatusCode {
    Ok = 0x00,
    CommunicationTimeout = 0x01,
    MechanicalTimeout = 0x02,
    CommandError = 0x03,
    ValueOutOfRange = 0x04,
    ModuleIsolated = 0x05,
    ModuleOutOfIsolation = 0x06,
    InitializationError = 0x07,
    ThermalError = 0x08,
    Busy = 0x09,
    SensorError = 0x0A,
    MotorError = 0x0B,
    OutOfRange = 0x0C,
    OverCurrentError = 0x0D,
    Unknown = 0xFF,
}

impl Ell14StatusCode {
    pub fn from_hex(hex: &str) -> Self {
        match u8::from_str_radix(hex.trim(), 16) {
            Ok(code) => Self::from_u8(code),
            Err(_) => Self::Unknown,
        }
    }

    pub fn from_u8(code: u8) -> Self {
        match code {
            0x00 => Self::Ok,
            0x01 => Self::CommunicationTimeout,
            0x02 => Self::MechanicalTimeout,
            0x03 => Self::CommandError,
            0x04 => Self::ValueOutOfRange,
            0x05 => Self::ModuleIsolated,
            0x06 => Self::ModuleOutOfIsolation,
            0x07 => Self::InitializationError,
            0x08 => Self::ThermalError,
            0x09 => Self::Busy,
            0x0A => Self::SensorError,
            0x0B => Self::MotorError,
            0x0C => Self::OutOfRange,
            0x0D => Self::OverCurrentError,
            _ => Self::Unknown,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }

    /// Not an error: the motor is still moving.
    pub fn is_busy(&self) -> bool {
        matches!(self, Self::Busy)
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Ok => "No error",
            Self::CommunicationTimeout => "Communication timeout",
            Self::MechanicalTimeout => "Mechanical timeout",
            Self::CommandError => "Command error",
            Self::ValueOutOfRange => "Value out of range",
            Self::ModuleIsolated => "Module isolated",
            Self::ModuleOutOfIsolation => "Module out of isolation",
            Self::InitializationError => "Initialization error",
            Self::ThermalError => "Thermal error",
            Self::Busy => "Busy",
            Self::SensorError => "Sensor error",
            Self::MotorError => "Motor error",
            Self::OutOfRange => "Position out of range",
            Self::OverCurrentError => "Over current error",
            Self::Unknown => "Unknown error",
        }
    }

    /// `Ok(self)` for idle/busy, a [`LabError::Status`] for faults.
    pub fn into_result(self, device: &str) -> Result<Self> {
        if self.is_ok() || self.is_busy() {
            Ok(self)
        } else {
            Err(LabError::Status {
                device: device.to_string(),
                flags: vec![self.description().to_string()],
            })
        }
    }
}

// =============================================================================
// Device information
// =============================================================================

/// Decoded `in` reply: the module's identity and motor calibration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ell14Info {
    /// ELL module type (14 for ELL14)
    pub model: u8,
    pub serial: String,
    pub year: u16,
    pub firmware: String,
    pub hardware: String,
    /// Travel in degrees
    pub travel: u32,
    /// Motor pulses per revolution
    pub pulses_per_unit: u32,
}

impl Ell14Info {
    /// Parse the 30 data characters after `{addr}IN`, e.g.
    /// `0E1140051720231701016800023000`.
    pub fn parse(data: &str) -> Option<Self> {
        let data = data.trim();
        let field = |range: std::ops::Range<usize>| data.get(range);
        let hex = |range: std::ops::Range<usize>| {
            field(range).and_then(|f| u32::from_str_radix(f, 16).ok())
        };
        Some(Self {
            model: u8::from_str_radix(field(0..2)?, 16).ok()?,
            serial: field(2..10)?.to_string(),
            year: field(10..14)?.parse().ok()?,
            firmware: field(14..16)?.to_string(),
            hardware: field(16..18)?.to_string(),
            travel: hex(18..22)?,
            pulses_per_unit: hex(22..30)?,
        })
    }

    /// Calibration derived from the device's own memory, if plausible.
    pub fn pulses_per_degree(&self) -> Option<f64> {
        let ppd = self.pulses_per_unit as f64 / 360.0;
        // ~398 for an ELL14
        (100.0..1000.0).contains(&ppd).then_some(ppd)
    }
}

// =============================================================================
// Bus exchange
// =============================================================================

/// One module's view of the shared bus.
#[derive(Clone)]
struct Module {
    bus: Arc<MessageTransport>,
    address: String,
}

impl Module {
    fn device(&self) -> String {
        format!("ELL14@{}", self.address)
    }

    /// Send `{addr}{cmd}` and split the reply into its code and data.
    async fn exchange(&self, cmd: &str) -> Result<(String, String)> {
        let full = format!("{}{cmd}", self.address);
        let reply = self.bus.query(&full).await?;
        let body = reply
            .strip_prefix(self.address.as_str())
            .filter(|b| b.len() >= 2)
            .ok_or_else(|| {
                LabError::parse(self.device(), &full, &reply, "reply from another module")
            })?;
        let (code, data) = body.split_at(2);
        tracing::trace!(device = %self.device(), cmd, code, data, "ELL14 exchange");
        Ok((code.to_ascii_uppercase(), data.trim().to_string()))
    }

    /// Exchange a motion command; `PO` or an idle/busy `GS` is success.
    async fn motion(&self, cmd: &str) -> Result<Option<i32>> {
        match self.exchange(cmd).await? {
            (code, data) if code == "PO" => Ok(Some(parse_pulses(&self.device(), cmd, &data)?)),
            (code, data) if code == "GS" => {
                Ell14StatusCode::from_hex(&data).into_result(&self.device())?;
                Ok(None)
            }
            (code, data) => Err(LabError::parse(
                self.device(),
                cmd,
                format!("{code}{data}"),
                "expected PO or GS",
            )),
        }
    }

    async fn status(&self) -> Result<Ell14StatusCode> {
        match self.exchange("gs").await? {
            (code, data) if code == "GS" => Ok(Ell14StatusCode::from_hex(&data)),
            (code, data) => Err(LabError::parse(
                self.device(),
                "gs",
                format!("{code}{data}"),
                "expected GS",
            )),
        }
    }
}

fn parse_pulses(device: &str, cmd: &str, data: &str) -> Result<i32> {
    data.get(..8)
        .and_then(|hex| u32::from_str_radix(hex, 16).ok())
        .map(|p| p as i32)
        .ok_or_else(|| LabError::parse(device, cmd, data, "expected 8 hex digits"))
}

/// Two's-complement hex encoding of a pulse count.
fn encode_pulses(pulses: i32) -> String {
    format!("{:08X}", pulses as u32)
}

/// Pulses-per-degree source: an explicit override, else the `info` record.
#[derive(Clone)]
struct Scale {
    override_ppd: Option<f64>,
    info: Feat<Ell14Info>,
}

impl Scale {
    fn pulses_per_degree(&self) -> f64 {
        self.override_ppd
            .or_else(|| self.info.cached().and_then(|i| i.pulses_per_degree()))
            .unwrap_or(Ell14Driver::DEFAULT_PULSES_PER_DEGREE)
    }
}

// =============================================================================
// Ell14Driver
// =============================================================================

/// Driver for Thorlabs Elliptec ELL14 Rotation Mount.
///
/// Implements the Movable capability trait for controlling rotation.
/// Multiple drivers can share a single bus via the shared_ports module.
pub struct Ell14Driver {
    module: Module,
    scale: Scale,
    settle_timeout: Duration,
    /// Device identity and calibration (read once)
    pub info: Feat<Ell14Info>,
    /// Rotation angle (degrees)
    pub position: Feat<f64>,
    /// Motor status description
    pub status: Feat<String>,
    feats: FeatSet,
}

#[derive(Debug, Deserialize)]
struct RelativeArgs {
    degrees: f64,
}

impl Ell14Driver {
    /// Default calibration: 143360 pulses / 360 degrees = 398.2222 pulses/degree
    pub const DEFAULT_PULSES_PER_DEGREE: f64 = 398.22222222;

    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(9600),
            TransportOptions::default()
                .with_termination("", b'\n')
                .with_timeout(Duration::from_secs(3))
                // Other modules on the bus may have left replies behind
                .with_drain(true),
        )
    }

    /// Address one module on a (possibly shared) bus transport.
    pub fn on_bus(bus: Arc<MessageTransport>, address: &str) -> Result<Self> {
        check_address(address)?;
        let module = Module {
            bus,
            address: address.to_ascii_uppercase(),
        };

        let info = Feat::<Ell14Info>::new("info")
            .describe("Module identity and motor calibration")
            .read_once()
            .with_reader({
                let m = module.clone();
                move || -> BoxFuture<'static, Result<Ell14Info>> {
                    let m = m.clone();
                    Box::pin(async move {
                        let (code, data) = m.exchange("in").await?;
                        if code != "IN" {
                            return Err(LabError::parse(m.device(), "in", code, "expected IN"));
                        }
                        Ell14Info::parse(&data).ok_or_else(|| {
                            LabError::parse(m.device(), "in", data, "malformed info record")
                        })
                    })
                }
            });

        let scale = Scale {
            override_ppd: None,
            info: info.clone(),
        };

        let position = Self::position_feat(&module, &scale);

        let status = Feat::<String>::new("status")
            .describe("Motor status")
            .with_reader({
                let m = module.clone();
                move || -> BoxFuture<'static, Result<String>> {
                    let m = m.clone();
                    Box::pin(async move {
                        let code = m.status().await?.into_result(&m.device())?;
                        Ok(code.description().to_string())
                    })
                }
            });

        let mut driver = Self {
            module,
            scale,
            settle_timeout: Duration::from_secs(10),
            info,
            position,
            status,
            feats: FeatSet::new(),
        };
        driver.register_feats();
        Ok(driver)
    }

    fn position_feat(module: &Module, scale: &Scale) -> Feat<f64> {
        let (rm, rs) = (module.clone(), scale.clone());
        let (wm, ws) = (module.clone(), scale.clone());
        Feat::<f64>::new("position")
            .describe("Rotation angle")
            .with_unit(units::DEGREE)
            .with_reader(move || -> BoxFuture<'static, Result<f64>> {
                let (m, s) = (rm.clone(), rs.clone());
                Box::pin(async move {
                    let (code, data) = m.exchange("gp").await?;
                    if code != "PO" {
                        return Err(LabError::parse(m.device(), "gp", code, "expected PO"));
                    }
                    Ok(parse_pulses(&m.device(), "gp", &data)? as f64 / s.pulses_per_degree())
                })
            })
            .with_writer(move |deg: f64| -> BoxFuture<'static, Result<()>> {
                let (m, s) = (wm.clone(), ws.clone());
                Box::pin(async move {
                    let pulses = (deg * s.pulses_per_degree()).round() as i32;
                    m.motion(&format!("ma{}", encode_pulses(pulses))).await?;
                    Ok(())
                })
            })
    }

    fn register_feats(&mut self) {
        let mut feats = FeatSet::new();
        feats
            .register(self.info.clone())
            .register(self.position.clone())
            .register(self.status.clone());

        for (name, cmd, description) in [
            ("home", "ho", "Move to the home position"),
            ("stop", "st", "Stop motion"),
        ] {
            let (m, position) = (self.module.clone(), self.position.clone());
            feats.register_action(
                Action::new(name, move |_| {
                    let (m, position) = (m.clone(), position.clone());
                    Box::pin(async move {
                        m.motion(cmd).await?;
                        position.invalidate();
                        Ok(Value::Null)
                    })
                })
                .describe(description),
            );
        }

        let (m, s, position) = (self.module.clone(), self.scale.clone(), self.position.clone());
        feats.register_action(
            Action::new("move_relative", move |args| {
                let (m, s, position) = (m.clone(), s.clone(), position.clone());
                Box::pin(async move {
                    let args: RelativeArgs = Action::args(args)?;
                    move_relative(&m, &s, args.degrees).await?;
                    position.invalidate();
                    Ok(Value::Null)
                })
            })
            .describe("Rotate by `degrees`"),
        );
        self.feats = feats;
    }

    /// Use a fixed calibration instead of the device's `in` record.
    pub fn with_pulses_per_degree(mut self, pulses_per_degree: f64) -> Self {
        self.scale.override_ppd = Some(pulses_per_degree);
        self.position = Self::position_feat(&self.module, &self.scale);
        self.register_feats();
        self
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// Get the device address.
    pub fn address(&self) -> &str {
        &self.module.address
    }

    /// Calibration in effect.
    pub fn pulses_per_degree(&self) -> f64 {
        self.scale.pulses_per_degree()
    }

    /// Home the device to mechanical zero.
    pub async fn home(&self) -> Result<()> {
        self.module.motion("ho").await?;
        self.position.invalidate();
        Ok(())
    }

    /// Get device status, failing on fault codes.
    pub async fn get_status(&self) -> Result<Ell14StatusCode> {
        self.module.status().await?.into_result(&self.module.device())
    }
}

async fn move_relative(m: &Module, s: &Scale, degrees: f64) -> Result<()> {
    let pulses = (degrees * s.pulses_per_degree()).round() as i32;
    m.motion(&format!("mr{}", encode_pulses(pulses))).await?;
    Ok(())
}

#[async_trait]
impl Instrument for Ell14Driver {
    fn name(&self) -> &str {
        self.module.bus.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::Stage)
    }

    /// Read the info record; its pulse count becomes the calibration
    /// unless one was configured.
    #[instrument(skip(self), fields(address = %self.module.address), err)]
    async fn initialize(&self) -> Result<()> {
        let info = self.info.get().await?;
        if info.pulses_per_degree().is_none() && self.scale.override_ppd.is_none() {
            tracing::warn!(
                address = %self.module.address,
                pulses_per_unit = info.pulses_per_unit,
                "Implausible pulses per revolution, using default calibration"
            );
        }
        tracing::info!(
            address = %self.module.address,
            serial = %info.serial,
            pulses_per_degree = self.pulses_per_degree(),
            "Calibrated ELL14 driver"
        );
        Ok(())
    }
}

#[async_trait]
impl Movable for Ell14Driver {
    #[instrument(skip(self), fields(address = %self.module.address), err)]
    async fn move_abs(&self, position_deg: f64) -> Result<()> {
        self.position.set_forced(position_deg).await
    }

    #[instrument(skip(self), fields(address = %self.module.address), err)]
    async fn move_rel(&self, distance_deg: f64) -> Result<()> {
        move_relative(&self.module, &self.scale, distance_deg).await?;
        self.position.invalidate();
        Ok(())
    }

    #[instrument(skip(self), fields(address = %self.module.address), err)]
    async fn position(&self) -> Result<f64> {
        self.position.refresh().await
    }

    /// Settled once three consecutive status polls report idle.
    #[instrument(skip(self), fields(address = %self.module.address), err)]
    async fn wait_settled(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settle_timeout;
        let mut consecutive_settled = 0;

        loop {
            if tokio::time::Instant::now() > deadline {
                tracing::warn!(
                    address = %self.module.address,
                    consecutive_settled,
                    "ELL14 wait_settled timed out"
                );
                return Err(LabError::Timeout {
                    device: self.module.device(),
                    command: "gs".into(),
                });
            }

            match self.get_status().await {
                Ok(status) if status.is_ok() => {
                    consecutive_settled += 1;
                    if consecutive_settled >= 3 {
                        return Ok(());
                    }
                }
                Ok(_) => consecutive_settled = 0,
                Err(e @ LabError::Status { .. }) => return Err(e),
                // The module may not answer while the motor runs
                Err(e) => {
                    tracing::debug!(address = %self.module.address, error = %e, "ELL14 status poll failed");
                }
            }

            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn stop(&self) -> Result<()> {
        self.module.motion("st").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::{MockInstrument, MockLog};

    pub(crate) const INFO: &str = "2IN0E1140051720231701016800023000";

    pub(crate) fn mount(mock: MockInstrument) -> (Ell14Driver, MockLog) {
        // The mock frames commands on line ends; the bus itself uses none
        let options = Ell14Driver::connection_defaults()
            .options
            .with_termination("\r", b'\n');
        let (bus, log) = mock.spawn_transport("ELL14 bus", options);
        (Ell14Driver::on_bus(Arc::new(bus), "2").unwrap(), log)
    }

    #[test]
    fn test_status_code_parsing() {
        assert!(Ell14StatusCode::from_hex("00").is_ok());
        assert_eq!(
            Ell14StatusCode::from_hex("02"),
            Ell14StatusCode::MechanicalTimeout
        );
        assert_eq!(Ell14StatusCode::from_hex("FF"), Ell14StatusCode::Unknown);
        assert!(Ell14StatusCode::Busy.into_result("m").is_ok());
        assert!(matches!(
            Ell14StatusCode::MotorError.into_result("m"),
            Err(LabError::Status { .. })
        ));
    }

    #[test]
    fn test_info_parsing() {
        let info = Ell14Info::parse("0E1140051720231701016800023000").unwrap();
        assert_eq!(info.model, 14);
        assert_eq!(info.serial, "11400517");
        assert_eq!(info.year, 2023);
        assert_eq!(info.travel, 360);
        assert_eq!(info.pulses_per_unit, 143360);
        let ppd = info.pulses_per_degree().unwrap();
        assert!((ppd - Ell14Driver::DEFAULT_PULSES_PER_DEGREE).abs() < 1e-6);

        assert!(Ell14Info::parse("0E11400517").is_none());
    }

    #[test]
    fn test_pulse_encoding() {
        assert_eq!(encode_pulses(0x8C00), "00008C00");
        assert_eq!(encode_pulses(-1), "FFFFFFFF");
        assert_eq!(parse_pulses("m", "gp", "FFFFFFFF").unwrap(), -1);
    }

    #[test]
    fn test_factory_driver_type() {
        let factory = Ell14Factory;
        assert_eq!(factory.driver_type(), "ell14");
        assert_eq!(factory.name(), "Thorlabs ELL14 Rotation Mount");
        assert!(factory.capabilities().contains(&Capability::Movable));
    }

    #[test]
    fn test_factory_validate_config() {
        let factory = Ell14Factory;

        let valid_config = toml::Value::Table(toml::toml! {
            address = "2"
            [connection]
            type = "serial"
            port = "/dev/ttyUSB1"
        });
        assert!(factory.validate(&valid_config).is_ok());

        let bad_address = toml::Value::Table(toml::toml! {
            address = "G"
            [connection]
            type = "serial"
            port = "/dev/ttyUSB1"
        });
        assert!(factory.validate(&bad_address).is_err());

        let missing_connection = toml::Value::Table(toml::toml! {
            address = "2"
        });
        assert!(factory.validate(&missing_connection).is_err());
    }

    #[tokio::test]
    async fn initialize_reads_calibration_once() {
        let (driver, log) = mount(MockInstrument::new().on("2in", INFO));

        driver.initialize().await.unwrap();
        driver.initialize().await.unwrap();

        assert_eq!(log.count("2in"), 1);
        assert!((driver.pulses_per_degree() - 398.222).abs() < 1e-3);
    }

    #[tokio::test]
    async fn position_converts_pulses_to_degrees() {
        // 0x8C00 = 35840 pulses = 90 degrees
        let (driver, _log) = mount(MockInstrument::new().on("2gp", "2PO00008C00"));
        let deg = driver.position().await.unwrap();
        assert!((deg - 90.0).abs() < 1e-3);
    }

    #[tokio::test]
    async fn move_abs_sends_hex_pulses() {
        let (driver, log) = mount(MockInstrument::new().on("2ma00008C00", "2PO00008C00"));
        driver.move_abs(90.0).await.unwrap();
        assert_eq!(log.commands(), vec!["2ma00008C00"]);
    }

    #[tokio::test]
    async fn move_relative_uses_twos_complement() {
        let (driver, log) = mount(MockInstrument::new().on("2mrFFFF7400", "2PO00000000"));
        driver
            .feats()
            .call("move_relative", serde_json::json!({ "degrees": -90.0 }))
            .await
            .unwrap();
        assert_eq!(log.commands(), vec!["2mrFFFF7400"]);
    }

    #[tokio::test]
    async fn fault_status_is_a_status_error() {
        let (driver, _log) = mount(MockInstrument::new().on("2ho", "2GS0B"));
        match driver.home().await {
            Err(LabError::Status { flags, .. }) => assert_eq!(flags, vec!["Motor error"]),
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn replies_from_other_modules_are_rejected() {
        let (driver, _log) = mount(MockInstrument::new().on("2gp", "3PO00000000"));
        assert!(matches!(
            driver.position().await,
            Err(LabError::Parse { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_settled_needs_three_idle_polls() {
        let (driver, log) = mount(
            MockInstrument::new()
                .on("2gs", "2GS09")
                .on("2gs", "2GS00"),
        );
        driver.wait_settled().await.unwrap();
        assert_eq!(log.count("2gs"), 4);
    }

    #[tokio::test]
    async fn configured_calibration_overrides_device() {
        let (driver, log) = mount(MockInstrument::new().on("2ma00000064", "2PO00000064"));
        let driver = driver.with_pulses_per_degree(100.0);
        driver.move_abs(1.0).await.unwrap();
        assert_eq!(log.commands(), vec!["2ma00000064"]);
    }

    #[tokio::test]
    async fn repeated_move_abs_resends_target() {
        let (driver, log) = mount(MockInstrument::new().on("2ma00008C00", "2PO00008C00"));
        driver.move_abs(90.0).await.unwrap();
        driver.move_abs(90.0).await.unwrap();
        assert_eq!(log.count("2ma00008C00"), 2);
    }
}
