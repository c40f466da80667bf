//! Coherent Innova 300C Ion Laser Driver
//!
//! Reference: Innova 300C Series Ion Laser Operator's Manual, "RS-232
//! Interface"
//!
//! Protocol Overview:
//! - Serial: 1200 baud, 8N1, CRLF in both directions
//! - Setters are `NAME=value`, queries `PRINT NAME`
//! - The controller echoes input and prints a prompt by default; both are
//!   turned off at initialize (`ECHO=0`, `PROMPT=0`)
//! - Optical power in W, tube current in A
//!
//! `MODE` selects the regulation loop by number. The numbering differs
//! between controller firmware revisions, so it is exposed as the raw value.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, units, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DriverFactory, EmissionControl, Feat, FeatSet, Instrument, Limits,
    MessageTransport, Readable, Result, SerialSettings, TransportOptions, ValueMap,
};
use serde::Deserialize;
use tracing::instrument;

#[derive(Debug, Clone, Deserialize)]
pub struct Innova300cConfig {
    pub connection: ConnectionConfig,
}

pub struct Innova300cFactory;

static INNOVA_CAPABILITIES: &[Capability] = &[Capability::EmissionControl, Capability::Readable];

impl DriverFactory for Innova300cFactory {
    fn driver_type(&self) -> &'static str {
        "innova300c"
    }

    fn name(&self) -> &'static str {
        "Coherent Innova 300C Ion Laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        INNOVA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Innova300cConfig = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Innova300cConfig = lab_core::parse_config("innova300c", &config)?;
            let transport = cfg
                .connection
                .open("Innova", &Innova300cDriver::connection_defaults())
                .await
                .context("Failed to open Innova connection")?;
            let driver = Arc::new(Innova300cDriver::with_transport(transport));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_emission_control(driver.clone())
                .with_readable(driver))
        })
    }
}

/// `PRINT LASER` answers 0 (off), 1 (on) or 2 (starting).
fn parse_laser_state(reply: &str) -> Result<bool> {
    match reply.trim() {
        "0" => Ok(false),
        "1" | "2" => Ok(true),
        other => Err(lab_core::LabError::parse(
            "Innova",
            "PRINT LASER",
            other,
            "expected 0, 1 or 2",
        )),
    }
}

pub struct Innova300cDriver {
    transport: Arc<MessageTransport>,
    /// Output power (W)
    pub light: Feat<f64>,
    /// Light regulation setpoint (W)
    pub light_setpoint: Feat<f64>,
    /// Tube current (A)
    pub current: Feat<f64>,
    /// Current regulation setpoint (A)
    pub current_setpoint: Feat<f64>,
    /// Regulation mode, raw controller value
    pub mode: Feat<u8>,
    pub laser_on: Feat<bool>,
    /// Accumulated tube hours (read once)
    pub tube_time: Feat<f64>,
    pub water_temperature: Feat<f64>,
    /// 0 when no fault is latched
    pub fault_code: Feat<u32>,
    feats: FeatSet,
}

impl Innova300cDriver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(1200),
            TransportOptions::default()
                .with_termination("\r\n", b'\n')
                .with_timeout(Duration::from_secs(3))
                .with_drain(true),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);

        let light = Feat::<f64>::new("light")
            .describe("Output power")
            .with_unit(units::WATT)
            .with_reader(bind::reader(&t, "PRINT LIGHT", bind::number::<f64>));

        let light_setpoint = Feat::<f64>::new("light_setpoint")
            .with_unit(units::WATT)
            .with_limits(Limits::new(0.0, 10.0))
            .with_reader(bind::reader(&t, "PRINT LIGHT SETPOINT", bind::number::<f64>))
            .with_writer(bind::writer(&t, |w: &f64| Ok(format!("LIGHT={w:.3}"))));

        let current = Feat::<f64>::new("current")
            .describe("Tube current")
            .with_unit(units::AMPERE)
            .with_reader(bind::reader(&t, "PRINT CURRENT", bind::number::<f64>));

        let current_setpoint = Feat::<f64>::new("current_setpoint")
            .with_unit(units::AMPERE)
            .with_limits(Limits::new(0.0, 70.0))
            .with_reader(bind::reader(&t, "PRINT CURRENT SETPOINT", bind::number::<f64>))
            .with_writer(bind::writer(&t, |a: &f64| Ok(format!("CURRENT={a:.1}"))));

        let modes = ValueMap::new([(0u8, "0"), (1, "1"), (2, "2")]);
        let mode = Feat::<u8>::new("mode")
            .describe("Regulation mode (controller numbering)")
            .with_values(&modes)
            .with_reader(bind::reader(&t, "PRINT MODE", bind::number::<u8>))
            .with_writer(bind::writer(&t, move |m: &u8| {
                Ok(format!("MODE={}", modes.to_wire("mode", m)?))
            }));

        let laser_on = Feat::<bool>::new("laser_on")
            .with_reader(bind::reader(&t, "PRINT LASER", parse_laser_state))
            .with_writer(bind::writer(&t, |on: &bool| {
                Ok(format!("LASER={}", u8::from(*on)))
            }));

        let tube_time = Feat::<f64>::new("tube_time")
            .with_unit(units::HOUR)
            .read_once()
            .with_reader(bind::reader(&t, "PRINT TUBE TIME", bind::number::<f64>));

        let water_temperature = Feat::<f64>::new("water_temperature")
            .with_unit(units::CELSIUS)
            .with_reader(bind::reader(&t, "PRINT WATER TEMPERATURE", bind::number::<f64>));

        let fault_code = Feat::<u32>::new("fault_code")
            .with_reader(bind::reader(&t, "PRINT FAULT CODE", bind::number::<u32>));

        let mut feats = FeatSet::new();
        feats
            .register(light.clone())
            .register(light_setpoint.clone())
            .register(current.clone())
            .register(current_setpoint.clone())
            .register(mode.clone())
            .register(laser_on.clone())
            .register(tube_time.clone())
            .register(water_temperature.clone())
            .register(fault_code.clone());

        Self {
            transport: t,
            light,
            light_setpoint,
            current,
            current_setpoint,
            mode,
            laser_on,
            tube_time,
            water_temperature,
            fault_code,
            feats,
        }
    }
}

#[async_trait]
impl Instrument for Innova300cDriver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::Laser)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.transport.write("ECHO=0").await?;
        self.transport.write("PROMPT=0").await?;
        let discarded = self.transport.drain().await;
        if discarded > 0 {
            tracing::debug!(device = %self.name(), discarded, "dropped echo/prompt bytes");
        }
        let hours = self.tube_time.get().await?;
        let fault = self.fault_code.get().await?;
        if fault != 0 {
            tracing::warn!(device = %self.name(), fault, "controller reports a fault");
        }
        tracing::info!(device = %self.name(), tube_hours = hours, "Innova ready");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn finalize(&self) -> Result<()> {
        self.laser_on.set_forced(false).await
    }
}

#[async_trait]
impl EmissionControl for Innova300cDriver {
    async fn enable_emission(&self) -> Result<()> {
        self.laser_on.set_forced(true).await
    }

    async fn disable_emission(&self) -> Result<()> {
        self.laser_on.set_forced(false).await
    }

    async fn is_emission_enabled(&self) -> Result<bool> {
        self.laser_on.refresh().await
    }
}

#[async_trait]
impl Readable for Innova300cDriver {
    async fn read(&self) -> Result<f64> {
        self.light.refresh().await
    }

    fn unit(&self) -> Option<&'static str> {
        Some("W")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::{MockInstrument, MockLog};

    fn laser(mock: MockInstrument) -> (Innova300cDriver, MockLog) {
        let (t, log) = mock
            .on("PRINT TUBE TIME", "1234.5")
            .on("PRINT FAULT CODE", "0")
            .spawn_transport("Innova", Innova300cDriver::connection_defaults().options);
        (Innova300cDriver::with_transport(t), log)
    }

    #[tokio::test]
    async fn initialize_disables_echo_and_prompt() {
        let (laser, log) = laser(MockInstrument::new());
        laser.initialize().await.unwrap();
        assert_eq!(
            log.commands(),
            vec!["ECHO=0", "PROMPT=0", "PRINT TUBE TIME", "PRINT FAULT CODE"]
        );
        assert_eq!(laser.tube_time.cached(), Some(1234.5));
    }

    #[tokio::test]
    async fn setpoints_format_and_range() {
        let (laser, log) = laser(MockInstrument::new());
        laser.light_setpoint.set(1.5).await.unwrap();
        laser.current_setpoint.set(35.0).await.unwrap();
        assert!(laser.light_setpoint.set(12.0).await.is_err());
        assert_eq!(log.commands(), vec!["LIGHT=1.500", "CURRENT=35.0"]);
    }

    #[tokio::test]
    async fn mode_is_raw_value() {
        let (laser, log) = laser(MockInstrument::new().on("PRINT MODE", "1"));
        assert_eq!(laser.mode.get().await.unwrap(), 1);
        laser.mode.set(0).await.unwrap();
        assert!(laser.mode.set(7).await.is_err());
        assert_eq!(log.commands(), vec!["PRINT MODE", "MODE=0"]);
    }

    #[tokio::test]
    async fn emission_and_readout() {
        let (laser, log) = laser(
            MockInstrument::new()
                .on("PRINT LASER", "2")
                .on("PRINT LIGHT", "4.02"),
        );
        laser.enable_emission().await.unwrap();
        assert!(laser.is_emission_enabled().await.unwrap());
        assert!((laser.read().await.unwrap() - 4.02).abs() < 1e-9);
        laser.finalize().await.unwrap();
        assert_eq!(
            log.commands(),
            vec!["LASER=1", "PRINT LASER", "PRINT LIGHT", "LASER=0"]
        );
    }

    #[test]
    fn laser_state_rejects_garbage() {
        assert!(parse_laser_state("9").is_err());
        assert!(!parse_laser_state("0").unwrap());
    }

    #[tokio::test]
    async fn repeated_disable_resends_off_command() {
        let (laser, log) = laser(MockInstrument::new());
        laser.disable_emission().await.unwrap();
        laser.disable_emission().await.unwrap();
        assert_eq!(log.commands(), vec!["LASER=0", "LASER=0"]);
    }
}
