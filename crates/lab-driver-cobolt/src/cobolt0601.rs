//! Cobolt 06-01 Series Laser Driver
//!
//! Reference: Cobolt 06-01 Series Owner's Manual, "Communication commands"
//!
//! Protocol Overview:
//! - Serial: 115200 baud, 8N1, no flow control
//! - Commands end with CR; replies end with CRLF
//! - Queries answer with a bare value (`pa?` → `0.0498`)
//! - Setters answer `OK`; anything unrecognised answers
//!   `Syntax error: illegal command`
//! - Power is in W, current in mA
//!
//! Emission additionally requires the key switch to be on and the interlock
//! closed. With autostart enabled `l1` runs the warm-up sequence.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, units, Action, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DriverFactory, EmissionControl, Feat, FeatSet, Instrument, LabError,
    Limits, MessageTransport, Readable, Result, SerialSettings, TransportOptions, ValueMap,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

#[derive(Debug, Clone, Deserialize)]
pub struct Cobolt0601Config {
    pub connection: ConnectionConfig,
    /// Maximum output power of the head (W); bounds `power_setpoint`
    #[serde(default = "default_max_power")]
    pub max_power_w: f64,
}

fn default_max_power() -> f64 {
    0.1
}

pub struct Cobolt0601Factory;

static COBOLT_CAPABILITIES: &[Capability] = &[Capability::EmissionControl, Capability::Readable];

impl DriverFactory for Cobolt0601Factory {
    fn driver_type(&self) -> &'static str {
        "cobolt0601"
    }

    fn name(&self) -> &'static str {
        "Cobolt 06-01 Laser"
    }

    fn capabilities(&self) -> &'static [Capability] {
        COBOLT_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Cobolt0601Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        if !(cfg.max_power_w > 0.0 && cfg.max_power_w <= 2.0) {
            anyhow::bail!("max_power_w {} W is not a plausible 06-01 rating", cfg.max_power_w);
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Cobolt0601Config = lab_core::parse_config("cobolt0601", &config)?;
            let transport = cfg
                .connection
                .open("Cobolt", &Cobolt0601Driver::connection_defaults())
                .await
                .context("Failed to open Cobolt connection")?;
            let driver = Arc::new(Cobolt0601Driver::new(transport, cfg.max_power_w));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_emission_control(driver.clone())
                .with_readable(driver))
        })
    }
}

/// Send a setter and require the `OK` acknowledgement.
async fn command(t: &MessageTransport, cmd: &str) -> Result<()> {
    let reply = t.query(cmd).await?;
    if reply.eq_ignore_ascii_case("OK") {
        Ok(())
    } else if reply.to_ascii_lowercase().starts_with("syntax error") {
        Err(LabError::instrument(t.name(), format!("{cmd:?}: {reply}")))
    } else {
        Err(LabError::parse(t.name(), cmd, reply, "expected OK"))
    }
}

fn ok_writer<T, F>(
    t: &Arc<MessageTransport>,
    format: F,
) -> impl Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static
where
    T: Send + 'static,
    F: Fn(&T) -> Result<String> + Send + Sync + 'static,
{
    let t = Arc::clone(t);
    let format = Arc::new(format);
    move |value: T| {
        let t = Arc::clone(&t);
        let format = Arc::clone(&format);
        Box::pin(async move {
            let cmd = format(&value)?;
            command(&t, &cmd).await
        })
    }
}

fn ok_action(t: &Arc<MessageTransport>, name: &str, cmd: &'static str, description: &str) -> Action {
    let t = Arc::clone(t);
    Action::new(name, move |_| {
        let t = Arc::clone(&t);
        Box::pin(async move {
            command(&t, cmd).await?;
            Ok(Value::Null)
        })
    })
    .describe(description)
}

/// Driver for Cobolt 06-01 lasers.
pub struct Cobolt0601Driver {
    transport: Arc<MessageTransport>,
    pub emission: Feat<bool>,
    /// Output power setpoint (W)
    pub power_setpoint: Feat<f64>,
    /// Measured output power (W)
    pub power: Feat<f64>,
    /// Drive current setpoint for constant current mode (mA)
    pub current_setpoint: Feat<f64>,
    /// Measured drive current (mA)
    pub current: Feat<f64>,
    pub mode: Feat<String>,
    pub autostart: Feat<bool>,
    pub interlock_open: Feat<bool>,
    /// none, temperature, interlock, constant_power_timeout
    pub fault: Feat<String>,
    pub serial_number: Feat<String>,
    /// Operating hours of the head
    pub hours: Feat<f64>,
    feats: FeatSet,
}

impl Cobolt0601Driver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(115_200),
            TransportOptions::default()
                .with_termination("\r", b'\n')
                .with_timeout(Duration::from_secs(1)),
        )
    }

    pub fn new(transport: MessageTransport, max_power_w: f64) -> Self {
        let t = Arc::new(transport);

        let emission = Feat::<bool>::new("emission")
            .describe("Laser emission")
            .with_reader(bind::reader(&t, "l?", bind::flag))
            .with_writer(ok_writer(&t, |on: &bool| {
                Ok(if *on { "l1" } else { "l0" }.to_string())
            }));

        let power_setpoint = Feat::<f64>::new("power_setpoint")
            .with_unit(units::WATT)
            .with_limits(Limits::new(0.0, max_power_w))
            .with_reader(bind::reader(&t, "p?", bind::number::<f64>))
            .with_writer(ok_writer(&t, |w: &f64| Ok(format!("p {w:.4}"))));

        let power = Feat::<f64>::new("power")
            .with_unit(units::WATT)
            .with_reader(bind::reader(&t, "pa?", bind::number::<f64>));

        let current_setpoint = Feat::<f64>::new("current_setpoint")
            .with_unit(units::MILLIAMPERE)
            .with_limits(Limits::new(0.0, 3000.0))
            .with_reader(bind::reader(&t, "glc?", bind::number::<f64>))
            .with_writer(ok_writer(&t, |ma: &f64| Ok(format!("slc {ma:.1}"))));

        let current = Feat::<f64>::new("current")
            .with_unit(units::MILLIAMPERE)
            .with_reader(bind::reader(&t, "i?", bind::number::<f64>));

        let modes = ValueMap::strings([
            ("off", "0"),
            ("waiting_for_key", "1"),
            ("continuous", "2"),
            ("on_off_modulation", "3"),
            ("modulation", "4"),
            ("fault", "5"),
            ("aborted", "6"),
        ]);
        let mode = Feat::<String>::new("mode")
            .describe("Operating state")
            .with_values(&modes)
            .with_reader(bind::reader(&t, "gom?", move |r: &str| {
                modes.from_wire("mode", r)
            }));

        let autostart = Feat::<bool>::new("autostart")
            .with_reader(bind::reader(&t, "@cobas?", bind::flag))
            .with_writer(ok_writer(&t, |on: &bool| {
                Ok(format!("@cobas {}", u8::from(*on)))
            }));

        let interlock_open = Feat::<bool>::new("interlock_open")
            .with_reader(bind::reader(&t, "ilk?", bind::flag));

        let faults = ValueMap::strings([
            ("none", "0"),
            ("temperature", "1"),
            ("interlock", "3"),
            ("constant_power_timeout", "4"),
        ]);
        let fault = Feat::<String>::new("fault")
            .with_values(&faults)
            .with_reader(bind::reader(&t, "f?", move |r: &str| {
                faults.from_wire("fault", r)
            }));

        let serial_number = Feat::<String>::new("serial_number")
            .read_once()
            .with_reader(bind::reader(&t, "sn?", bind::text));

        let hours = Feat::<f64>::new("hours")
            .with_unit(units::HOUR)
            .with_reader(bind::reader(&t, "hrs?", bind::number::<f64>));

        let mut feats = FeatSet::new();
        feats
            .register(emission.clone())
            .register(power_setpoint.clone())
            .register(power.clone())
            .register(current_setpoint.clone())
            .register(current.clone())
            .register(mode.clone())
            .register(autostart.clone())
            .register(interlock_open.clone())
            .register(fault.clone())
            .register(serial_number.clone())
            .register(hours.clone());
        feats
            .register_action(ok_action(&t, "constant_power", "cp", "Enter constant power mode"))
            .register_action(ok_action(&t, "constant_current", "ci", "Enter constant current mode"))
            .register_action(ok_action(&t, "clear_fault", "cf", "Clear the latched fault"));

        Self {
            transport: t,
            emission,
            power_setpoint,
            power,
            current_setpoint,
            current,
            mode,
            autostart,
            interlock_open,
            fault,
            serial_number,
            hours,
            feats,
        }
    }
}

#[async_trait]
impl Instrument for Cobolt0601Driver {
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
        let serial = self.serial_number.get().await?;
        let hours = self.hours.get().await?;
        if self.interlock_open.get().await? {
            tracing::warn!(device = %self.name(), "interlock open, emission is inhibited");
        }
        tracing::info!(device = %self.name(), serial = %serial, hours, "Cobolt ready");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn finalize(&self) -> Result<()> {
        self.emission.set_forced(false).await
    }
}

#[async_trait]
impl EmissionControl for Cobolt0601Driver {
    async fn enable_emission(&self) -> Result<()> {
        if self.interlock_open.refresh().await? {
            return Err(LabError::Status {
                device: self.name().to_string(),
                flags: vec!["interlock open".into()],
            });
        }
        self.emission.set_forced(true).await
    }

    async fn disable_emission(&self) -> Result<()> {
        self.emission.set_forced(false).await
    }

    async fn is_emission_enabled(&self) -> Result<bool> {
        self.emission.refresh().await
    }
}

#[async_trait]
impl Readable for Cobolt0601Driver {
    async fn read(&self) -> Result<f64> {
        self.power.refresh().await
    }

    fn unit(&self) -> Option<&'static str> {
        Some("W")
    }
}
