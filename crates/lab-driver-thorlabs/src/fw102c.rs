//! Thorlabs FW102C Motorized Filter Wheel Driver
//!
//! Reference: FW102C/FW212C User Manual, "Command Line Interface"
//!
//! Protocol Overview:
//! - Format: `name=value` to set, `name?` to query
//! - Baud: 115200, 8N1, no flow control
//! - Terminator: CR (\r) both ways
//! - The wheel echoes every command and prints a `> ` prompt once done
//! - Positions are 1-based; `pcount?` reports 6 or 12 slots
//!
//! A `pos=` command returns its prompt only when the wheel has stopped, so
//! position writes are effectively synchronous.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory, DeviceComponents,
    DriverFactory, Feat, FeatSet, Instrument, LabError, Limits, MessageTransport, Movable,
    Result, SerialSettings, TransportOptions, ValueMap,
};
use serde::Deserialize;
use tracing::instrument;

/// Largest wheel the controller drives.
const MAX_SLOTS: u8 = 12;

/// Configuration for the FW102C driver
#[derive(Debug, Clone, Deserialize)]
pub struct Fw102cConfig {
    pub connection: ConnectionConfig,
    /// Filter names by slot, starting at slot 1
    #[serde(default)]
    pub filters: Vec<String>,
}

pub struct Fw102cFactory;

static FW102C_CAPABILITIES: &[Capability] = &[Capability::Movable];

impl DriverFactory for Fw102cFactory {
    fn driver_type(&self) -> &'static str {
        "fw102c"
    }

    fn name(&self) -> &'static str {
        "Thorlabs FW102C Filter Wheel"
    }

    fn capabilities(&self) -> &'static [Capability] {
        FW102C_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Fw102cConfig = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        if cfg.filters.len() > MAX_SLOTS as usize {
            return Err(anyhow!(
                "{} filter names given, the wheel has at most {MAX_SLOTS} slots",
                cfg.filters.len()
            ));
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Fw102cConfig = lab_core::parse_config("fw102c", &config)?;
            let transport = cfg
                .connection
                .open("FW102C", &Fw102cDriver::connection_defaults())
                .await
                .context("Failed to open FW102C connection")?;
            let driver = Arc::new(Fw102cDriver::with_transport(transport).with_filters(cfg.filters));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_movable(driver))
        })
    }
}

/// Driver for the Thorlabs FW102C six/twelve position filter wheel.
pub struct Fw102cDriver {
    transport: Arc<MessageTransport>,
    /// Number of slots (read once)
    pub position_count: Feat<u8>,
    /// Current slot, 1-based
    pub position: Feat<u8>,
    /// Move speed: normal, high
    pub speed: Feat<String>,
    /// Position sensors while idle: off, on
    pub sensors: Feat<String>,
    /// External trigger: input, output
    pub trigger_mode: Feat<String>,
    /// Filter in the beam, by configured name
    pub filter: Feat<String>,
    feats: FeatSet,
}

fn choice(
    t: &Arc<MessageTransport>,
    name: &'static str,
    command: &'static str,
    map: ValueMap<String>,
) -> Feat<String> {
    Feat::<String>::new(name)
        .with_values(&map)
        .with_reader(bind::reader(t, format!("{command}?"), {
            let map = map.clone();
            move |reply: &str| map.from_wire(name, reply)
        }))
        .with_writer(bind::writer(t, move |v: &String| {
            Ok(format!("{command}={}", map.to_wire(name, v)?))
        }))
}

impl Fw102cDriver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(115_200),
            TransportOptions::default()
                .with_termination("\r", b'\r')
                .with_echo(true)
                .with_prompt(">")
                // A full 12-slot turn at normal speed
                .with_timeout(Duration::from_secs(5))
                .with_drain(true),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);

        let position_count = Feat::<u8>::new("position_count")
            .describe("Number of filter slots")
            .read_once()
            .with_reader(bind::reader(&t, "pcount?", bind::number::<u8>));

        let position = Feat::<u8>::new("position")
            .describe("Slot in the beam, starting at 1")
            .with_limits(Limits::new(1.0, MAX_SLOTS as f64).with_step(1.0))
            .with_validator({
                let count = position_count.clone();
                move |pos: &u8| match count.cached() {
                    Some(n) if *pos > n => Err(LabError::OutOfRange {
                        feat: "position".into(),
                        value: *pos as f64,
                        min: 1.0,
                        max: n as f64,
                    }),
                    _ => Ok(()),
                }
            })
            .with_reader(bind::reader(&t, "pos?", bind::number::<u8>))
            .with_writer(bind::writer(&t, |pos: &u8| Ok(format!("pos={pos}"))));

        let speed = choice(
            &t,
            "speed",
            "speed",
            ValueMap::strings([("normal", "0"), ("high", "1")]),
        );
        let sensors = choice(
            &t,
            "sensors",
            "sensors",
            ValueMap::strings([("off", "0"), ("on", "1")]),
        );
        let trigger_mode = choice(
            &t,
            "trigger_mode",
            "trig",
            ValueMap::strings([("input", "0"), ("output", "1")]),
        );

        let mut driver = Self {
            transport: t,
            position_count,
            position,
            speed,
            sensors,
            trigger_mode,
            filter: Feat::new("filter"),
            feats: FeatSet::new(),
        };
        driver.set_filter_names(Vec::new());
        driver
    }

    /// Name the filters mounted in slots 1, 2, ...
    pub fn with_filters(mut self, names: Vec<String>) -> Self {
        self.set_filter_names(names);
        self
    }

    fn set_filter_names(&mut self, names: Vec<String>) {
        let map = ValueMap::new(
            names
                .into_iter()
                .enumerate()
                .map(|(i, name)| (name, (i + 1).to_string())),
        );
        let (read_pos, write_pos) = (self.position.clone(), self.position.clone());
        let read_map = map.clone();
        let write_map = map.clone();

        self.filter = Feat::<String>::new("filter")
            .describe("Filter in the beam, by name")
            .with_values(&map)
            .with_reader(move || -> BoxFuture<'static, Result<String>> {
                let (pos, map) = (read_pos.clone(), read_map.clone());
                Box::pin(async move {
                    let slot = pos.refresh().await?;
                    map.from_wire("filter", &slot.to_string())
                })
            })
            .with_writer(move |name: String| -> BoxFuture<'static, Result<()>> {
                let (pos, map) = (write_pos.clone(), write_map.clone());
                Box::pin(async move {
                    let slot = bind::number::<u8>(map.to_wire("filter", &name)?)?;
                    pos.set(slot).await
                })
            });

        let mut feats = FeatSet::new();
        feats
            .register(self.position_count.clone())
            .register(self.position.clone())
            .register(self.speed.clone())
            .register(self.sensors.clone())
            .register(self.trigger_mode.clone())
            .register(self.filter.clone());
        self.feats = feats;
    }

    async fn slot_count(&self) -> Result<u8> {
        self.position_count.get().await
    }
}

#[async_trait]
impl Instrument for Fw102cDriver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::FilterWheel)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        let idn = self.transport.query("*idn?").await?;
        if !idn.to_ascii_uppercase().contains("FW102C") {
            return Err(LabError::instrument(
                self.name(),
                format!("unexpected *idn? reply {idn:?}"),
            ));
        }
        let slots = self.slot_count().await?;
        tracing::info!(device = %self.name(), idn = %idn, slots, "FW102C ready");
        Ok(())
    }
}

#[async_trait]
impl Movable for Fw102cDriver {
    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn move_abs(&self, position: f64) -> Result<()> {
        let count = self.slot_count().await?;
        if position.fract() != 0.0 || position < 1.0 || position > count as f64 {
            return Err(LabError::OutOfRange {
                feat: "position".into(),
                value: position,
                min: 1.0,
                max: count as f64,
            });
        }
        self.position.set_forced(position as u8).await
    }

    /// Steps around the wheel, wrapping past the last slot.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn move_rel(&self, distance: f64) -> Result<()> {
        let count = self.slot_count().await? as i64;
        let current = self.position.refresh().await? as i64;
        let target = (current - 1 + distance.round() as i64).rem_euclid(count) + 1;
        self.position.set_forced(target as u8).await
    }

    async fn position(&self) -> Result<f64> {
        Ok(self.position.refresh().await? as f64)
    }

    /// `pos=` only returns its prompt once the wheel stopped; a query
    /// confirms the controller is responsive again.
    async fn wait_settled(&self) -> Result<()> {
        self.position.refresh().await.map(|_| ())
    }
}
