//! Sutter Lambda 10-3 Filter Changer Driver
//!
//! Reference: Lambda 10-3 Operation Manual, "Remote Control: Serial
//! Commands"
//!
//! Protocol Overview:
//! - Serial (USB virtual port): 128000 baud, 8N1
//! - Binary: one byte per command, no terminator
//! - The controller echoes each command byte and sends CR (0x0D) once the
//!   command has completed (wheel settled, shutter moved)
//! - Move: `wheel << 7 | speed << 4 | filter` (wheel A = 0, B = 1; speed
//!   0..7, 7 slowest; filter 0..9)
//! - Shutters: open A `0xAA`, close A `0xAC`, open B `0xBA`, close B `0xBC`
//! - `0xEE` puts the controller on line, `0xEF` returns it to local control
//!
//! The controller cannot report wheel positions, so `position` and
//! `shutter_open` return the last commanded value.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory, DeviceComponents, DictFeat,
    DriverFactory, FeatSet, Instrument, LabError, Limits, MessageTransport, Result,
    SerialSettings, ShutterControl, TransportOptions,
};
use serde::Deserialize;
use tracing::instrument;

const COMPLETE: u8 = 0x0D;
const ONLINE: u8 = 0xEE;
const LOCAL: u8 = 0xEF;

pub const WHEELS: [&str; 2] = ["A", "B"];

/// Speed used until one is set: 3 suits most 25 mm filter sets.
pub const DEFAULT_SPEED: u8 = 3;

#[derive(Debug, Clone, Deserialize)]
pub struct Lambda103Config {
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub speed: Option<u8>,
}

pub struct Lambda103Factory;

static LAMBDA_CAPABILITIES: &[Capability] = &[Capability::ShutterControl];

impl DriverFactory for Lambda103Factory {
    fn driver_type(&self) -> &'static str {
        "lambda10_3"
    }

    fn name(&self) -> &'static str {
        "Sutter Lambda 10-3 Filter Changer"
    }

    fn capabilities(&self) -> &'static [Capability] {
        LAMBDA_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Lambda103Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        if let Some(speed) = cfg.speed {
            if speed > 7 {
                anyhow::bail!("speed {speed} is outside 0..=7");
            }
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Lambda103Config = lab_core::parse_config("lambda10_3", &config)?;
            let transport = cfg
                .connection
                .open("Lambda 10-3", &Lambda103Driver::connection_defaults())
                .await
                .context("Failed to open Lambda 10-3 connection")?;
            let driver = Arc::new(
                Lambda103Driver::with_transport(transport)
                    .with_default_speed(cfg.speed.unwrap_or(DEFAULT_SPEED)),
            );
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_shutter_control(driver))
        })
    }
}

fn wheel_bit(wheel: &str) -> u8 {
    u8::from(wheel == "B")
}

pub fn move_byte(wheel: &str, speed: u8, filter: u8) -> u8 {
    wheel_bit(wheel) << 7 | (speed & 0x07) << 4 | (filter & 0x0F)
}

pub fn shutter_byte(shutter: &str, open: bool) -> u8 {
    match (shutter == "B", open) {
        (false, true) => 0xAA,
        (false, false) => 0xAC,
        (true, true) => 0xBA,
        (true, false) => 0xBC,
    }
}

/// Send one command byte and wait for its echo and the completion CR.
async fn exchange(t: &MessageTransport, byte: u8) -> Result<()> {
    let timeout = t.options().timeout;
    // The completion CR is stripped by the read
    let reply = t.query_raw(&[byte], COMPLETE, timeout).await?;
    if reply != [byte] {
        return Err(LabError::parse(
            t.name(),
            format!("{byte:#04X}"),
            format!("{reply:02X?}"),
            "expected echo followed by CR",
        ));
    }
    tracing::trace!(device = %t.name(), command = byte, "command complete");
    Ok(())
}

pub struct Lambda103Driver {
    transport: Arc<MessageTransport>,
    /// Filter position per wheel (0..9)
    pub position: DictFeat<String, u8>,
    /// Move speed per wheel, applied with the next move (0 fastest)
    pub speed: DictFeat<String, u8>,
    pub shutter_open: DictFeat<String, bool>,
    default_speed: u8,
    feats: FeatSet,
}

impl Lambda103Driver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(128_000),
            TransportOptions::default()
                .with_termination("", COMPLETE)
                .with_timeout(Duration::from_secs(2)),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        Self::build(Arc::new(transport), DEFAULT_SPEED)
    }

    pub fn with_default_speed(self, speed: u8) -> Self {
        Self::build(self.transport, speed.min(7))
    }

    fn build(t: Arc<MessageTransport>, default_speed: u8) -> Self {
        let wheels = WHEELS.map(String::from);

        let speed = DictFeat::<String, u8>::new("speed")
            .describe("Wheel speed for subsequent moves")
            .with_keys(wheels.clone())
            .with_limits(Limits::new(0.0, 7.0).with_step(1.0))
            .with_writer(|_wheel: String, _speed: u8| -> BoxFuture<'static, Result<()>> {
                Box::pin(async { Ok(()) })
            });

        let position = DictFeat::<String, u8>::new("position")
            .with_keys(wheels.clone())
            .with_limits(Limits::new(0.0, 9.0).with_step(1.0))
            .with_writer({
                let t = Arc::clone(&t);
                let speed = speed.clone();
                move |wheel: String, filter: u8| -> BoxFuture<'static, Result<()>> {
                    let t = Arc::clone(&t);
                    let s = speed.cached(&wheel).unwrap_or(default_speed);
                    Box::pin(async move { exchange(&t, move_byte(&wheel, s, filter)).await })
                }
            });

        let shutter_open = DictFeat::<String, bool>::new("shutter_open")
            .with_keys(wheels)
            .with_writer({
                let t = Arc::clone(&t);
                move |shutter: String, open: bool| -> BoxFuture<'static, Result<()>> {
                    let t = Arc::clone(&t);
                    Box::pin(async move { exchange(&t, shutter_byte(&shutter, open)).await })
                }
            });

        let mut feats = FeatSet::new();
        feats
            .register(position.clone())
            .register(speed.clone())
            .register(shutter_open.clone());

        Self {
            transport: t,
            position,
            speed,
            shutter_open,
            default_speed,
            feats,
        }
    }

    pub fn default_speed(&self) -> u8 {
        self.default_speed
    }
}

#[async_trait]
impl Instrument for Lambda103Driver {
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
        exchange(&self.transport, ONLINE).await?;
        for wheel in WHEELS {
            self.speed.set(wheel.to_string(), self.default_speed).await?;
        }
        tracing::info!(device = %self.name(), speed = self.default_speed, "Lambda 10-3 on line");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn finalize(&self) -> Result<()> {
        exchange(&self.transport, LOCAL).await
    }
}

/// Shutter A.
#[async_trait]
impl ShutterControl for Lambda103Driver {
    async fn open_shutter(&self) -> Result<()> {
        self.shutter_open.set_forced("A".to_string(), true).await
    }

    async fn close_shutter(&self) -> Result<()> {
        self.shutter_open.set_forced("A".to_string(), false).await
    }

    async fn is_shutter_open(&self) -> Result<bool> {
        self.shutter_open.get("A".to_string()).await
    }
}
