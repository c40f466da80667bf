//! Newport ESP300 Universal Motion Controller Driver
//!
//! Reference: ESP300 User's Manual
//!
//! Protocol Overview:
//! - Format: ASCII, axis number prefix: `{axis}{CMD}{value}`
//! - Baud: 19200, 8N1
//! - Terminator: CR+LF
//! - Axes: 1-3
//!
//! | Command | Meaning                          |
//! |---------|----------------------------------|
//! | nPA x   | move absolute                    |
//! | nPR x   | move relative                    |
//! | nTP?    | actual position                  |
//! | nVA x   | velocity                         |
//! | nAC x   | acceleration                     |
//! | nMO/nMF | motor on/off                     |
//! | nMD?    | motion done (1 = stopped)        |
//! | nOR     | home search                      |
//! | nST     | stop motion                      |
//! | TB?     | pop error buffer: `code, ts, msg`|
//! | VE?     | firmware version                 |
//!
//! # Example
//!
//! ```rust,ignore
//! let components = Esp300Factory
//!     .build(toml::toml! {
//!         axis = 2
//!         [connection]
//!         type = "serial"
//!         port = "/dev/ttyUSB0"
//!     }.into())
//!     .await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, units, Action, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DictFeat, DriverFactory, FeatSet, Instrument, LabError,
    MessageTransport, Movable, Result, SerialSettings, TransportOptions,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

/// Axis numbers the controller accepts.
pub const AXES: [u8; 3] = [1, 2, 3];

const POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Esp300Factory - DriverFactory implementation
// =============================================================================

/// Configuration for the ESP300 driver
#[derive(Debug, Clone, Deserialize)]
pub struct Esp300Config {
    pub connection: ConnectionConfig,
    /// Axis exposed through the `Movable` capability (1-3)
    #[serde(default = "default_axis")]
    pub axis: u8,
    /// Upper bound on `wait_settled`, in seconds
    #[serde(default = "default_settle_timeout")]
    pub settle_timeout_secs: f64,
}

fn default_axis() -> u8 {
    1
}

fn default_settle_timeout() -> f64 {
    60.0
}

/// Factory for creating ESP300 driver instances.
pub struct Esp300Factory;

static ESP300_CAPABILITIES: &[Capability] = &[Capability::Movable];

impl DriverFactory for Esp300Factory {
    fn driver_type(&self) -> &'static str {
        "esp300"
    }

    fn name(&self) -> &'static str {
        "Newport ESP300 Motion Controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        ESP300_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Esp300Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        if !AXES.contains(&cfg.axis) {
            return Err(anyhow!("ESP300 axis must be 1-3, got {}", cfg.axis));
        }
        if !(cfg.settle_timeout_secs.is_finite() && cfg.settle_timeout_secs > 0.0) {
            return Err(anyhow!("ESP300 settle_timeout_secs must be positive"));
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Esp300Config = lab_core::parse_config("esp300", &config)?;
            let transport = cfg
                .connection
                .open("ESP300", &Esp300Driver::connection_defaults())
                .await
                .context("Failed to open ESP300 connection")?;

            let driver = Arc::new(
                Esp300Driver::with_transport(transport, cfg.axis)?
                    .with_settle_timeout(Duration::from_secs_f64(cfg.settle_timeout_secs)),
            );

            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_movable(driver))
        })
    }
}

// =============================================================================
// Esp300Driver
// =============================================================================

/// Driver for the Newport ESP300 motion controller.
///
/// Per-axis state is exposed as DictFeats keyed by axis number; the
/// `Movable` capability acts on the configured axis.
pub struct Esp300Driver {
    transport: Arc<MessageTransport>,
    axis: u8,
    settle_timeout: Duration,
    /// Actual position (mm)
    pub position: DictFeat<u8, f64>,
    /// Velocity (mm/s)
    pub velocity: DictFeat<u8, f64>,
    /// Acceleration (mm/s^2)
    pub acceleration: DictFeat<u8, f64>,
    pub motor_on: DictFeat<u8, bool>,
    pub motion_done: DictFeat<u8, bool>,
    feats: FeatSet,
}

#[derive(Debug, Deserialize)]
struct AxisArgs {
    #[serde(default)]
    axis: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct MoveArgs {
    #[serde(default)]
    axis: Option<u8>,
    distance: f64,
}

impl Esp300Driver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            // Firmware 3.x works without RTS/CTS; set `flow_control` in the
            // connection table for units that need it
            SerialSettings::new(19200),
            TransportOptions::default()
                .with_termination("\r\n", b'\n')
                .with_write_delay(Duration::from_millis(10)),
        )
    }

    /// Wrap an open transport; `axis` is the one driven through `Movable`.
    pub fn with_transport(transport: MessageTransport, axis: u8) -> Result<Self> {
        if !AXES.contains(&axis) {
            return Err(LabError::Configuration(format!(
                "ESP300 axis must be 1-3, got {axis}"
            )));
        }
        let t = Arc::new(transport);

        let position = DictFeat::<u8, f64>::new("position")
            .with_keys(AXES)
            .with_unit(units::MILLIMETER)
            .with_reader(bind::keyed_reader(&t, |n: &u8| format!("{n}TP?"), bind::number::<f64>))
            .with_writer(bind::keyed_writer(&t, |n: &u8, mm: &f64| {
                Ok(format!("{n}PA{mm:.6}"))
            }));

        let velocity = DictFeat::<u8, f64>::new("velocity")
            .with_keys(AXES)
            .with_reader(bind::keyed_reader(&t, |n: &u8| format!("{n}VA?"), bind::number::<f64>))
            .with_writer(bind::keyed_writer(&t, |n: &u8, v: &f64| {
                Ok(format!("{n}VA{v:.6}"))
            }));

        let acceleration = DictFeat::<u8, f64>::new("acceleration")
            .with_keys(AXES)
            .with_reader(bind::keyed_reader(&t, |n: &u8| format!("{n}AC?"), bind::number::<f64>))
            .with_writer(bind::keyed_writer(&t, |n: &u8, a: &f64| {
                Ok(format!("{n}AC{a:.6}"))
            }));

        let motor_on = DictFeat::<u8, bool>::new("motor_on")
            .with_keys(AXES)
            .with_reader(bind::keyed_reader(&t, |n: &u8| format!("{n}MO?"), bind::flag))
            .with_writer(bind::keyed_writer(&t, |n: &u8, on: &bool| {
                Ok(format!("{n}{}", if *on { "MO" } else { "MF" }))
            }));

        let motion_done = DictFeat::<u8, bool>::new("motion_done")
            .with_keys(AXES)
            .with_reader(bind::keyed_reader(&t, |n: &u8| format!("{n}MD?"), bind::flag));

        let mut feats = FeatSet::new();
        feats
            .register(position.clone())
            .register(velocity.clone())
            .register(acceleration.clone())
            .register(motor_on.clone())
            .register(motion_done.clone());

        let axis_action = |name: &'static str, code: &'static str| {
            let (t, keys) = (Arc::clone(&t), position.clone());
            Action::new(name, move |args| {
                let (t, keys) = (Arc::clone(&t), keys.clone());
                Box::pin(async move {
                    let args: AxisArgs = Action::args(args)?;
                    let n = args.axis.unwrap_or(axis);
                    keys.check_key(&n)?;
                    command_checked(&t, &format!("{n}{code}")).await?;
                    Ok(Value::Null)
                })
            })
        };
        feats
            .register_action(axis_action("home", "OR").describe("Search for the home switch"))
            .register_action(axis_action("stop", "ST").describe("Decelerate to a stop"));

        let (rel_port, rel_keys) = (Arc::clone(&t), position.clone());
        feats.register_action(
            Action::new("move_relative", move |args| {
                let (t, keys) = (Arc::clone(&rel_port), rel_keys.clone());
                Box::pin(async move {
                    let args: MoveArgs = Action::args(args)?;
                    let n = args.axis.unwrap_or(axis);
                    keys.check_key(&n)?;
                    command_checked(&t, &format!("{n}PR{:.6}", args.distance)).await?;
                    Ok(Value::Null)
                })
            })
            .describe("Move by `distance` mm"),
        );

        Ok(Self {
            transport: t,
            axis,
            settle_timeout: Duration::from_secs(60),
            position,
            velocity,
            acceleration,
            motor_on,
            motion_done,
            feats,
        })
    }

    pub fn with_settle_timeout(mut self, timeout: Duration) -> Self {
        self.settle_timeout = timeout;
        self
    }

    /// Get the axis number.
    pub fn axis(&self) -> u8 {
        self.axis
    }

    /// Home this axis (find mechanical zero) and wait for it to finish.
    #[instrument(skip(self), fields(device = %self.transport.name(), axis = self.axis), err)]
    pub async fn home(&self) -> Result<()> {
        command_checked(&self.transport, &format!("{}OR", self.axis)).await?;
        self.wait_settled().await
    }

    /// Pop the controller's error buffer.
    pub async fn check_errors(&self) -> Result<()> {
        check_errors(&self.transport).await
    }
}

/// Send a command, then fail if the controller logged an error for it.
async fn command_checked(t: &MessageTransport, command: &str) -> Result<()> {
    t.write(command).await?;
    check_errors(t).await
}

async fn check_errors(t: &MessageTransport) -> Result<()> {
    let reply = t.query("TB?").await?;
    match parse_error_buffer(&reply) {
        Some((0, _)) => Ok(()),
        Some((code, message)) => Err(LabError::instrument(
            t.name(),
            format!("error {code}: {message}"),
        )),
        None => Err(LabError::parse(
            t.name(),
            "TB?",
            reply,
            "expected `code, timestamp, message`",
        )),
    }
}

/// `TB?` replies look like `0, 451322, NO ERROR DETECTED`.
fn parse_error_buffer(reply: &str) -> Option<(i32, String)> {
    let mut parts = reply.splitn(3, ',');
    let code = parts.next()?.trim().parse().ok()?;
    let _timestamp = parts.next()?;
    let message = parts.next().unwrap_or("").trim().to_string();
    Some((code, message))
}

#[async_trait]
impl Instrument for Esp300Driver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::Stage)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        let version = self.transport.query("VE?").await.map_err(|e| {
            LabError::instrument(self.name(), format!("no response to version query: {e}"))
        })?;
        if !version.to_uppercase().contains("ESP") {
            return Err(LabError::instrument(
                self.name(),
                format!("version response {version:?} doesn't indicate an ESP controller"),
            ));
        }
        tracing::info!(device = %self.name(), axis = self.axis, %version, "ESP300 validated");
        Ok(())
    }
}

#[async_trait]
impl Movable for Esp300Driver {
    #[instrument(skip(self), fields(axis = self.axis, position), err)]
    async fn move_abs(&self, position: f64) -> Result<()> {
        // The stage may have been moved by hand or by a relative move
        self.position.set_forced(self.axis, position).await?;
        self.check_errors().await
    }

    #[instrument(skip(self), fields(axis = self.axis, distance), err)]
    async fn move_rel(&self, distance: f64) -> Result<()> {
        command_checked(&self.transport, &format!("{}PR{distance:.6}", self.axis)).await?;
        self.position.invalidate();
        Ok(())
    }

    #[instrument(skip(self), fields(axis = self.axis), err)]
    async fn position(&self) -> Result<f64> {
        self.position.get(self.axis).await
    }

    #[instrument(skip(self), fields(axis = self.axis), err)]
    async fn wait_settled(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + self.settle_timeout;
        loop {
            if self.motion_done.get(self.axis).await? {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LabError::Timeout {
                    device: self.name().to_string(),
                    command: format!("{}MD?", self.axis),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    #[instrument(skip(self), fields(axis = self.axis), err)]
    async fn stop(&self) -> Result<()> {
        self.transport.write(&format!("{}ST", self.axis)).await
    }
}
