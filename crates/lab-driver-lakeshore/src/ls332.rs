//! Lake Shore Model 332 Temperature Controller Driver
//!
//! Reference: Model 332 User's Manual, chapter 6 "Remote Operation"
//!
//! Protocol Overview:
//! - Serial: 9600 baud, 7 data bits, odd parity, 1 stop bit
//! - Terminator: CRLF
//! - Queries take the input (`A`, `B`) or loop (`1`, `2`) as argument:
//!   `KRDG? A`, `SETP? 1`
//! - Multi-value replies are comma separated: `PID? 1` → `+50.0,+20.0,+0`
//! - `RDGST? <input>` returns a bit-weighted reading status; any set bit
//!   means the reading is unusable
//!
//! The serial interface needs at least 50 ms between commands.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, scpi, units, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DictFeat, DriverFactory, Feat, FeatSet, Instrument, LabError, Limits,
    MessageTransport, Parity, Readable, Result, SerialSettings, StatusRegister, TransportOptions,
    Unit, ValueMap,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

pub const INPUTS: [&str; 2] = ["A", "B"];
pub const LOOPS: [u8; 2] = [1, 2];

/// `RDGST?` bits.
pub const READING_STATUS: StatusRegister = StatusRegister::new(
    "RDGST",
    &[
        (0, "invalid reading"),
        (4, "temperature underrange"),
        (5, "temperature overrange"),
        (6, "sensor units zero"),
        (7, "sensor units overrange"),
    ],
);

#[derive(Debug, Clone, Deserialize)]
pub struct Ls332Config {
    pub connection: ConnectionConfig,
}

pub struct Ls332Factory;

static LS332_CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for Ls332Factory {
    fn driver_type(&self) -> &'static str {
        "ls332"
    }

    fn name(&self) -> &'static str {
        "Lake Shore 332 Temperature Controller"
    }

    fn capabilities(&self) -> &'static [Capability] {
        LS332_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Ls332Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Ls332Config = lab_core::parse_config("ls332", &config)?;
            let transport = cfg
                .connection
                .open("LS332", &Ls332Driver::connection_defaults())
                .await
                .context("Failed to open LS332 connection")?;
            let driver = Arc::new(Ls332Driver::with_transport(transport));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_readable(driver))
        })
    }
}

/// Control loop gains.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Pid {
    pub p: f64,
    /// Integral (reset), 0.1..1000
    pub i: f64,
    /// Derivative (rate), 0..200 %
    pub d: f64,
}

/// Setpoint ramp.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Ramp {
    pub enabled: bool,
    /// K/min, 0.1..100
    pub rate: f64,
}

/// Loop control mode (`CMODE`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlMode {
    ManualPid,
    Zone,
    OpenLoop,
    AutoTunePid,
    AutoTunePi,
    AutoTuneP,
}

impl ControlMode {
    fn code(self) -> u8 {
        match self {
            Self::ManualPid => 1,
            Self::Zone => 2,
            Self::OpenLoop => 3,
            Self::AutoTunePid => 4,
            Self::AutoTunePi => 5,
            Self::AutoTuneP => 6,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::ManualPid,
            2 => Self::Zone,
            3 => Self::OpenLoop,
            4 => Self::AutoTunePid,
            5 => Self::AutoTunePi,
            6 => Self::AutoTuneP,
            _ => return None,
        })
    }
}

fn fields<const N: usize>(command: &str, reply: &str) -> Result<[f64; N]> {
    let values: Vec<f64> = reply
        .split(',')
        .map(|f| f.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| LabError::parse("LS332", command, reply, e.to_string()))?;
    values
        .try_into()
        .map_err(|_| LabError::parse("LS332", command, reply, format!("expected {N} fields")))
}

fn parse_pid(reply: &str) -> Result<Pid> {
    let [p, i, d] = fields::<3>("PID?", reply)?;
    Ok(Pid { p, i, d })
}

fn parse_ramp(reply: &str) -> Result<Ramp> {
    let [enabled, rate] = fields::<2>("RAMP?", reply)?;
    Ok(Ramp {
        enabled: enabled != 0.0,
        rate,
    })
}

fn parse_mode(reply: &str) -> Result<ControlMode> {
    let code: u8 = bind::number(reply)?;
    ControlMode::from_code(code)
        .ok_or_else(|| LabError::parse("LS332", "CMODE?", reply, "expected 1..6"))
}

fn check_pid(pid: &Pid) -> Result<()> {
    for (name, value, min, max) in [
        ("pid.p", pid.p, 0.1, 1000.0),
        ("pid.i", pid.i, 0.1, 1000.0),
        ("pid.d", pid.d, 0.0, 200.0),
    ] {
        if !(min..=max).contains(&value) {
            return Err(LabError::OutOfRange {
                feat: name.into(),
                value,
                min,
                max,
            });
        }
    }
    Ok(())
}

/// Driver for the Model 332.
pub struct Ls332Driver {
    transport: Arc<MessageTransport>,
    /// Input temperature (K)
    pub temperature: DictFeat<String, f64>,
    /// Input temperature (°C)
    pub celsius: DictFeat<String, f64>,
    /// Raw sensor reading (V or Ω depending on sensor type)
    pub sensor_units: DictFeat<String, f64>,
    /// Loop setpoint in the loop's units (K by default)
    pub setpoint: DictFeat<u8, f64>,
    pub pid: DictFeat<u8, Pid>,
    pub ramp: DictFeat<u8, Ramp>,
    pub control_mode: DictFeat<u8, ControlMode>,
    /// off, low, medium, high (loop 1)
    pub heater_range: Feat<String>,
    /// Loop 1 heater output (%)
    pub heater_output: Feat<f64>,
    feats: FeatSet,
}

impl Ls332Driver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(9600).with_framing(7, Parity::Odd, 1),
            TransportOptions::default()
                .with_termination("\r\n", b'\n')
                .with_timeout(Duration::from_secs(2))
                .with_write_delay(Duration::from_millis(50)),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);
        let inputs = INPUTS.map(String::from);

        let input_reading = |name: &str, header: &'static str, unit: Unit| {
            DictFeat::<String, f64>::new(name)
                .with_keys(inputs.clone())
                .with_unit(unit)
                .with_reader(bind::keyed_reader(
                    &t,
                    move |input: &String| format!("{header}? {input}"),
                    bind::number::<f64>,
                ))
        };
        let temperature = input_reading("temperature", "KRDG", units::KELVIN);
        let celsius = input_reading("celsius", "CRDG", units::CELSIUS);
        let sensor_units = DictFeat::<String, f64>::new("sensor_units")
            .with_keys(inputs.clone())
            .with_reader(bind::keyed_reader(
                &t,
                |input: &String| format!("SRDG? {input}"),
                bind::number::<f64>,
            ));

        let setpoint = DictFeat::<u8, f64>::new("setpoint")
            .with_keys(LOOPS)
            .with_unit(units::KELVIN)
            .with_limits(Limits::new(0.0, 1500.0))
            .with_reader(bind::keyed_reader(&t, |l: &u8| format!("SETP? {l}"), bind::number::<f64>))
            .with_writer(bind::keyed_writer(&t, |l: &u8, k: &f64| {
                Ok(format!("SETP {l},{k:.3}"))
            }));

        let pid = DictFeat::<u8, Pid>::new("pid")
            .with_keys(LOOPS)
            .with_validator(check_pid)
            .with_reader(bind::keyed_reader(&t, |l: &u8| format!("PID? {l}"), parse_pid))
            .with_writer(bind::keyed_writer(&t, |l: &u8, g: &Pid| {
                Ok(format!("PID {l},{:.1},{:.1},{:.0}", g.p, g.i, g.d))
            }));

        let ramp = DictFeat::<u8, Ramp>::new("ramp")
            .with_keys(LOOPS)
            .with_validator(|r: &Ramp| {
                if (0.1..=100.0).contains(&r.rate) {
                    Ok(())
                } else {
                    Err(LabError::OutOfRange {
                        feat: "ramp.rate".into(),
                        value: r.rate,
                        min: 0.1,
                        max: 100.0,
                    })
                }
            })
            .with_reader(bind::keyed_reader(&t, |l: &u8| format!("RAMP? {l}"), parse_ramp))
            .with_writer(bind::keyed_writer(&t, |l: &u8, r: &Ramp| {
                Ok(format!("RAMP {l},{},{:.1}", u8::from(r.enabled), r.rate))
            }));

        let control_mode = DictFeat::<u8, ControlMode>::new("control_mode")
            .with_keys(LOOPS)
            .with_reader(bind::keyed_reader(&t, |l: &u8| format!("CMODE? {l}"), parse_mode))
            .with_writer(bind::keyed_writer(&t, |l: &u8, m: &ControlMode| {
                Ok(format!("CMODE {l},{}", m.code()))
            }));

        let ranges = ValueMap::strings([("off", "0"), ("low", "1"), ("medium", "2"), ("high", "3")]);
        let read_ranges = ranges.clone();
        let heater_range = Feat::<String>::new("heater_range")
            .describe("Loop 1 heater range")
            .with_values(&ranges)
            .with_reader(bind::reader(&t, "RANGE?", move |r: &str| {
                read_ranges.from_wire("heater_range", r)
            }))
            .with_writer(bind::writer(&t, move |r: &String| {
                Ok(format!("RANGE {}", ranges.to_wire("heater_range", r)?))
            }));

        let heater_output = Feat::<f64>::new("heater_output")
            .with_unit(units::PERCENT)
            .with_reader(bind::reader(&t, "HTR?", bind::number::<f64>));

        let mut feats = FeatSet::new();
        feats
            .register(temperature.clone())
            .register(celsius.clone())
            .register(sensor_units.clone())
            .register(setpoint.clone())
            .register(pid.clone())
            .register(ramp.clone())
            .register(control_mode.clone())
            .register(heater_range.clone())
            .register(heater_output.clone());

        Self {
            transport: t,
            temperature,
            celsius,
            sensor_units,
            setpoint,
            pid,
            ramp,
            control_mode,
            heater_range,
            heater_output,
            feats,
        }
    }

    /// Decode `RDGST?` for `input`, failing with the set flags.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn reading_status(&self, input: &str) -> Result<()> {
        let input = self.temperature.parse_key(input)?;
        let reply = self.transport.query(&format!("RDGST? {input}")).await?;
        let bits = lab_core::status::parse_register(&reply)?;
        READING_STATUS.check(self.name(), bits, u32::MAX)
    }
}

#[async_trait]
impl Instrument for Ls332Driver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::TemperatureController)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        let idn = scpi::identify(&self.transport, "MODEL332").await?;
        tracing::info!(device = %self.name(), idn = %idn, "LS332 ready");
        Ok(())
    }
}

#[async_trait]
impl Readable for Ls332Driver {
    /// Input A temperature; fails if the reading is flagged.
    async fn read(&self) -> Result<f64> {
        self.reading_status("A").await?;
        self.temperature.get("A".to_string()).await
    }

    fn unit(&self) -> Option<&'static str> {
        Some("K")
    }
}
