//! Tektronix TDS2000-Series Oscilloscope Driver
//!
//! Reference: TDS200, TDS1000/TDS2000, TPS2000 Series Programmer Manual
//!
//! Protocol Overview:
//! - IEEE 488.2 style commands (`CH1:SCA 0.5`, `ACQ:MOD?`) over USBTMC,
//!   GPIB or RS-232 (TDS2CM, 9600 baud, LF)
//! - `HEAD OFF` strips command headers from replies so queries return bare
//!   values
//! - Waveforms come back from `CURV?` as an IEEE 488.2 definite-length block
//!   of signed bytes (`DAT:ENC RIB`, `DAT:WID 1`), 2500 points per record
//! - Scaling is carried by the waveform preamble (`WFMP:*`):
//!   `volts = (raw - YOF) * YMU + YZE`, `t = XZE + i * XIN`
//!
//! Measurements that cannot be made return 9.9E37.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, units, Action, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DictFeat, DriverFactory, Feat, FeatSet, Instrument, LabError, Limits,
    MessageTransport, Result, SerialSettings, TransportOptions, Triggerable, ValueMap,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

/// Points in one TDS2000 record.
pub const RECORD_LENGTH: usize = 2500;

pub const CHANNELS: [u8; 4] = [1, 2, 3, 4];

/// Reply for a measurement the scope could not make.
const INVALID_MEASUREMENT: f64 = 9.9e37;

// =============================================================================
// Tds2000Factory
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Tds2000Config {
    pub connection: ConnectionConfig,
}

pub struct Tds2000Factory;

static TDS2000_CAPABILITIES: &[Capability] = &[Capability::Triggerable];

impl DriverFactory for Tds2000Factory {
    fn driver_type(&self) -> &'static str {
        "tds2000"
    }

    fn name(&self) -> &'static str {
        "Tektronix TDS2000 Oscilloscope"
    }

    fn capabilities(&self) -> &'static [Capability] {
        TDS2000_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Tds2000Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Tds2000Config = lab_core::parse_config("tds2000", &config)?;
            let transport = cfg
                .connection
                .open("TDS2000", &Tds2000Driver::connection_defaults())
                .await
                .context("Failed to open TDS2000 connection")?;
            let driver = Arc::new(Tds2000Driver::with_transport(transport));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_triggerable(driver))
        })
    }
}

// =============================================================================
// Waveforms and measurements
// =============================================================================

/// One acquired channel record, scaled to physical units.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Waveform {
    pub channel: u8,
    /// Sample times relative to the trigger (s)
    pub time: Vec<f64>,
    /// Sample values (V)
    pub volts: Vec<f64>,
}

/// Waveform preamble scale factors.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Preamble {
    x_increment: f64,
    x_zero: f64,
    y_multiplier: f64,
    y_offset: f64,
    y_zero: f64,
}

impl Preamble {
    fn scale(&self, channel: u8, raw: &[u8]) -> Waveform {
        let (time, volts) = raw
            .iter()
            .enumerate()
            .map(|(i, b)| {
                let counts = *b as i8 as f64;
                (
                    self.x_zero + i as f64 * self.x_increment,
                    (counts - self.y_offset) * self.y_multiplier + self.y_zero,
                )
            })
            .unzip();
        Waveform {
            channel,
            time,
            volts,
        }
    }
}

/// Immediate measurement types (`MEASU:IMM:TYP`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeasurementKind {
    Frequency,
    Period,
    Mean,
    PeakToPeak,
    CycleRms,
    Minimum,
    Maximum,
    RiseTime,
    FallTime,
    PositiveWidth,
    NegativeWidth,
}

impl MeasurementKind {
    fn wire(self) -> &'static str {
        match self {
            Self::Frequency => "FREQ",
            Self::Period => "PERI",
            Self::Mean => "MEAN",
            Self::PeakToPeak => "PK2",
            Self::CycleRms => "CRM",
            Self::Minimum => "MINI",
            Self::Maximum => "MAXI",
            Self::RiseTime => "RIS",
            Self::FallTime => "FALL",
            Self::PositiveWidth => "PWI",
            Self::NegativeWidth => "NWI",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChannelArgs {
    channel: u8,
}

#[derive(Debug, Deserialize)]
struct MeasureArgs {
    channel: u8,
    kind: MeasurementKind,
}

// =============================================================================
// Tds2000Driver
// =============================================================================

/// Driver for TDS1000/TDS2000 oscilloscopes.
pub struct Tds2000Driver {
    transport: Arc<MessageTransport>,
    /// sample, peak_detect, average
    pub acquire_mode: Feat<String>,
    /// Waveforms averaged in average mode
    pub average_count: Feat<u32>,
    /// Main time base (s/div)
    pub horizontal_scale: Feat<f64>,
    /// Main trigger level (V)
    pub trigger_level: Feat<f64>,
    /// Acquisition running
    pub running: Feat<bool>,
    /// Vertical scale per channel (V/div)
    pub vertical_scale: DictFeat<u8, f64>,
    feats: FeatSet,
}

impl Tds2000Driver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(9600),
            TransportOptions::default()
                .with_termination("\n", b'\n')
                .with_timeout(Duration::from_secs(5)),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);

        let modes = ValueMap::strings([
            ("sample", "SAMPLE"),
            ("peak_detect", "PEAKDETECT"),
            ("average", "AVERAGE"),
        ]);
        let acquire_mode = Feat::<String>::new("acquire_mode")
            .with_values(&modes)
            .with_reader(bind::reader(&t, "ACQ:MOD?", {
                let map = modes.clone();
                move |reply: &str| map.from_wire("acquire_mode", reply)
            }))
            .with_writer(bind::writer(&t, move |m: &String| {
                Ok(format!("ACQ:MOD {}", modes.to_wire("acquire_mode", m)?))
            }));

        let counts = ValueMap::new([(4u32, "4"), (16, "16"), (64, "64"), (128, "128")]);
        let average_count = Feat::<u32>::new("average_count")
            .with_values(&counts)
            .with_reader(bind::reader(&t, "ACQ:NUMAV?", bind::number::<u32>))
            .with_writer(bind::writer(&t, |n: &u32| Ok(format!("ACQ:NUMAV {n}"))));

        let horizontal_scale = Feat::<f64>::new("horizontal_scale")
            .describe("Main time base per division")
            .with_unit(units::SECOND)
            .with_limits(Limits::new(5e-9, 50.0))
            .with_reader(bind::reader(&t, "HOR:MAI:SCA?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |s: &f64| Ok(format!("HOR:MAI:SCA {s:E}"))));

        let trigger_level = Feat::<f64>::new("trigger_level")
            .with_unit(units::VOLT)
            .with_reader(bind::reader(&t, "TRIG:MAI:LEV?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |v: &f64| Ok(format!("TRIG:MAI:LEV {v:E}"))));

        let running = Feat::<bool>::new("running")
            .describe("Acquisition state")
            .with_reader(bind::reader(&t, "ACQ:STATE?", bind::flag))
            .with_writer(bind::writer(&t, |on: &bool| {
                Ok(format!("ACQ:STATE {}", if *on { "RUN" } else { "STOP" }))
            }));

        let vertical_scale = DictFeat::<u8, f64>::new("vertical_scale")
            .describe("Vertical scale per division")
            .with_keys(CHANNELS)
            .with_unit(units::VOLT)
            .with_limits(Limits::new(2e-3, 5.0))
            .with_reader(bind::keyed_reader(&t, |ch: &u8| format!("CH{ch}:SCA?"), bind::number::<f64>))
            .with_writer(bind::keyed_writer(&t, |ch: &u8, v: &f64| {
                Ok(format!("CH{ch}:SCA {v:E}"))
            }));

        let mut feats = FeatSet::new();
        feats
            .register(acquire_mode.clone())
            .register(average_count.clone())
            .register(horizontal_scale.clone())
            .register(trigger_level.clone())
            .register(running.clone())
            .register(vertical_scale.clone());

        let autoset_port = Arc::clone(&t);
        let autoset_feats = (horizontal_scale.clone(), vertical_scale.clone());
        feats.register_action(
            Action::new("autoset", move |_| {
                let t = Arc::clone(&autoset_port);
                let (horizontal, vertical) = autoset_feats.clone();
                Box::pin(async move {
                    t.write("AUTOS EXEC").await?;
                    horizontal.invalidate();
                    vertical.invalidate();
                    Ok(Value::Null)
                })
            })
            .describe("Let the scope pick scales and trigger for the signal"),
        );

        let wave_port = Arc::clone(&t);
        feats.register_action(
            Action::new("waveform", move |args| {
                let t = Arc::clone(&wave_port);
                Box::pin(async move {
                    let args: ChannelArgs = Action::args(args)?;
                    Action::reply(waveform(&t, args.channel).await?)
                })
            })
            .describe("Transfer the record of `channel` in volts and seconds"),
        );

        let measure_port = Arc::clone(&t);
        feats.register_action(
            Action::new("measure", move |args| {
                let t = Arc::clone(&measure_port);
                Box::pin(async move {
                    let args: MeasureArgs = Action::args(args)?;
                    Action::reply(measure(&t, args.channel, args.kind).await?)
                })
            })
            .describe("Immediate measurement of `kind` on `channel`"),
        );

        Self {
            transport: t,
            acquire_mode,
            average_count,
            horizontal_scale,
            trigger_level,
            running,
            vertical_scale,
            feats,
        }
    }

    /// Transfer a channel's record, scaled to volts and seconds.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn waveform(&self, channel: u8) -> Result<Waveform> {
        waveform(&self.transport, channel).await
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    pub async fn measure(&self, channel: u8, kind: MeasurementKind) -> Result<f64> {
        measure(&self.transport, channel, kind).await
    }
}

fn check_channel(channel: u8) -> Result<()> {
    if CHANNELS.contains(&channel) {
        Ok(())
    } else {
        Err(LabError::InvalidKey {
            feat: "channel".into(),
            key: channel.to_string(),
            keys: CHANNELS.iter().map(u8::to_string).collect(),
        })
    }
}

async fn waveform(t: &MessageTransport, channel: u8) -> Result<Waveform> {
    check_channel(channel)?;
    for setup in [
        format!("DAT:SOU CH{channel}"),
        "DAT:ENC RIB".to_string(),
        "DAT:WID 1".to_string(),
        "DAT:STAR 1".to_string(),
        format!("DAT:STOP {RECORD_LENGTH}"),
    ] {
        t.write(&setup).await?;
    }
    let preamble = Preamble {
        x_increment: t.query_parse("WFMP:XIN?").await?,
        x_zero: t.query_parse("WFMP:XZE?").await?,
        y_multiplier: t.query_parse("WFMP:YMU?").await?,
        y_offset: t.query_parse("WFMP:YOF?").await?,
        y_zero: t.query_parse("WFMP:YZE?").await?,
    };
    let raw = t.query_block("CURV?").await?;
    tracing::debug!(device = %t.name(), channel, points = raw.len(), "waveform transferred");
    Ok(preamble.scale(channel, &raw))
}

async fn measure(t: &MessageTransport, channel: u8, kind: MeasurementKind) -> Result<f64> {
    check_channel(channel)?;
    t.write(&format!("MEASU:IMM:SOU CH{channel}")).await?;
    t.write(&format!("MEASU:IMM:TYP {}", kind.wire())).await?;
    let value: f64 = t.query_parse("MEASU:IMM:VAL?").await?;
    if value >= INVALID_MEASUREMENT {
        return Err(LabError::instrument(
            t.name(),
            format!("no valid {kind:?} measurement on CH{channel}"),
        ));
    }
    Ok(value)
}

#[async_trait]
impl Instrument for Tds2000Driver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::Oscilloscope)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.transport.write("HEAD OFF").await?;
        let idn = self.transport.query("*IDN?").await?;
        if !idn.to_ascii_uppercase().contains("TDS") {
            return Err(LabError::instrument(
                self.name(),
                format!("*IDN? reply {idn:?} is not a TDS oscilloscope"),
            ));
        }
        tracing::info!(device = %self.name(), idn = %idn, "TDS2000 ready");
        Ok(())
    }
}

#[async_trait]
impl Triggerable for Tds2000Driver {
    /// Single sequence: acquire one record on the next trigger, then stop.
    async fn arm(&self) -> Result<()> {
        self.transport.write("ACQ:STOPA SEQ").await?;
        self.running.set_forced(true).await
    }

    async fn trigger(&self) -> Result<()> {
        self.transport.write("TRIG FORC").await
    }

    async fn is_armed(&self) -> Result<bool> {
        self.running.refresh().await
    }
}
