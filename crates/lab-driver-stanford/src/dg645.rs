//! Stanford Research Systems DG645 Digital Delay Generator Driver
//!
//! Reference: DG645 Operation Manual, "Remote Programming"
//!
//! Protocol Overview:
//! - Ethernet (raw socket, port 5025), GPIB or RS-232 (9600 8N1)
//! - Commands end in LF; replies end in CR LF
//! - Channels: T0=0, T1=1, A=2 .. H=9; outputs: T0=0, AB=1, CD=2, EF=3, GH=4
//! - Delays are set relative to another channel: `DLAY c,d,t`
//! - Errors queue up and are read with `LERR?` (0 = no error)
//!
//! Every setter is followed by `LERR?` so a rejected value surfaces as an
//! error at the call site rather than on some later query.

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

/// Delay channels in `DLAY` numbering order.
pub const CHANNELS: [&str; 10] = ["T0", "T1", "A", "B", "C", "D", "E", "F", "G", "H"];

/// Front panel outputs in `LAMP`/`LOFF`/`LPOL` numbering order.
pub const OUTPUTS: [&str; 5] = ["T0", "AB", "CD", "EF", "GH"];

/// Longest programmable delay (s).
const MAX_DELAY: f64 = 2000.0;

const SINGLE_SHOT: &str = "single_shot";

/// `LERR?` codes.
fn error_description(code: u32) -> &'static str {
    match code {
        10 => "illegal value",
        11 => "illegal mode",
        12 => "illegal delay",
        13 => "illegal link",
        14 => "recall failed",
        15 => "not allowed",
        16 => "failed self test",
        17 => "failed auto calibration",
        30 => "lost data",
        32 => "not attached",
        40 => "failed ROM check",
        41 => "failed offset T0 test",
        42 => "failed offset AB test",
        43 => "failed offset CD test",
        44 => "failed offset EF test",
        45 => "failed offset GH test",
        46 => "failed amplitude T0 test",
        47 => "failed amplitude AB test",
        48 => "failed amplitude CD test",
        49 => "failed amplitude EF test",
        50 => "failed amplitude GH test",
        51 => "failed FPGA communications test",
        52 => "failed GPIB communications test",
        53 => "failed DDS communications test",
        54 => "failed serial EEPROM communications test",
        55 => "failed temperature sensor communications test",
        56 => "failed PLL communications test",
        57 => "failed DAC 0 communications test",
        58 => "failed DAC 1 communications test",
        59 => "failed DAC 2 communications test",
        60 => "failed sample and hold operations test",
        61 => "failed vjitter operations test",
        62 => "failed channel T0 analog delay test",
        63 => "failed channel T1 analog delay test",
        64 => "failed channel A analog delay test",
        65 => "failed channel B analog delay test",
        66 => "failed channel C analog delay test",
        67 => "failed channel D analog delay test",
        68 => "failed channel E analog delay test",
        69 => "failed channel F analog delay test",
        70 => "failed channel G analog delay test",
        71 => "failed channel H analog delay test",
        80 => "failed sample and hold calibration",
        81 => "failed T0 calibration",
        82 => "failed T1 calibration",
        83 => "failed A calibration",
        84 => "failed B calibration",
        85 => "failed C calibration",
        86 => "failed D calibration",
        87 => "failed E calibration",
        88 => "failed F calibration",
        89 => "failed G calibration",
        90 => "failed H calibration",
        91 => "failed vjitter calibration",
        110 => "illegal command",
        111 => "undefined command",
        112 => "illegal query",
        113 => "illegal set",
        114 => "null parameter",
        115 => "extra parameters",
        116 => "missing parameters",
        117 => "parameter overflow",
        118 => "invalid floating point number",
        120 => "invalid integer",
        121 => "integer overflow",
        122 => "invalid hexadecimal",
        126 => "syntax error",
        170 => "communication error",
        171 => "over run",
        254 => "too many errors",
        _ => "unknown error",
    }
}

// =============================================================================
// Dg645Factory
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Dg645Config {
    pub connection: ConnectionConfig,
}

pub struct Dg645Factory;

static DG645_CAPABILITIES: &[Capability] = &[Capability::Triggerable];

impl DriverFactory for Dg645Factory {
    fn driver_type(&self) -> &'static str {
        "dg645"
    }

    fn name(&self) -> &'static str {
        "Stanford Research DG645 Delay Generator"
    }

    fn capabilities(&self) -> &'static [Capability] {
        DG645_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Dg645Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Dg645Config = lab_core::parse_config("dg645", &config)?;
            let transport = cfg
                .connection
                .open("DG645", &Dg645Driver::connection_defaults())
                .await
                .context("Failed to open DG645 connection")?;
            let driver = Arc::new(Dg645Driver::with_transport(transport));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_triggerable(driver))
        })
    }
}

// =============================================================================
// Delay settings
// =============================================================================

/// A channel delay relative to another channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DelaySetting {
    /// Channel the delay is measured from (`T0`, `A`, ...)
    pub reference: String,
    pub seconds: f64,
}

impl DelaySetting {
    pub fn new(reference: impl Into<String>, seconds: f64) -> Self {
        Self {
            reference: reference.into(),
            seconds,
        }
    }
}

fn index_of(table: &[&str], feat: &str, key: &str) -> Result<usize> {
    table
        .iter()
        .position(|c| c.eq_ignore_ascii_case(key))
        .ok_or_else(|| LabError::InvalidKey {
            feat: feat.to_string(),
            key: key.to_string(),
            keys: table.iter().map(|c| c.to_string()).collect(),
        })
}

/// Parse a `DLAY?` reply: `d,t` with `d` the reference channel number.
fn parse_delay(reply: &str) -> Result<DelaySetting> {
    let bad = |reason: &str| LabError::parse("", "", reply, reason);
    let (reference, seconds) = reply.trim().split_once(',').ok_or_else(|| bad("expected d,t"))?;
    let reference: usize = reference.trim().parse().map_err(|_| bad("bad channel"))?;
    let reference = CHANNELS.get(reference).ok_or_else(|| bad("unknown channel"))?;
    Ok(DelaySetting::new(*reference, bind::number::<f64>(seconds)?))
}

/// Write `command`, then fail if `LERR?` reports an error.
async fn write_checked(t: &MessageTransport, command: &str) -> Result<()> {
    t.write(command).await?;
    let code: u32 = t.query_parse("LERR?").await?;
    if code == 0 {
        return Ok(());
    }
    Err(LabError::instrument(
        t.name(),
        format!("{command:?} rejected: {} ({code})", error_description(code)),
    ))
}

fn checked_writer<T, F>(
    t: &Arc<MessageTransport>,
    format: F,
) -> impl Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static
where
    T: Send + 'static,
    F: Fn(&T) -> Result<String> + Send + Sync + 'static,
{
    let t = Arc::clone(t);
    move |value| {
        let t = Arc::clone(&t);
        let command = format(&value);
        Box::pin(async move { write_checked(&t, &command?).await })
    }
}

fn checked_keyed_writer<T, F>(
    t: &Arc<MessageTransport>,
    format: F,
) -> impl Fn(String, T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static
where
    T: Send + 'static,
    F: Fn(&str, &T) -> Result<String> + Send + Sync + 'static,
{
    let t = Arc::clone(t);
    move |key: String, value| {
        let t = Arc::clone(&t);
        let command = format(key.as_str(), &value);
        Box::pin(async move { write_checked(&t, &command?).await })
    }
}

// =============================================================================
// Dg645Driver
// =============================================================================

/// Driver for the DG645 four-channel delay generator.
pub struct Dg645Driver {
    transport: Arc<MessageTransport>,
    /// Per-channel delay relative to a reference channel
    pub delay: DictFeat<String, DelaySetting>,
    /// Output level amplitude (V)
    pub amplitude: DictFeat<String, f64>,
    /// Output level offset (V)
    pub offset: DictFeat<String, f64>,
    /// Output polarity: positive, negative
    pub polarity: DictFeat<String, String>,
    pub trigger_source: Feat<String>,
    /// Internal trigger rate (Hz)
    pub trigger_rate: Feat<f64>,
    /// External trigger threshold (V)
    pub trigger_level: Feat<f64>,
    feats: FeatSet,
}

impl Dg645Driver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(9600),
            TransportOptions::default()
                .with_termination("\n", b'\n')
                .with_timeout(Duration::from_secs(2)),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);
        let channel_keys = CHANNELS.map(String::from);
        let output_keys = OUTPUTS.map(String::from);

        let delay = DictFeat::<String, DelaySetting>::new("delay")
            .describe("Channel delay relative to a reference channel")
            .with_keys(channel_keys)
            .with_validator(|d: &DelaySetting| {
                index_of(&CHANNELS, "delay", &d.reference)?;
                if d.seconds.abs() > MAX_DELAY {
                    return Err(LabError::OutOfRange {
                        feat: "delay".into(),
                        value: d.seconds,
                        min: -MAX_DELAY,
                        max: MAX_DELAY,
                    });
                }
                Ok(())
            })
            .with_reader({
                let t = Arc::clone(&t);
                move |key: String| -> BoxFuture<'static, Result<DelaySetting>> {
                    let t = Arc::clone(&t);
                    Box::pin(async move {
                        let cmd = format!("DLAY?{}", index_of(&CHANNELS, "delay", &key)?);
                        let reply = t.query(&cmd).await?;
                        parse_delay(&reply).map_err(|_| {
                            LabError::parse(t.name(), &cmd, &reply, "expected d,t")
                        })
                    })
                }
            })
            .with_writer(checked_keyed_writer(&t, |key: &str, d: &DelaySetting| {
                let channel = index_of(&CHANNELS, "delay", key)?;
                let reference = index_of(&CHANNELS, "delay", &d.reference)?;
                if channel == reference {
                    return Err(LabError::Configuration(format!(
                        "channel {key} cannot be delayed from itself"
                    )));
                }
                Ok(format!("DLAY {channel},{reference},{:.12}", d.seconds))
            }));

        let level = |name: &'static str, command: &'static str, limits: Limits| {
            DictFeat::<String, f64>::new(name)
                .with_keys(output_keys.clone())
                .with_unit(units::VOLT)
                .with_limits(limits)
                .with_reader({
                    let t = Arc::clone(&t);
                    move |key: String| -> BoxFuture<'static, Result<f64>> {
                        let t = Arc::clone(&t);
                        Box::pin(async move {
                            let cmd = format!("{command}?{}", index_of(&OUTPUTS, name, &key)?);
                            t.query_parse(&cmd).await
                        })
                    }
                })
                .with_writer(checked_keyed_writer(&t, move |key: &str, v: &f64| {
                    Ok(format!("{command} {},{v:.2}", index_of(&OUTPUTS, name, key)?))
                }))
        };
        let amplitude = level("amplitude", "LAMP", Limits::new(0.5, 5.0));
        let offset = level("offset", "LOFF", Limits::new(-2.0, 2.0));

        let polarities = ValueMap::strings([("negative", "0"), ("positive", "1")]);
        let polarity = DictFeat::<String, String>::new("polarity")
            .with_keys(output_keys)
            .with_values(&polarities)
            .with_reader({
                let (t, map) = (Arc::clone(&t), polarities.clone());
                move |key: String| -> BoxFuture<'static, Result<String>> {
                    let (t, map) = (Arc::clone(&t), map.clone());
                    Box::pin(async move {
                        let cmd = format!("LPOL?{}", index_of(&OUTPUTS, "polarity", &key)?);
                        let reply = t.query(&cmd).await?;
                        map.from_wire("polarity", &reply)
                    })
                }
            })
            .with_writer(checked_keyed_writer(&t, move |key: &str, p: &String| {
                let output = index_of(&OUTPUTS, "polarity", key)?;
                Ok(format!("LPOL {output},{}", polarities.to_wire("polarity", p)?))
            }));

        let sources = ValueMap::strings([
            ("internal", "0"),
            ("external_rising", "1"),
            ("external_falling", "2"),
            ("single_shot_external_rising", "3"),
            ("single_shot_external_falling", "4"),
            (SINGLE_SHOT, "5"),
            ("line", "6"),
        ]);
        let trigger_source = Feat::<String>::new("trigger_source")
            .with_values(&sources)
            .with_reader(bind::reader(&t, "TSRC?", {
                let map = sources.clone();
                move |reply: &str| map.from_wire("trigger_source", reply)
            }))
            .with_writer(checked_writer(&t, move |s: &String| {
                Ok(format!("TSRC {}", sources.to_wire("trigger_source", s)?))
            }));

        let trigger_rate = Feat::<f64>::new("trigger_rate")
            .with_unit(units::HERTZ)
            .with_limits(Limits::new(100e-6, 10e6))
            .with_reader(bind::reader(&t, "TRAT?", bind::number::<f64>))
            .with_writer(checked_writer(&t, |hz: &f64| Ok(format!("TRAT {hz}"))));

        let trigger_level = Feat::<f64>::new("trigger_level")
            .with_unit(units::VOLT)
            .with_limits(Limits::new(-3.5, 3.5))
            .with_reader(bind::reader(&t, "TLVL?", bind::number::<f64>))
            .with_writer(checked_writer(&t, |v: &f64| Ok(format!("TLVL {v:.2}"))));

        let mut feats = FeatSet::new();
        feats
            .register(delay.clone())
            .register(amplitude.clone())
            .register(offset.clone())
            .register(polarity.clone())
            .register(trigger_source.clone())
            .register(trigger_rate.clone())
            .register(trigger_level.clone());

        let trg = Arc::clone(&t);
        feats.register_action(
            Action::new("trigger", move |_| {
                let t = Arc::clone(&trg);
                Box::pin(async move {
                    write_checked(&t, "*TRG").await?;
                    Ok(Value::Null)
                })
            })
            .describe("Software trigger (single-shot mode)"),
        );

        Self {
            transport: t,
            delay,
            amplitude,
            offset,
            polarity,
            trigger_source,
            trigger_rate,
            trigger_level,
            feats,
        }
    }

    /// Read and clear the last error.
    pub async fn check_errors(&self) -> Result<()> {
        let code: u32 = self.transport.query_parse("LERR?").await?;
        if code == 0 {
            Ok(())
        } else {
            Err(LabError::instrument(
                self.name(),
                format!("{} ({code})", error_description(code)),
            ))
        }
    }
}

#[async_trait]
impl Instrument for Dg645Driver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::PulseGenerator)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        let idn = self.transport.query("*IDN?").await?;
        if !idn.contains("DG645") {
            return Err(LabError::instrument(
                self.name(),
                format!("*IDN? reply {idn:?} is not a DG645"),
            ));
        }
        // Stale errors from before we connected
        for _ in 0..20 {
            let code: u32 = self.transport.query_parse("LERR?").await?;
            if code == 0 {
                break;
            }
            tracing::debug!(device = %self.name(), code, "discarding queued error");
        }
        tracing::info!(device = %self.name(), idn = %idn, "DG645 ready");
        Ok(())
    }
}

#[async_trait]
impl Triggerable for Dg645Driver {
    /// Switch to single-shot triggering; delays fire on the next `trigger`.
    async fn arm(&self) -> Result<()> {
        self.trigger_source.set_forced(SINGLE_SHOT.to_string()).await
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn trigger(&self) -> Result<()> {
        write_checked(&self.transport, "*TRG").await
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.trigger_source.refresh().await? == SINGLE_SHOT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::{MockInstrument, MockLog};

    fn generator(mock: MockInstrument) -> (Dg645Driver, MockLog) {
        let (t, log) = mock
            .on("*IDN?", "Stanford Research Systems,DG645,s/n001776,ver1.14.10E")
            .on("LERR?", "0")
            .spawn_transport("DG645", Dg645Driver::connection_defaults().options);
        (Dg645Driver::with_transport(t), log)
    }

    #[test]
    fn delay_reply_parsing() {
        assert_eq!(
            parse_delay("0,+0.000001000000").unwrap(),
            DelaySetting::new("T0", 1e-6)
        );
        assert_eq!(
            parse_delay("2,-1.5e-9").unwrap(),
            DelaySetting::new("A", -1.5e-9)
        );
        assert!(parse_delay("12,0").is_err());
        assert!(parse_delay("garbage").is_err());
    }

    #[tokio::test]
    async fn initialize_drains_error_queue() {
        let (dg, log) = generator(MockInstrument::new().on("LERR?", "17"));
        dg.initialize().await.unwrap();
        assert_eq!(log.commands(), vec!["*IDN?", "LERR?", "LERR?"]);
    }

    #[tokio::test]
    async fn delay_written_relative_to_reference() {
        let (dg, log) = generator(MockInstrument::new());
        dg.delay
            .set("B".into(), DelaySetting::new("A", 25e-9))
            .await
            .unwrap();
        assert_eq!(log.commands(), vec!["DLAY 3,2,0.000000025000", "LERR?"]);

        assert!(dg
            .delay
            .set("A".into(), DelaySetting::new("A", 1e-6))
            .await
            .is_err());
        assert!(matches!(
            dg.delay.set("Z".into(), DelaySetting::new("T0", 0.0)).await,
            Err(LabError::InvalidKey { .. })
        ));
    }

    #[tokio::test]
    async fn delay_read_names_reference() {
        let (dg, _log) = generator(MockInstrument::new().on("DLAY?5", "4,+0.000000100000"));
        assert_eq!(
            dg.delay.get("D".into()).await.unwrap(),
            DelaySetting::new("C", 100e-9)
        );
    }

    #[tokio::test]
    async fn rejected_setting_reports_error_code() {
        let (dg, _log) = generator(MockInstrument::new().on("LERR?", "12"));
        match dg.trigger_rate.set(1000.0).await {
            Err(LabError::Instrument { message, .. }) => {
                assert!(message.contains("illegal delay"));
            }
            other => panic!("expected instrument error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_levels_per_output() {
        let (dg, log) = generator(MockInstrument::new().on("LPOL?2", "0"));
        dg.amplitude.set("CD".into(), 2.5).await.unwrap();
        assert_eq!(dg.polarity.get("CD".into()).await.unwrap(), "negative");
        dg.polarity.set("AB".into(), "positive".into()).await.unwrap();
        assert_eq!(
            log.commands(),
            vec!["LAMP 2,2.50", "LERR?", "LPOL?2", "LPOL 1,1", "LERR?"]
        );
        assert!(dg.amplitude.set("AB".into(), 6.0).await.is_err());
    }

    #[tokio::test]
    async fn arm_selects_single_shot_and_trigger_fires() {
        let (dg, log) = generator(MockInstrument::new().on("TSRC?", "5"));
        dg.arm().await.unwrap();
        assert!(dg.is_armed().await.unwrap());
        dg.trigger().await.unwrap();
        assert_eq!(
            log.commands(),
            vec!["TSRC 5", "LERR?", "TSRC?", "*TRG", "LERR?"]
        );
    }

    #[tokio::test]
    async fn arm_rewrites_trigger_source_every_time() {
        let (dg, log) = generator(MockInstrument::new());
        dg.arm().await.unwrap();
        dg.arm().await.unwrap();
        assert_eq!(log.count("TSRC 5"), 2);
    }
}
