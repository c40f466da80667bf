//! Stanford Research Systems SR830 DSP Lock-In Amplifier Driver
//!
//! Reference: SR830 User's Manual, Chapter 5 "Remote Programming"
//!
//! Protocol Overview:
//! - Format: four-letter mnemonics, `CMD value` to set, `CMD?` to query;
//!   indexed commands take `CMD? i` / `CMD i,value`
//! - RS-232: 9600 baud 8N1, commands end in CR, replies end in CR
//! - GPIB: LF/EOI (handled by the controller link)
//! - `OUTX 0|1` selects which interface receives replies and must be sent
//!   first
//! - Sensitivity (`SENS`) and time constant (`OFLT`) are indices into fixed
//!   tables
//!
//! Status:
//! - `LIAS?` reports overloads and reference unlock
//! - `ERRS?` reports hardware/communication errors; any set bit is fatal

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, status::parse_register, units, Action, Capability, ConnectionConfig,
    ConnectionDefaults, DeviceCategory, DeviceComponents, DictFeat, DriverFactory, Feat, FeatSet,
    Instrument, LabError, Limits, MessageTransport, Readable, Result, SerialSettings,
    StatusRegister, TransportOptions, ValueMap,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

/// Full-scale sensitivities, V (index = `SENS` code).
pub const SENSITIVITIES: [f64; 27] = [
    2e-9, 5e-9, 10e-9, 20e-9, 50e-9, 100e-9, 200e-9, 500e-9, 1e-6, 2e-6, 5e-6, 10e-6, 20e-6,
    50e-6, 100e-6, 200e-6, 500e-6, 1e-3, 2e-3, 5e-3, 10e-3, 20e-3, 50e-3, 100e-3, 200e-3,
    500e-3, 1.0,
];

/// Time constants, s (index = `OFLT` code).
pub const TIME_CONSTANTS: [f64; 20] = [
    10e-6, 30e-6, 100e-6, 300e-6, 1e-3, 3e-3, 10e-3, 30e-3, 100e-3, 300e-3, 1.0, 3.0, 10.0,
    30.0, 100.0, 300.0, 1e3, 3e3, 10e3, 30e3,
];

/// Lock-in status (`LIAS?`).
pub const LOCKIN_STATUS: StatusRegister = StatusRegister::new(
    "LIAS",
    &[
        (0, "input/amplifier overload"),
        (1, "time constant filter overload"),
        (2, "output overload"),
        (3, "reference unlock"),
        (4, "detection frequency range switched"),
        (5, "time constant changed"),
        (6, "data storage triggered"),
    ],
);

/// Error status (`ERRS?`).
pub const ERROR_STATUS: StatusRegister = StatusRegister::new(
    "ERRS",
    &[
        (1, "backup error"),
        (2, "RAM error"),
        (4, "ROM error"),
        (5, "GPIB error"),
        (6, "DSP error"),
        (7, "math error"),
    ],
);

/// Longest an auto-gain/auto-reserve search takes.
const AUTO_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

// =============================================================================
// Sr830Factory
// =============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct Sr830Config {
    pub connection: ConnectionConfig,
}

pub struct Sr830Factory;

static SR830_CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for Sr830Factory {
    fn driver_type(&self) -> &'static str {
        "sr830"
    }

    fn name(&self) -> &'static str {
        "Stanford Research SR830 Lock-In Amplifier"
    }

    fn capabilities(&self) -> &'static [Capability] {
        SR830_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Sr830Config = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Sr830Config = lab_core::parse_config("sr830", &config)?;
            let transport = cfg
                .connection
                .open("SR830", &Sr830Driver::connection_defaults())
                .await
                .context("Failed to open SR830 connection")?;
            let gpib = matches!(cfg.connection, ConnectionConfig::Gpib { .. });
            let driver = Arc::new(Sr830Driver::with_transport(transport).with_gpib_output(gpib));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_readable(driver))
        })
    }
}

// =============================================================================
// SNAP parameters
// =============================================================================

/// Values `SNAP?` can capture simultaneously.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapParam {
    X,
    Y,
    R,
    Theta,
    Aux1,
    Aux2,
    Aux3,
    Aux4,
    Freq,
    Ch1,
    Ch2,
}

impl SnapParam {
    pub fn code(self) -> u8 {
        match self {
            Self::X => 1,
            Self::Y => 2,
            Self::R => 3,
            Self::Theta => 4,
            Self::Aux1 => 5,
            Self::Aux2 => 6,
            Self::Aux3 => 7,
            Self::Aux4 => 8,
            Self::Freq => 9,
            Self::Ch1 => 10,
            Self::Ch2 => 11,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapArgs {
    params: Vec<SnapParam>,
}

#[derive(Debug, Deserialize)]
struct OffsetArgs {
    #[serde(default = "default_offset_channel")]
    channel: String,
}

fn default_offset_channel() -> String {
    "x".into()
}

// =============================================================================
// Sr830Driver
// =============================================================================

/// Driver for the SR830 lock-in amplifier.
pub struct Sr830Driver {
    transport: Arc<MessageTransport>,
    gpib_output: bool,
    /// Reference frequency (Hz)
    pub frequency: Feat<f64>,
    /// Reference phase shift (deg)
    pub phase: Feat<f64>,
    /// Sine output amplitude (Vrms)
    pub amplitude: Feat<f64>,
    /// Full-scale sensitivity (V), one of [`SENSITIVITIES`]
    pub sensitivity: Feat<f64>,
    /// Time constant (s), one of [`TIME_CONSTANTS`]
    pub time_constant: Feat<f64>,
    pub input_source: Feat<String>,
    pub reference_source: Feat<String>,
    pub harmonic: Feat<u32>,
    /// Demodulator outputs: x, y, r (V) and theta (deg)
    pub output: DictFeat<String, f64>,
    /// Rear panel aux inputs 1-4 (V)
    pub aux_in: DictFeat<u8, f64>,
    /// Rear panel aux outputs 1-4 (V)
    pub aux_out: DictFeat<u8, f64>,
    /// Decoded `LIAS?` flags
    pub status: Feat<Vec<String>>,
    /// Decoded `ERRS?` flags
    pub errors: Feat<Vec<String>>,
    feats: FeatSet,
}

fn decoded(
    t: &Arc<MessageTransport>,
    command: &'static str,
    register: StatusRegister,
) -> impl Fn() -> BoxFuture<'static, Result<Vec<String>>> + Send + Sync + 'static {
    bind::reader(t, command, move |reply: &str| {
        Ok(register
            .decode_str(reply)?
            .into_iter()
            .map(str::to_string)
            .collect())
    })
}

fn output_channel(name: &str) -> Result<u8> {
    match name {
        "x" => Ok(1),
        "y" => Ok(2),
        "r" => Ok(3),
        "theta" => Ok(4),
        other => Err(LabError::InvalidKey {
            feat: "output".into(),
            key: other.into(),
            keys: vec!["x".into(), "y".into(), "r".into(), "theta".into()],
        }),
    }
}

impl Sr830Driver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(9600),
            TransportOptions::default()
                .with_termination("\r", b'\r')
                .with_timeout(Duration::from_secs(2)),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);

        let frequency = Feat::<f64>::new("frequency")
            .describe("Reference frequency")
            .with_unit(units::HERTZ)
            .with_limits(Limits::new(0.001, 102_000.0))
            .with_reader(bind::reader(&t, "FREQ?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |hz: &f64| Ok(format!("FREQ {hz}"))));

        let phase = Feat::<f64>::new("phase")
            .with_unit(units::DEGREE)
            .with_limits(Limits::new(-360.0, 729.99))
            .with_reader(bind::reader(&t, "PHAS?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |deg: &f64| Ok(format!("PHAS {deg}"))));

        let amplitude = Feat::<f64>::new("amplitude")
            .describe("Sine output amplitude")
            .with_unit(units::VOLT)
            .with_limits(Limits::new(0.004, 5.0).with_step(0.002))
            .with_reader(bind::reader(&t, "SLVL?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |v: &f64| Ok(format!("SLVL {v:.3}"))));

        let sensitivity = indexed(&t, "sensitivity", "SENS", &SENSITIVITIES).with_unit(units::VOLT);
        let time_constant =
            indexed(&t, "time_constant", "OFLT", &TIME_CONSTANTS).with_unit(units::SECOND);

        let sources = ValueMap::strings([("a", "0"), ("a-b", "1"), ("i1m", "2"), ("i100m", "3")]);
        let input_source = choice(&t, "input_source", "ISRC", sources);
        let references = ValueMap::strings([("external", "0"), ("internal", "1")]);
        let reference_source = choice(&t, "reference_source", "FMOD", references);

        let harmonic = Feat::<u32>::new("harmonic")
            .with_limits(Limits::new(1.0, 19_999.0).with_step(1.0))
            .with_reader(bind::reader(&t, "HARM?", bind::number::<u32>))
            .with_writer(bind::writer(&t, |n: &u32| Ok(format!("HARM {n}"))));

        let output = DictFeat::<String, f64>::new("output")
            .describe("Demodulator outputs")
            .with_keys(["x", "y", "r", "theta"].map(String::from))
            .with_reader({
                let t = Arc::clone(&t);
                move |key: String| -> BoxFuture<'static, Result<f64>> {
                    let t = Arc::clone(&t);
                    Box::pin(async move {
                        let cmd = format!("OUTP? {}", output_channel(&key)?);
                        t.query_parse(&cmd).await
                    })
                }
            });

        let aux_in = DictFeat::<u8, f64>::new("aux_in")
            .with_keys(1..=4)
            .with_unit(units::VOLT)
            .with_reader(bind::keyed_reader(&t, |i: &u8| format!("OAUX? {i}"), bind::number::<f64>));

        let aux_out = DictFeat::<u8, f64>::new("aux_out")
            .with_keys(1..=4)
            .with_unit(units::VOLT)
            .with_limits(Limits::new(-10.5, 10.5))
            .with_reader(bind::keyed_reader(&t, |i: &u8| format!("AUXV? {i}"), bind::number::<f64>))
            .with_writer(bind::keyed_writer(&t, |i: &u8, v: &f64| {
                Ok(format!("AUXV {i},{v:.3}"))
            }));

        let status = Feat::<Vec<String>>::new("status")
            .describe("Lock-in status flags")
            .with_reader(decoded(&t, "LIAS?", LOCKIN_STATUS));
        let errors = Feat::<Vec<String>>::new("errors")
            .describe("Error status flags")
            .with_reader(decoded(&t, "ERRS?", ERROR_STATUS));

        let mut feats = FeatSet::new();
        feats
            .register(frequency.clone())
            .register(phase.clone())
            .register(amplitude.clone())
            .register(sensitivity.clone())
            .register(time_constant.clone())
            .register(input_source.clone())
            .register(reference_source.clone())
            .register(harmonic.clone())
            .register(output.clone())
            .register(aux_in.clone())
            .register(aux_out.clone())
            .register(status.clone())
            .register(errors.clone());

        let auto = |name: &'static str, command: &'static str, wait: bool, feat: Feat<f64>| {
            let t = Arc::clone(&t);
            Action::new(name, move |_| {
                let (t, feat) = (Arc::clone(&t), feat.clone());
                Box::pin(async move {
                    t.write(command).await?;
                    if wait {
                        wait_idle(&t, command).await?;
                    }
                    feat.invalidate();
                    Ok(Value::Null)
                })
            })
        };
        feats
            .register_action(
                auto("auto_gain", "AGAN", true, sensitivity.clone())
                    .describe("Pick the sensitivity for the current signal"),
            )
            .register_action(
                auto("auto_reserve", "ARSV", true, sensitivity.clone())
                    .describe("Pick the dynamic reserve"),
            )
            .register_action(
                auto("auto_phase", "APHS", false, phase.clone())
                    .describe("Null the phase so Y is zero"),
            );

        let offset_port = Arc::clone(&t);
        feats.register_action(
            Action::new("auto_offset", move |args| {
                let t = Arc::clone(&offset_port);
                Box::pin(async move {
                    let args: OffsetArgs = Action::args(args)?;
                    let channel = output_channel(&args.channel)?;
                    if channel > 3 {
                        return Err(LabError::InvalidKey {
                            feat: "auto_offset".into(),
                            key: args.channel,
                            keys: vec!["x".into(), "y".into(), "r".into()],
                        });
                    }
                    t.write(&format!("AOFF {channel}")).await?;
                    Ok(Value::Null)
                })
            })
            .describe("Zero the offset of `channel` (x, y or r)"),
        );

        let snap_port = Arc::clone(&t);
        feats.register_action(
            Action::new("snap", move |args| {
                let t = Arc::clone(&snap_port);
                Box::pin(async move {
                    let args: SnapArgs = Action::args(args)?;
                    Action::reply(snap(&t, &args.params).await?)
                })
            })
            .describe("Capture 2-6 `params` at the same instant"),
        );

        Self {
            transport: t,
            gpib_output: false,
            frequency,
            phase,
            amplitude,
            sensitivity,
            time_constant,
            input_source,
            reference_source,
            harmonic,
            output,
            aux_in,
            aux_out,
            status,
            errors,
            feats,
        }
    }

    /// Route replies to GPIB (`OUTX 1`) instead of RS-232.
    pub fn with_gpib_output(mut self, gpib: bool) -> Self {
        self.gpib_output = gpib;
        self
    }

    /// Read several values at the same instant.
    pub async fn snap(&self, params: &[SnapParam]) -> Result<Vec<f64>> {
        snap(&self.transport, params).await
    }

    /// Closest table sensitivity to `volts`, applied.
    pub async fn set_sensitivity_nearest(&self, volts: f64) -> Result<f64> {
        let value = ValueMap::indexed(&SENSITIVITIES)
            .nearest(volts)
            .ok_or_else(|| LabError::Configuration("empty sensitivity table".into()))?;
        self.sensitivity.set(value).await?;
        Ok(value)
    }

    /// Fail with the decoded flags if `ERRS?` is non-zero.
    pub async fn check_errors(&self) -> Result<()> {
        let reply = self.transport.query("ERRS?").await?;
        ERROR_STATUS.check(self.name(), parse_register(&reply)?, u32::MAX)
    }
}

fn indexed(
    t: &Arc<MessageTransport>,
    name: &'static str,
    command: &'static str,
    table: &[f64],
) -> Feat<f64> {
    let map = ValueMap::indexed(table);
    Feat::<f64>::new(name)
        .with_table(&map)
        .with_reader(bind::reader(t, format!("{command}?"), {
            let map = map.clone();
            move |reply: &str| map.from_wire(name, reply)
        }))
        .with_writer(bind::writer(t, move |v: &f64| {
            Ok(format!("{command} {}", map.to_wire(name, v)?))
        }))
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
            Ok(format!("{command} {}", map.to_wire(name, v)?))
        }))
}

async fn snap(t: &MessageTransport, params: &[SnapParam]) -> Result<Vec<f64>> {
    if !(2..=6).contains(&params.len()) {
        return Err(LabError::Configuration(format!(
            "SNAP? takes 2 to 6 parameters, got {}",
            params.len()
        )));
    }
    let codes: Vec<String> = params.iter().map(|p| p.code().to_string()).collect();
    let command = format!("SNAP? {}", codes.join(","));
    let reply = t.query(&command).await?;
    let values = reply
        .split(',')
        .map(|v| t.parse_reply::<f64>(&command, v))
        .collect::<Result<Vec<_>>>()?;
    if values.len() != params.len() {
        return Err(LabError::parse(
            t.name(),
            &command,
            &reply,
            format!("expected {} values", params.len()),
        ));
    }
    Ok(values)
}

/// Poll serial poll bit 1 (no command in progress) until set.
async fn wait_idle(t: &MessageTransport, command: &str) -> Result<()> {
    let deadline = tokio::time::Instant::now() + AUTO_TIMEOUT;
    loop {
        let idle: u8 = t.query_parse("*STB? 1").await?;
        if idle == 1 {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(LabError::Timeout {
                device: t.name().to_string(),
                command: command.to_string(),
            });
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

#[async_trait]
impl Instrument for Sr830Driver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::LockIn)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        self.transport
            .write(if self.gpib_output { "OUTX 1" } else { "OUTX 0" })
            .await?;
        let idn = self.transport.query("*IDN?").await?;
        if !idn.contains("SR830") {
            return Err(LabError::instrument(
                self.name(),
                format!("*IDN? reply {idn:?} is not an SR830"),
            ));
        }
        self.check_errors().await?;
        tracing::info!(device = %self.name(), idn = %idn, "SR830 ready");
        Ok(())
    }
}

#[async_trait]
impl Readable for Sr830Driver {
    /// Magnitude R.
    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn read(&self) -> Result<f64> {
        self.output.get("r".to_string()).await
    }

    fn unit(&self) -> Option<&'static str> {
        Some("V")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::{MockInstrument, MockLog};

    fn lockin(mock: MockInstrument) -> (Sr830Driver, MockLog) {
        let (t, log) = mock
            .reply_terminator("\r")
            .on("*IDN?", "Stanford_Research_Systems,SR830,s/n12345,ver1.07")
            .on("ERRS?", "0")
            .spawn_transport("SR830", Sr830Driver::connection_defaults().options);
        (Sr830Driver::with_transport(t), log)
    }

    #[tokio::test]
    async fn initialize_selects_interface_first() {
        let (lockin, log) = lockin(MockInstrument::new());
        let lockin = lockin.with_gpib_output(true);
        lockin.initialize().await.unwrap();
        assert_eq!(log.commands(), vec!["OUTX 1", "*IDN?", "ERRS?"]);
    }

    #[tokio::test]
    async fn table_feats_accept_any_compatible_unit() {
        let (lockin, log) = lockin(MockInstrument::new());
        let feats = lockin.feats();
        feats
            .set_json("sensitivity", None, serde_json::json!("100 nV"))
            .await
            .unwrap();
        feats
            .set_json("sensitivity", None, serde_json::json!("10 uV"))
            .await
            .unwrap();
        feats
            .set_json("time_constant", None, serde_json::json!("30 us"))
            .await
            .unwrap();
        feats
            .set_json("time_constant", None, serde_json::json!("100 us"))
            .await
            .unwrap();
        assert_eq!(log.commands(), vec!["SENS 5", "SENS 11", "OFLT 1", "OFLT 2"]);
        assert_eq!(lockin.time_constant.cached(), Some(100e-6));
        assert!(feats
            .set_json("sensitivity", None, serde_json::json!("3 uV"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn error_bits_are_status_errors() {
        let (lockin, _log) = lockin(MockInstrument::new().on("ERRS?", "36"));
        match lockin.check_errors().await {
            Err(LabError::Status { flags, .. }) => {
                assert_eq!(flags, vec!["RAM error", "GPIB error"]);
            }
            other => panic!("expected status error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sensitivity_uses_table_index() {
        let (lockin, log) = lockin(MockInstrument::new().on("SENS?", "17"));
        assert_eq!(lockin.sensitivity.get().await.unwrap(), 1e-3);

        lockin.sensitivity.set(10e-3).await.unwrap();
        assert!(log.wait_for("SENS 20", Duration::from_secs(1)).await);
        assert!(matches!(
            lockin.sensitivity.set(3e-3).await,
            Err(LabError::InvalidChoice { .. })
        ));
        assert_eq!(lockin.set_sensitivity_nearest(3e-3).await.unwrap(), 2e-3);
        assert!(log.wait_for("SENS 18", Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn time_constant_reads_table() {
        let (lockin, _log) = lockin(MockInstrument::new().on("OFLT?", "10"));
        assert_eq!(lockin.time_constant.get().await.unwrap(), 1.0);
    }

    #[tokio::test]
    async fn outputs_by_name() {
        let (lockin, log) = lockin(
            MockInstrument::new()
                .on("OUTP? 3", "1.2345E-04")
                .on("OUTP? 4", "-45.2"),
        );
        assert_eq!(lockin.read().await.unwrap(), 1.2345e-4);
        assert_eq!(lockin.output.get("theta".into()).await.unwrap(), -45.2);
        assert!(matches!(
            lockin.output.get("z".into()).await,
            Err(LabError::InvalidKey { .. })
        ));
        assert_eq!(log.commands(), vec!["OUTP? 3", "OUTP? 4"]);
    }

    #[tokio::test]
    async fn aux_out_is_limited() {
        let (lockin, log) = lockin(MockInstrument::new());
        lockin.aux_out.set(2, 1.5).await.unwrap();
        assert!(log.wait_for("AUXV 2,1.500", Duration::from_secs(1)).await);
        assert!(matches!(
            lockin.aux_out.set(1, 11.0).await,
            Err(LabError::OutOfRange { .. })
        ));
    }

    #[tokio::test]
    async fn snap_reads_simultaneous_values() {
        let (lockin, log) = lockin(MockInstrument::new().on("SNAP? 1,2,9", "0.001,-0.002,1000.0"));
        let values = lockin
            .snap(&[SnapParam::X, SnapParam::Y, SnapParam::Freq])
            .await
            .unwrap();
        assert_eq!(values, vec![0.001, -0.002, 1000.0]);
        assert!(lockin.snap(&[SnapParam::X]).await.is_err());

        let reply = lockin
            .feats()
            .call("snap", serde_json::json!({ "params": ["x", "y", "freq"] }))
            .await
            .unwrap();
        assert_eq!(reply, serde_json::json!([0.001, -0.002, 1000.0]));
        assert_eq!(log.count("SNAP? 1,2,9"), 2);
    }

    #[tokio::test]
    async fn status_flags_decode() {
        let (lockin, _log) = lockin(MockInstrument::new().on("LIAS?", "9"));
        assert_eq!(
            lockin.status.get().await.unwrap(),
            vec!["input/amplifier overload", "reference unlock"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_gain_waits_for_completion() {
        let (lockin, log) = lockin(
            MockInstrument::new()
                .on("*STB? 1", "0")
                .on("*STB? 1", "0")
                .on("*STB? 1", "1"),
        );
        lockin
            .feats()
            .call("auto_gain", Value::Null)
            .await
            .unwrap();
        assert_eq!(log.count("AGAN"), 1);
        assert_eq!(log.count("*STB? 1"), 3);
    }

    #[tokio::test]
    async fn auto_offset_rejects_theta() {
        let (lockin, log) = lockin(MockInstrument::new());
        let err = lockin
            .feats()
            .call("auto_offset", serde_json::json!({ "channel": "theta" }))
            .await;
        assert!(matches!(err, Err(LabError::InvalidKey { .. })));
        lockin
            .feats()
            .call("auto_offset", serde_json::json!({ "channel": "y" }))
            .await
            .unwrap();
        assert!(log.wait_for("AOFF 2", Duration::from_secs(1)).await);
    }
}
