//! Keysight 33220A Function / Arbitrary Waveform Generator Driver
//!
//! Reference: Agilent 33220A User's Guide, chapter 4 "Remote Interface
//! Reference"
//!
//! Protocol Overview:
//! - SCPI over LAN (socket port 5025), USBTMC or GPIB
//! - Terminator: LF (\n)
//! - `APPL:<shape> <freq>,<amp>,<offset>` sets a complete waveform in one
//!   command and turns the output on
//! - Errors are queued and read with `SYST:ERR?` as `+code,"message"`
//!
//! The generator is armed for a software trigger by enabling burst mode
//! with the trigger source on the bus; `*TRG` then fires one burst.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    bind, scpi, units, Action, Capability, ConnectionConfig, ConnectionDefaults, DeviceCategory,
    DeviceComponents, DriverFactory, Feat, FeatSet, Instrument, LabError, Limits,
    MessageTransport, Result, SerialSettings, TransportOptions, Triggerable, ValueMap,
};
use serde::Deserialize;
use serde_json::Value;
use tracing::instrument;

const MAX_FREQUENCY_HZ: f64 = 20e6;

#[derive(Debug, Clone, Deserialize)]
pub struct Ks33220aConfig {
    pub connection: ConnectionConfig,
}

pub struct Ks33220aFactory;

static KS33220A_CAPABILITIES: &[Capability] = &[Capability::Triggerable];

impl DriverFactory for Ks33220aFactory {
    fn driver_type(&self) -> &'static str {
        "ks33220a"
    }

    fn name(&self) -> &'static str {
        "Keysight 33220A Function Generator"
    }

    fn capabilities(&self) -> &'static [Capability] {
        KS33220A_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> anyhow::Result<()> {
        let cfg: Ks33220aConfig = lab_core::parse_config(self.driver_type(), config)?;
        cfg.connection.validate()?;
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, anyhow::Result<DeviceComponents>> {
        Box::pin(async move {
            let cfg: Ks33220aConfig = lab_core::parse_config("ks33220a", &config)?;
            let transport = cfg
                .connection
                .open("33220A", &Ks33220aDriver::connection_defaults())
                .await
                .context("Failed to open 33220A connection")?;
            let driver = Arc::new(Ks33220aDriver::with_transport(transport));
            Ok(DeviceComponents::new()
                .with_instrument(driver.clone())
                .with_triggerable(driver))
        })
    }
}

/// Output function shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Waveshape {
    Sine,
    Square,
    Ramp,
    Pulse,
    Noise,
    Dc,
    User,
}

impl Waveshape {
    fn wire(self) -> &'static str {
        match self {
            Self::Sine => "SIN",
            Self::Square => "SQU",
            Self::Ramp => "RAMP",
            Self::Pulse => "PULS",
            Self::Noise => "NOIS",
            Self::Dc => "DC",
            Self::User => "USER",
        }
    }
}

#[derive(Debug, Deserialize)]
struct ApplyArgs {
    function: Waveshape,
    #[serde(default)]
    frequency: Option<f64>,
    #[serde(default)]
    amplitude: Option<f64>,
    #[serde(default)]
    offset: Option<f64>,
}

/// `APPL` fills trailing parameters with DEF when omitted.
fn apply_command(args: &ApplyArgs) -> Result<String> {
    if let Some(f) = args.frequency {
        if !(f > 0.0 && f <= MAX_FREQUENCY_HZ) {
            return Err(LabError::OutOfRange {
                feat: "apply".into(),
                value: f,
                min: 1e-6,
                max: MAX_FREQUENCY_HZ,
            });
        }
    }
    let field = |v: Option<f64>| v.map_or_else(|| "DEF".to_string(), |v| format!("{v:E}"));
    let mut params = vec![
        field(args.frequency),
        field(args.amplitude),
        field(args.offset),
    ];
    while params.last().map(String::as_str) == Some("DEF") {
        params.pop();
    }
    let shape = args.function.wire();
    Ok(if params.is_empty() {
        format!("APPL:{shape}")
    } else {
        format!("APPL:{shape} {}", params.join(","))
    })
}

/// Driver for the 33220A.
pub struct Ks33220aDriver {
    transport: Arc<MessageTransport>,
    /// sine, square, ramp, pulse, noise, dc, user
    pub function: Feat<String>,
    pub frequency: Feat<f64>,
    /// Amplitude in `amplitude_unit` (Vpp by default)
    pub amplitude: Feat<f64>,
    pub offset: Feat<f64>,
    /// vpp, vrms, dbm
    pub amplitude_unit: Feat<String>,
    pub output: Feat<bool>,
    /// Expected load (Ω); infinite selects high impedance
    pub load: Feat<f64>,
    /// Square wave duty cycle (%)
    pub duty_cycle: Feat<f64>,
    pub burst_enabled: Feat<bool>,
    pub burst_cycles: Feat<u32>,
    /// immediate, external, bus
    pub trigger_source: Feat<String>,
    feats: FeatSet,
}

impl Ks33220aDriver {
    pub fn connection_defaults() -> ConnectionDefaults {
        ConnectionDefaults::new(
            SerialSettings::new(57_600),
            TransportOptions::default()
                .with_termination("\n", b'\n')
                .with_timeout(Duration::from_secs(5)),
        )
    }

    pub fn with_transport(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);

        let shapes = ValueMap::strings([
            ("sine", "SIN"),
            ("square", "SQU"),
            ("ramp", "RAMP"),
            ("pulse", "PULS"),
            ("noise", "NOIS"),
            ("dc", "DC"),
            ("user", "USER"),
        ]);
        let function = choice(&t, "function", "FUNC", shapes);

        let frequency = Feat::<f64>::new("frequency")
            .with_unit(units::HERTZ)
            .with_limits(Limits::new(1e-6, MAX_FREQUENCY_HZ))
            .with_reader(bind::reader(&t, "FREQ?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |f: &f64| Ok(format!("FREQ {f:E}"))));

        let amplitude = Feat::<f64>::new("amplitude")
            .describe("Output amplitude into the configured load")
            .with_unit(units::VOLT)
            .with_limits(Limits::new(0.01, 10.0))
            .with_reader(bind::reader(&t, "VOLT?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |v: &f64| Ok(format!("VOLT {v:E}"))));

        let offset = Feat::<f64>::new("offset")
            .with_unit(units::VOLT)
            .with_limits(Limits::new(-5.0, 5.0))
            .with_reader(bind::reader(&t, "VOLT:OFFS?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |v: &f64| Ok(format!("VOLT:OFFS {v:E}"))));

        let amplitude_unit = choice(
            &t,
            "amplitude_unit",
            "VOLT:UNIT",
            ValueMap::strings([("vpp", "VPP"), ("vrms", "VRMS"), ("dbm", "DBM")]),
        );

        let output = toggle(&t, "output", "OUTP");

        let load = Feat::<f64>::new("load")
            .describe("Expected load impedance in ohms (inf for high Z)")
            .with_validator(|ohms: &f64| {
                if ohms.is_infinite() || (1.0..=10_000.0).contains(ohms) {
                    Ok(())
                } else {
                    Err(LabError::OutOfRange {
                        feat: "load".into(),
                        value: *ohms,
                        min: 1.0,
                        max: 10_000.0,
                    })
                }
            })
            .with_reader(bind::reader(&t, "OUTP:LOAD?", parse_load))
            .with_writer(bind::writer(&t, |ohms: &f64| {
                Ok(if ohms.is_infinite() {
                    "OUTP:LOAD INF".to_string()
                } else {
                    format!("OUTP:LOAD {ohms:E}")
                })
            }));

        let duty_cycle = Feat::<f64>::new("duty_cycle")
            .with_unit(units::PERCENT)
            .with_limits(Limits::new(20.0, 80.0))
            .with_reader(bind::reader(&t, "FUNC:SQU:DCYC?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |d: &f64| Ok(format!("FUNC:SQU:DCYC {d}"))));

        let burst_enabled = toggle(&t, "burst_enabled", "BURS:STAT");

        let burst_cycles = Feat::<u32>::new("burst_cycles")
            .with_limits(Limits::new(1.0, 50_000.0).with_step(1.0))
            .with_reader(bind::reader(&t, "BURS:NCYC?", |r: &str| {
                // Replies in floating point, e.g. +1.000000E+00
                bind::number::<f64>(r).map(|n| n.round() as u32)
            }))
            .with_writer(bind::writer(&t, |n: &u32| Ok(format!("BURS:NCYC {n}"))));

        let trigger_source = choice(
            &t,
            "trigger_source",
            "TRIG:SOUR",
            ValueMap::strings([("immediate", "IMM"), ("external", "EXT"), ("bus", "BUS")]),
        );

        let mut feats = FeatSet::new();
        feats
            .register(function.clone())
            .register(frequency.clone())
            .register(amplitude.clone())
            .register(offset.clone())
            .register(amplitude_unit.clone())
            .register(output.clone())
            .register(load.clone())
            .register(duty_cycle.clone())
            .register(burst_enabled.clone())
            .register(burst_cycles.clone())
            .register(trigger_source.clone());

        let apply_port = Arc::clone(&t);
        let applied = (
            function.clone(),
            frequency.clone(),
            amplitude.clone(),
            offset.clone(),
            output.clone(),
        );
        feats.register_action(
            Action::new("apply", move |args| {
                let t = Arc::clone(&apply_port);
                let (function, frequency, amplitude, offset, output) = applied.clone();
                Box::pin(async move {
                    let args: ApplyArgs = Action::args(args)?;
                    t.write(&apply_command(&args)?).await?;
                    scpi::check_errors(&t).await?;
                    for feat in [&frequency, &amplitude, &offset] {
                        feat.invalidate();
                    }
                    function.invalidate();
                    output.invalidate();
                    Ok(Value::Null)
                })
            })
            .describe("Set function, frequency, amplitude and offset and enable the output"),
        );

        let trigger_port = Arc::clone(&t);
        feats.register_action(
            Action::new("trigger", move |_| {
                let t = Arc::clone(&trigger_port);
                Box::pin(async move {
                    t.write("*TRG").await?;
                    Ok(Value::Null)
                })
            })
            .describe("Bus trigger"),
        );

        Self {
            transport: t,
            function,
            frequency,
            amplitude,
            offset,
            amplitude_unit,
            output,
            load,
            duty_cycle,
            burst_enabled,
            burst_cycles,
            trigger_source,
            feats,
        }
    }

    /// Drain `SYST:ERR?`, failing with every queued message.
    pub async fn check_errors(&self) -> Result<()> {
        scpi::check_errors(&self.transport).await
    }
}

/// `OUTP:LOAD?` answers 9.9E+37 for high impedance.
fn parse_load(reply: &str) -> Result<f64> {
    let ohms: f64 = bind::number(reply)?;
    Ok(if ohms >= 9.9e37 { f64::INFINITY } else { ohms })
}

fn choice(
    t: &Arc<MessageTransport>,
    name: &'static str,
    header: &'static str,
    map: ValueMap<String>,
) -> Feat<String> {
    let read_map = map.clone();
    let write_map = map.clone();
    Feat::<String>::new(name)
        .with_values(&map)
        .with_reader(bind::reader(t, format!("{header}?"), move |r: &str| {
            read_map.from_wire(name, r)
        }))
        .with_writer(bind::writer(t, move |v: &String| {
            Ok(format!("{header} {}", write_map.to_wire(name, v)?))
        }))
}

fn toggle(t: &Arc<MessageTransport>, name: &'static str, header: &'static str) -> Feat<bool> {
    Feat::<bool>::new(name)
        .with_reader(bind::reader(t, format!("{header}?"), bind::flag))
        .with_writer(bind::writer(t, move |on: &bool| {
            Ok(format!("{header} {}", if *on { "ON" } else { "OFF" }))
        }))
}

#[async_trait]
impl Instrument for Ks33220aDriver {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    fn category(&self) -> Option<DeviceCategory> {
        Some(DeviceCategory::FunctionGenerator)
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn initialize(&self) -> Result<()> {
        let idn = scpi::identify(&self.transport, "33220A").await?;
        self.check_errors().await?;
        tracing::info!(device = %self.name(), idn = %idn, "33220A ready");
        Ok(())
    }

    #[instrument(skip(self), fields(device = %self.name()), err)]
    async fn finalize(&self) -> Result<()> {
        self.output.set_forced(false).await
    }
}

#[async_trait]
impl Triggerable for Ks33220aDriver {
    async fn arm(&self) -> Result<()> {
        self.trigger_source.set_forced("bus".to_string()).await?;
        self.burst_enabled.set_forced(true).await?;
        self.check_errors().await
    }

    async fn trigger(&self) -> Result<()> {
        self.transport.write("*TRG").await
    }

    async fn is_armed(&self) -> Result<bool> {
        Ok(self.burst_enabled.refresh().await?
            && self.trigger_source.refresh().await? == "bus")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lab_core::mock::{MockInstrument, MockLog};
    use serde_json::json;

    fn generator(mock: MockInstrument) -> (Ks33220aDriver, MockLog) {
        let (t, log) = mock
            .reply_terminator("\n")
            .on("SYST:ERR?", "+0,\"No error\"")
            .spawn_transport("33220A", Ks33220aDriver::connection_defaults().options);
        (Ks33220aDriver::with_transport(t), log)
    }

    #[test]
    fn apply_command_trims_defaults() {
        let args = ApplyArgs {
            function: Waveshape::Square,
            frequency: Some(1000.0),
            amplitude: Some(2.5),
            offset: None,
        };
        assert_eq!(apply_command(&args).unwrap(), "APPL:SQU 1E3,2.5E0");

        let args = ApplyArgs {
            function: Waveshape::Noise,
            frequency: None,
            amplitude: None,
            offset: Some(0.1),
        };
        assert_eq!(apply_command(&args).unwrap(), "APPL:NOIS DEF,DEF,1E-1");

        let args = ApplyArgs {
            function: Waveshape::Dc,
            frequency: None,
            amplitude: None,
            offset: None,
        };
        assert_eq!(apply_command(&args).unwrap(), "APPL:DC");
    }

    #[tokio::test]
    async fn apply_action_checks_error_queue() {
        let (gen, log) = generator(MockInstrument::new());
        gen.feats()
            .call(
                "apply",
                json!({ "function": "sine", "frequency": 1e6, "amplitude": 1.0 }),
            )
            .await
            .unwrap();
        assert_eq!(log.commands(), vec!["APPL:SIN 1E6,1E0", "SYST:ERR?"]);
    }

    #[tokio::test]
    async fn queued_errors_fail() {
        let (gen, _log) = generator(
            MockInstrument::new()
                .reply_terminator("\n")
                .on("SYST:ERR?", "-222,\"Data out of range\"")
                .on("SYST:ERR?", "+0,\"No error\""),
        );
        let err = gen.check_errors().await.unwrap_err();
        assert!(err.to_string().contains("Data out of range"));
    }

    #[tokio::test]
    async fn frequency_limits_checked_before_io() {
        let (gen, log) = generator(MockInstrument::new());
        assert!(matches!(
            gen.frequency.set(25e6).await,
            Err(LabError::OutOfRange { .. })
        ));
        assert!(matches!(
            gen.duty_cycle.set(90.0).await,
            Err(LabError::OutOfRange { .. })
        ));
        assert!(log.commands().is_empty());
    }

    #[tokio::test]
    async fn function_maps_wire_names() {
        let (gen, log) = generator(MockInstrument::new().on("FUNC?", "RAMP"));
        assert_eq!(gen.function.get().await.unwrap(), "ramp");
        gen.function.set("pulse".into()).await.unwrap();
        assert!(gen.function.set("triangle".into()).await.is_err());
        assert_eq!(log.commands(), vec!["FUNC?", "FUNC PULS"]);
    }

    #[tokio::test]
    async fn load_high_impedance() {
        let (gen, log) = generator(MockInstrument::new().on("OUTP:LOAD?", "9.9E+37"));
        assert!(gen.load.get().await.unwrap().is_infinite());
        gen.load.set(50.0).await.unwrap();
        gen.load.set(f64::INFINITY).await.unwrap();
        assert!(gen.load.set(0.5).await.is_err());
        assert_eq!(
            log.commands(),
            vec!["OUTP:LOAD?", "OUTP:LOAD 5E1", "OUTP:LOAD INF"]
        );
    }

    #[tokio::test]
    async fn arm_selects_bus_triggered_burst() {
        let (gen, log) = generator(
            MockInstrument::new()
                .on("BURS:STAT?", "1")
                .on("TRIG:SOUR?", "BUS"),
        );
        gen.arm().await.unwrap();
        assert!(gen.is_armed().await.unwrap());
        gen.trigger().await.unwrap();
        assert_eq!(
            log.commands(),
            vec![
                "TRIG:SOUR BUS",
                "BURS:STAT ON",
                "SYST:ERR?",
                "BURS:STAT?",
                "TRIG:SOUR?",
                "*TRG"
            ]
        );
    }

    #[tokio::test]
    async fn arm_rewrites_burst_setup_every_time() {
        let (gen, log) = generator(MockInstrument::new());
        gen.arm().await.unwrap();
        gen.arm().await.unwrap();
        assert_eq!(log.count("TRIG:SOUR BUS"), 2);
        assert_eq!(log.count("BURS:STAT ON"), 2);
    }
}
