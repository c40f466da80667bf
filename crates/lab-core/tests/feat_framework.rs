//! End-to-end exercise of the descriptor framework against a scripted
//! instrument: typed feats, keyed feats, actions, JSON access with
//! quantities, and the scoped lifecycle.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lab_core::mock::{MockInstrument, MockLog};
use lab_core::{
    bind, scoped, units, Action, DictFeat, Feat, FeatSet, Instrument, LabError, Limits,
    MessageTransport, Result, TransportOptions, ValueMap,
};
use serde_json::json;

struct Generator {
    transport: Arc<MessageTransport>,
    frequency: Feat<f64>,
    output: Feat<bool>,
    offset: DictFeat<u8, f64>,
    feats: FeatSet,
}

impl Generator {
    fn new(transport: MessageTransport) -> Self {
        let t = Arc::new(transport);
        let on_off = ValueMap::on_off();

        let frequency = Feat::<f64>::new("frequency")
            .with_unit(units::HERTZ)
            .with_limits(Limits::new(1e-6, 20e6))
            .with_reader(bind::reader(&t, "FREQ?", bind::number::<f64>))
            .with_writer(bind::writer(&t, |hz: &f64| Ok(format!("FREQ {hz}"))));

        let output = Feat::<bool>::new("output")
            .with_values(&on_off)
            .with_reader(bind::reader(&t, "OUTP?", bind::flag))
            .with_writer(bind::writer(&t, move |on: &bool| {
                Ok(format!("OUTP {}", on_off.to_wire("output", on)?))
            }));

        let offset = DictFeat::<u8, f64>::new("offset")
            .with_keys([1, 2])
            .with_unit(units::VOLT)
            .with_limits(Limits::new(-5.0, 5.0))
            .with_reader(bind::keyed_reader(
                &t,
                |ch: &u8| format!("SOUR{ch}:VOLT:OFFS?"),
                bind::number::<f64>,
            ))
            .with_writer(bind::keyed_writer(&t, |ch: &u8, v: &f64| {
                Ok(format!("SOUR{ch}:VOLT:OFFS {v}"))
            }));

        let mut feats = FeatSet::new();
        feats
            .register(frequency.clone())
            .register(output.clone())
            .register(offset.clone());
        let trigger = Arc::clone(&t);
        feats.register_action(Action::new("trigger", move |_| {
            let t = Arc::clone(&trigger);
            Box::pin(async move {
                t.write("*TRG").await?;
                Ok(serde_json::Value::Null)
            })
        }));

        Self {
            transport: t,
            frequency,
            output,
            offset,
            feats,
        }
    }
}

#[async_trait]
impl Instrument for Generator {
    fn name(&self) -> &str {
        self.transport.name()
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    async fn initialize(&self) -> Result<()> {
        self.transport.write("*CLS").await
    }

    async fn finalize(&self) -> Result<()> {
        self.output.set_forced(false).await
    }
}

fn generator() -> (Generator, MockLog) {
    let (transport, log) = MockInstrument::new()
        .on("FREQ?", "1.000000000000E+03")
        .on("OUTP?", "1")
        .on("SOUR2:VOLT:OFFS?", "-2.5E-01")
        .spawn_transport(
            "33220A",
            TransportOptions::default()
                .with_termination("\n", b'\n')
                .with_timeout(Duration::from_millis(300)),
        );
    (Generator::new(transport), log)
}

const WAIT: Duration = Duration::from_secs(1);

#[tokio::test]
async fn typed_feats_read_and_write_literal_commands() {
    let (gen, log) = generator();

    assert_eq!(gen.frequency.get().await.unwrap(), 1000.0);
    assert!(gen.output.get().await.unwrap());
    assert_eq!(gen.offset.get(2).await.unwrap(), -0.25);

    gen.offset.set(1, 1.5).await.unwrap();
    assert!(log.wait_for("SOUR1:VOLT:OFFS 1.5", WAIT).await);
}

#[tokio::test]
async fn validation_happens_before_any_write() {
    let (gen, log) = generator();

    let err = gen.frequency.set(30e6).await.unwrap_err();
    assert!(matches!(err, LabError::OutOfRange { .. }));

    let err = gen.offset.set(3, 0.0).await.unwrap_err();
    assert!(matches!(err, LabError::InvalidKey { .. }));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.commands().is_empty());
}

#[tokio::test]
async fn json_access_converts_quantities() {
    let (gen, log) = generator();

    gen.feats
        .set_json("frequency", None, json!("2 kHz"))
        .await
        .unwrap();
    assert!(log.wait_for("FREQ 2000", WAIT).await);
    assert_eq!(gen.frequency.cached(), Some(2000.0));

    gen.feats
        .set_json("offset", Some("1"), json!("-100 mV"))
        .await
        .unwrap();
    assert!(log.wait_for("SOUR1:VOLT:OFFS -0.1", WAIT).await);

    let err = gen
        .feats
        .set_json("offset", None, json!(0.0))
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::MissingKey { .. }));

    let err = gen
        .feats
        .set_json("frequency", None, json!("3 V"))
        .await
        .unwrap_err();
    assert!(matches!(err, LabError::IncompatibleUnits { .. }));
}

#[tokio::test]
async fn snapshot_and_describe() {
    let (gen, _log) = generator();

    let snapshot = gen.feats.snapshot().await;
    assert_eq!(snapshot.get("frequency"), Some(&json!(1000.0)));
    assert_eq!(snapshot.get("output"), Some(&json!(true)));
    // Keyed feats are not part of a snapshot
    assert!(!snapshot.contains_key("offset"));

    let described = serde_json::to_value(gen.feats.describe()).unwrap();
    let names: Vec<&str> = described
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|f| f["name"].as_str())
        .collect();
    assert_eq!(names, vec!["frequency", "output", "offset", "trigger"]);
    assert_eq!(described[2]["kind"], "dict_feat");
    assert_eq!(described[2]["keys"], json!(["1", "2"]));
    assert_eq!(described[0]["unit"], "Hz");
}

#[tokio::test]
async fn scoped_runs_lifecycle_around_body() {
    let (gen, log) = generator();
    let gen = Arc::new(gen);

    let result: Result<()> = scoped(gen.clone(), |g| async move {
        g.feats.call("trigger", serde_json::Value::Null).await?;
        Err(LabError::instrument("33220A", "body failed"))
    })
    .await;

    assert!(matches!(result, Err(LabError::Instrument { .. })));
    assert!(log.wait_for("OUTP 0", WAIT).await);
    assert_eq!(log.commands(), vec!["*CLS", "*TRG", "OUTP 0"]);
}
