use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use lab_core::{
    Capability, DeviceComponents, DriverFactory, Feat, FeatSet, Instrument, LabError, Readable,
};
use lab_hardware::{DeviceConfig, DeviceRegistry, HardwareConfig, RegistryError};

type Events = Arc<Mutex<Vec<String>>>;

struct RecordingMeter {
    id: String,
    reading: f64,
    fail_init: bool,
    fail_finalize: bool,
    events: Events,
    feats: FeatSet,
}

impl RecordingMeter {
    fn new(id: String, reading: f64, events: Events) -> Self {
        let power = Feat::<f64>::new("power").with_reader(move || -> BoxFuture<'static, lab_core::Result<f64>> {
            Box::pin(async move { Ok(reading) })
        });
        let mut feats = FeatSet::new();
        feats.register(power);
        Self {
            id,
            reading,
            fail_init: false,
            fail_finalize: false,
            events,
            feats,
        }
    }

    fn record(&self, event: &str) {
        self.events.lock().unwrap().push(format!("{}:{event}", self.id));
    }
}

#[async_trait]
impl Instrument for RecordingMeter {
    fn name(&self) -> &str {
        &self.id
    }

    fn feats(&self) -> &FeatSet {
        &self.feats
    }

    async fn initialize(&self) -> lab_core::Result<()> {
        self.record("initialize");
        if self.fail_init {
            return Err(LabError::instrument(&self.id, "no reply"));
        }
        Ok(())
    }

    async fn finalize(&self) -> lab_core::Result<()> {
        self.record("finalize");
        if self.fail_finalize {
            return Err(LabError::instrument(&self.id, "port gone"));
        }
        Ok(())
    }
}

#[async_trait]
impl Readable for RecordingMeter {
    async fn read(&self) -> lab_core::Result<f64> {
        Ok(self.reading)
    }
}

#[derive(serde::Deserialize)]
struct MeterConfig {
    id: String,
    reading: f64,
    #[serde(default)]
    fail_init: bool,
    #[serde(default)]
    fail_finalize: bool,
}

struct RecordingFactory {
    events: Events,
}

static METER_CAPABILITIES: &[Capability] = &[Capability::Readable];

impl DriverFactory for RecordingFactory {
    fn driver_type(&self) -> &'static str {
        "recording_meter"
    }

    fn name(&self) -> &'static str {
        "Recording Meter"
    }

    fn capabilities(&self) -> &'static [Capability] {
        METER_CAPABILITIES
    }

    fn validate(&self, config: &toml::Value) -> Result<()> {
        let cfg: MeterConfig = lab_core::parse_config(self.driver_type(), config)?;
        if !cfg.reading.is_finite() {
            anyhow::bail!("reading must be finite");
        }
        Ok(())
    }

    fn build(&self, config: toml::Value) -> BoxFuture<'static, Result<DeviceComponents>> {
        let events = Arc::clone(&self.events);
        Box::pin(async move {
            let cfg: MeterConfig = lab_core::parse_config("recording_meter", &config)?;
            let mut meter = RecordingMeter::new(cfg.id, cfg.reading, events);
            meter.fail_init = cfg.fail_init;
            meter.fail_finalize = cfg.fail_finalize;
            let meter = Arc::new(meter);
            Ok(DeviceComponents::new()
                .with_instrument(meter.clone())
                .with_readable(meter))
        })
    }
}

fn meter_config(id: &str, extra: &str) -> DeviceConfig {
    let table: toml::Value = toml::from_str(&format!("id = \"{id}\"\nreading = 1.5\n{extra}")).unwrap();
    DeviceConfig::new(id, "recording_meter", table)
}

fn registry() -> (DeviceRegistry, Events) {
    let events = Events::default();
    let mut registry = DeviceRegistry::new();
    registry
        .register_factory(Box::new(RecordingFactory {
            events: Arc::clone(&events),
        }))
        .unwrap();
    (registry, events)
}

#[tokio::test]
async fn register_initializes_and_exposes_capabilities() {
    let (mut registry, events) = registry();
    registry
        .register(meter_config("meter", "").with_name("Bench meter"))
        .await
        .unwrap();

    assert!(registry.contains("meter"));
    assert_eq!(registry.len(), 1);
    assert_eq!(*events.lock().unwrap(), vec!["meter:initialize".to_string()]);

    let info = registry.get_device_info("meter").unwrap();
    assert_eq!(info.name, "Bench meter");
    assert_eq!(info.capabilities, vec![Capability::Readable]);

    let reading = registry.get_readable("meter").unwrap().read().await.unwrap();
    assert_eq!(reading, 1.5);
    assert!(registry.get_movable("meter").is_none());
    assert_eq!(
        registry.devices_with_capability(Capability::Readable),
        vec!["meter".to_string()]
    );
}

#[tokio::test]
async fn duplicate_registration_fails() {
    let (mut registry, _events) = registry();
    registry.register(meter_config("meter", "")).await.unwrap();
    let result = registry.register(meter_config("meter", "")).await;
    assert!(matches!(result, Err(RegistryError::DuplicateId(_))));
}

#[tokio::test]
async fn failed_initialize_is_not_registered() {
    let (mut registry, _events) = registry();
    let result = registry
        .register(meter_config("meter", "fail_init = true"))
        .await;
    assert!(matches!(result, Err(RegistryError::Initialize { .. })));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn unknown_driver_lists_available() {
    let (mut registry, _events) = registry();
    let err = registry
        .register(DeviceConfig::new("x", "nonexistent", toml::Value::Table(Default::default())))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("recording_meter"));
}

#[tokio::test]
async fn unregister_finalizes() {
    let (mut registry, events) = registry();
    registry.register(meter_config("meter", "")).await.unwrap();
    assert!(registry.unregister("meter").await);
    assert!(!registry.contains("meter"));
    assert!(!registry.unregister("meter").await);
    assert_eq!(events.lock().unwrap().last().unwrap(), "meter:finalize");
}

#[tokio::test]
async fn snapshot_reads_every_device() {
    let (mut registry, _events) = registry();
    registry.register(meter_config("a", "")).await.unwrap();
    registry.register(meter_config("b", "")).await.unwrap();
    let snapshot = registry.snapshot_all().await;
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot["a"]["power"], serde_json::json!(1.5));
}

#[tokio::test]
async fn shutdown_finalizes_all_and_reports_failures() {
    let (mut registry, events) = registry();
    registry
        .register(meter_config("a", "fail_finalize = true"))
        .await
        .unwrap();
    registry.register(meter_config("b", "")).await.unwrap();

    let err = registry.shutdown().await.unwrap_err();
    assert!(err.to_string().contains("a: "));
    assert!(registry.is_empty());
    let events = events.lock().unwrap();
    assert!(events.contains(&"a:finalize".to_string()));
    assert!(events.contains(&"b:finalize".to_string()));
}

#[tokio::test]
async fn register_all_validates_before_building() {
    let (mut registry, events) = registry();
    let config = HardwareConfig::from_toml_str(
        r#"
        [[devices]]
        id = "good"
        driver = "recording_meter"
        config = { id = "good", reading = 1.0 }

        [[devices]]
        id = "bad"
        driver = "recording_meter"
        config = { id = "bad" }

        [[devices]]
        id = "typo"
        driver = "recording_metre"
    "#,
    )
    .unwrap();

    let err = registry.register_all(&config).await.unwrap_err().to_string();
    assert!(err.contains("Hardware configuration validation failed"));
    assert!(err.contains("bad"));
    assert!(err.contains("typo"));
    assert!(registry.is_empty());
    assert!(events.lock().unwrap().is_empty());
}

#[tokio::test]
async fn register_all_continues_past_runtime_failures() {
    let (mut registry, _events) = registry();
    let config = HardwareConfig::from_toml_str(
        r#"
        [[devices]]
        id = "flaky"
        driver = "recording_meter"
        config = { id = "flaky", reading = 1.0, fail_init = true }

        [[devices]]
        id = "steady"
        driver = "recording_meter"
        config = { id = "steady", reading = 2.0 }

        [[devices]]
        id = "spare"
        driver = "recording_meter"
        enabled = false
        config = { id = "spare", reading = 3.0 }
    "#,
    )
    .unwrap();

    assert_eq!(registry.register_all(&config).await.unwrap(), 1);
    assert_eq!(
        registry
            .list_devices()
            .into_iter()
            .map(|d| d.id)
            .collect::<Vec<_>>(),
        vec!["steady".to_string()]
    );
}

#[tokio::test]
async fn default_factories_validate_vendor_configs() {
    let registry = DeviceRegistry::with_default_factories();
    assert!(registry.drivers().iter().any(|d| d.driver_type == "sr830"));

    let missing_connection = DeviceConfig::new("lockin", "sr830", toml::Value::Table(Default::default()));
    assert!(matches!(
        registry.validate(&missing_connection),
        Err(RegistryError::Driver { .. })
    ));

    let switch: toml::Value = toml::from_str("url = \"http://10.0.0.5\"").unwrap();
    registry
        .validate(&DeviceConfig::new("switch", "ippower9258", switch))
        .unwrap();
}
