//! `Feat<T>` - a device-backed attribute.
//!
//! A feat pairs a getter command and a setter command on an instrument with
//! declarative metadata (unit, limits, enumerated values) and a cache of the
//! last known value. It follows the same composition as a hardware-connected
//! parameter: validation first, then the device write, then the cache update.
//!
//! ```rust,ignore
//! let transport = Arc::new(transport);
//! let wavelength = Feat::<f64>::new("wavelength")
//!     .with_unit(units::NANOMETER)
//!     .with_limits(Limits::new(300.0, 1100.0).with_step(1.0))
//!     .with_reader({
//!         let t = transport.clone();
//!         move || {
//!             let t = t.clone();
//!             Box::pin(async move { t.query_parse::<f64>("W?").await })
//!         }
//!     })
//!     .with_writer({
//!         let t = transport.clone();
//!         move |nm| {
//!             let t = t.clone();
//!             Box::pin(async move { t.write(&format!("W{:04}", nm as u32)).await })
//!         }
//!     });
//!
//! wavelength.set(800.0).await?;     // validates, writes "W0800", caches
//! wavelength.set(800.0).await?;     // cached, no device write
//! let nm = wavelength.get().await?; // queries "W?"
//! ```
//!
//! # Data Flow
//!
//! ```text
//! feat.set(value)
//!         │
//!         ▼
//!  1. coerce: limits (NaN/range/step), value map, validators
//!         │ (fails here if invalid, device untouched)
//!         ▼
//!  2. equal to cached value? → return without writing
//!         │
//!         ▼
//!  3. writer(value)            (fails here leaves cache unchanged)
//!         │
//!         ▼
//!  4. cache ← value, notify subscribers
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::{LabError, Result};
use crate::limits::{LimitValue, Limits};
use crate::units::Unit;
use crate::value_map::ValueMap;

/// Bound satisfied by every feat value type.
pub trait FeatValue:
    Clone + Send + Sync + PartialEq + Debug + Serialize + DeserializeOwned + 'static
{
}

impl<T> FeatValue for T where
    T: Clone + Send + Sync + PartialEq + Debug + Serialize + DeserializeOwned + 'static
{
}

pub(crate) type Reader<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;
pub(crate) type Writer<T> = Arc<dyn Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync>;
pub(crate) type Coercer<T> = Arc<dyn Fn(&str, T) -> Result<T> + Send + Sync>;

/// Declarative metadata, fixed per driver type.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FeatSpec {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<Unit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limits: Option<Limits>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub choices: Vec<String>,
    /// Read from the device at most once; later reads hit the cache.
    pub read_once: bool,
    pub readable: bool,
    pub writable: bool,
}

impl FeatSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// Typed device-backed attribute. Cloning shares the cache.
#[derive(Clone)]
pub struct Feat<T: FeatValue> {
    spec: FeatSpec,
    coercers: Vec<Coercer<T>>,
    reader: Option<Reader<T>>,
    writer: Option<Writer<T>>,
    cache: Arc<watch::Sender<Option<T>>>,
}

impl<T: FeatValue> Feat<T> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            spec: FeatSpec::new(name),
            coercers: Vec::new(),
            reader: None,
            writer: None,
            cache: Arc::new(tx),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.spec.description = Some(description.into());
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.spec.unit = Some(unit);
        self
    }

    /// Only read from the device once (serial numbers, model limits).
    pub fn read_once(mut self) -> Self {
        self.spec.read_once = true;
        self
    }

    /// Restrict values to the logical side of `map`.
    pub fn with_values(mut self, map: &ValueMap<T>) -> Self {
        self.spec.choices = map.labels();
        let map = map.clone();
        self.coercers.push(Arc::new(move |feat: &str, value: T| {
            if map.contains(&value) {
                Ok(value)
            } else {
                Err(LabError::InvalidChoice {
                    feat: feat.to_string(),
                    value: format!("{value:?}"),
                    choices: map.labels(),
                })
            }
        }));
        self
    }

    /// Custom check run after limits and value maps.
    pub fn with_validator(
        mut self,
        validator: impl Fn(&T) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.coercers.push(Arc::new(move |_: &str, value: T| {
            validator(&value)?;
            Ok(value)
        }));
        self
    }

    pub fn with_reader(
        mut self,
        reader: impl Fn() -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    ) -> Self {
        self.reader = Some(Arc::new(reader));
        self.spec.readable = true;
        self
    }

    pub fn with_writer(
        mut self,
        writer: impl Fn(T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    ) -> Self {
        self.writer = Some(Arc::new(writer));
        self.spec.writable = true;
        self
    }

    pub fn spec(&self) -> &FeatSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Last value read from or written to the device.
    pub fn cached(&self) -> Option<T> {
        self.cache.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<T>> {
        self.cache.subscribe()
    }

    /// Forget the cached value, forcing the next `get` to hit the device.
    pub fn invalidate(&self) {
        self.cache.send_replace(None);
    }

    /// Current value.
    ///
    /// Read-once feats return the cache once populated. Write-only feats
    /// return the last value set.
    pub async fn get(&self) -> Result<T> {
        if self.spec.read_once {
            if let Some(v) = self.cached() {
                return Ok(v);
            }
        }
        match &self.reader {
            Some(_) => self.refresh().await,
            None => self.cached().ok_or_else(|| LabError::NotReadable {
                feat: self.spec.name.clone(),
            }),
        }
    }

    /// Read from the device unconditionally and update the cache.
    pub async fn refresh(&self) -> Result<T> {
        let reader = self.reader.as_ref().ok_or_else(|| LabError::NotReadable {
            feat: self.spec.name.clone(),
        })?;
        let value = reader().await?;
        tracing::trace!(feat = %self.spec.name, value = ?value, "feat read");
        self.cache.send_replace(Some(value.clone()));
        Ok(value)
    }

    /// Validate and write `value`, skipping the write if it equals the cache.
    pub async fn set(&self, value: T) -> Result<()> {
        self.write(value, false).await
    }

    /// Validate and write `value` even if it equals the cache.
    pub async fn set_forced(&self, value: T) -> Result<()> {
        self.write(value, true).await
    }

    /// Apply the coercion chain without touching the device.
    pub fn coerce(&self, value: T) -> Result<T> {
        self.coercers
            .iter()
            .try_fold(value, |v, c| c(&self.spec.name, v))
    }

    async fn write(&self, value: T, force: bool) -> Result<()> {
        let writer = self.writer.as_ref().ok_or_else(|| LabError::ReadOnly {
            feat: self.spec.name.clone(),
        })?;
        let value = self.coerce(value)?;

        let unchanged = !force && self.cache.borrow().as_ref() == Some(&value);
        if unchanged {
            tracing::trace!(feat = %self.spec.name, value = ?value, "unchanged, skipping write");
            return Ok(());
        }

        writer(value.clone()).await?;
        tracing::debug!(feat = %self.spec.name, value = ?value, "feat set");
        self.cache.send_replace(Some(value));
        Ok(())
    }
}

impl<T: FeatValue + LimitValue> Feat<T> {
    /// Numeric limits. Values are range-checked and quantized to the step.
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.spec.limits = Some(limits);
        self.coercers.push(Arc::new(move |feat: &str, value: T| {
            limits.check(feat, value.to_f64()).map(T::from_f64)
        }));
        self
    }
}

impl Feat<f64> {
    /// Restrict values to a numeric table.
    ///
    /// A value within float rounding of an entry is replaced by that entry
    /// before the choice check, so `"30 us"` selects `30e-6`.
    pub fn with_table(mut self, map: &ValueMap<f64>) -> Self {
        let table = map.clone();
        self.coercers.push(Arc::new(move |_: &str, value: f64| {
            Ok(table.snap(value).unwrap_or(value))
        }));
        self.with_values(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::units;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_feat(writes: Arc<AtomicUsize>) -> Feat<f64> {
        Feat::<f64>::new("wavelength")
            .with_unit(units::NANOMETER)
            .with_limits(Limits::new(300.0, 1100.0).with_step(1.0))
            .with_writer(move |_| {
                let writes = writes.clone();
                Box::pin(async move {
                    writes.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
    }

    #[tokio::test]
    async fn set_validates_before_writing() {
        let writes = Arc::new(AtomicUsize::new(0));
        let feat = counting_feat(writes.clone());

        let err = feat.set(1500.0).await.unwrap_err();
        assert!(matches!(err, LabError::OutOfRange { .. }));
        assert_eq!(writes.load(Ordering::SeqCst), 0);
        assert_eq!(feat.cached(), None);
    }

    #[tokio::test]
    async fn unchanged_value_skips_device_write() {
        let writes = Arc::new(AtomicUsize::new(0));
        let feat = counting_feat(writes.clone());

        feat.set(800.0).await.unwrap();
        feat.set(800.0).await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 1);

        feat.set_forced(800.0).await.unwrap();
        assert_eq!(writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn step_quantization_is_cached() {
        let feat = counting_feat(Arc::new(AtomicUsize::new(0)));
        feat.set(632.8).await.unwrap();
        assert_eq!(feat.cached(), Some(633.0));
        // Write-only feat returns last set value
        assert_eq!(feat.get().await.unwrap(), 633.0);
    }

    #[tokio::test]
    async fn failed_write_keeps_previous_cache() {
        let feat = Feat::<bool>::new("emission").with_writer(|on| {
            Box::pin(async move {
                if on {
                    Err(LabError::instrument("laser", "interlock open"))
                } else {
                    Ok(())
                }
            })
        });
        feat.set(false).await.unwrap();
        assert!(feat.set(true).await.is_err());
        assert_eq!(feat.cached(), Some(false));
    }

    #[tokio::test]
    async fn read_once_hits_device_once() {
        let reads = Arc::new(AtomicUsize::new(0));
        let counter = reads.clone();
        let feat = Feat::<String>::new("serial_number")
            .read_once()
            .with_reader(move || {
                let counter = counter.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok("SN12345".to_string())
                })
            });

        assert_eq!(feat.get().await.unwrap(), "SN12345");
        assert_eq!(feat.get().await.unwrap(), "SN12345");
        assert_eq!(reads.load(Ordering::SeqCst), 1);

        feat.refresh().await.unwrap();
        assert_eq!(reads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn read_only_and_unreadable() {
        let feat = Feat::<f64>::new("power").with_reader(|| Box::pin(async { Ok(1e-3) }));
        assert!(matches!(
            feat.set(1.0).await,
            Err(LabError::ReadOnly { .. })
        ));

        let write_only = Feat::<f64>::new("setpoint").with_writer(|_| Box::pin(async { Ok(()) }));
        assert!(matches!(
            write_only.get().await,
            Err(LabError::NotReadable { .. })
        ));
    }

    #[tokio::test]
    async fn value_map_restricts_choices() {
        let map = ValueMap::new([("slow".to_string(), "1"), ("fast".to_string(), "3")]);
        let feat = Feat::<String>::new("filter")
            .with_values(&map)
            .with_writer(|_| Box::pin(async { Ok(()) }));

        assert!(feat.set("fast".into()).await.is_ok());
        assert!(matches!(
            feat.set("medium".into()).await,
            Err(LabError::InvalidChoice { .. })
        ));
        assert_eq!(feat.spec().choices.len(), 2);
    }

    #[tokio::test]
    async fn table_values_snap_to_entries() {
        let map = ValueMap::indexed(&[10e-6, 30e-6, 100e-6]);
        let feat = Feat::<f64>::new("time_constant")
            .with_table(&map)
            .with_writer(|_| Box::pin(async { Ok(()) }));

        feat.set(2.9999999999999997e-5).await.unwrap();
        assert_eq!(feat.cached(), Some(30e-6));
        assert!(matches!(
            feat.set(20e-6).await,
            Err(LabError::InvalidChoice { .. })
        ));
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let feat = Feat::<u32>::new("position").with_writer(|_| Box::pin(async { Ok(()) }));
        let mut rx = feat.subscribe();
        feat.set(3).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Some(3));
    }
}
