//! `DictFeat<K, T>` - a feat parameterized by a channel key.
//!
//! Channels, axes, wheels, outlets and inputs are all addressed through a
//! key. The key set may be fixed (`[1, 2, 3]` axes) or open, in which case
//! any key that parses is forwarded to the device.

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::str::FromStr;
use std::sync::Arc;

use futures::future::BoxFuture;
use parking_lot::Mutex;

use crate::error::{LabError, Result};
use crate::feat::{Coercer, FeatSpec, FeatValue};
use crate::limits::{LimitValue, Limits};
use crate::units::Unit;
use crate::value_map::ValueMap;

/// Bound satisfied by channel key types.
pub trait FeatKey:
    Clone + Eq + Hash + Debug + Display + FromStr + Send + Sync + 'static
{
}

impl<K> FeatKey for K where
    K: Clone + Eq + Hash + Debug + Display + FromStr + Send + Sync + 'static
{
}

type KeyedReader<K, T> = Arc<dyn Fn(K) -> BoxFuture<'static, Result<T>> + Send + Sync>;
type KeyedWriter<K, T> = Arc<dyn Fn(K, T) -> BoxFuture<'static, Result<()>> + Send + Sync>;

#[derive(Clone)]
pub struct DictFeat<K: FeatKey, T: FeatValue> {
    spec: FeatSpec,
    keys: Vec<K>,
    coercers: Vec<Coercer<T>>,
    reader: Option<KeyedReader<K, T>>,
    writer: Option<KeyedWriter<K, T>>,
    cache: Arc<Mutex<HashMap<K, T>>>,
}

impl<K: FeatKey, T: FeatValue> DictFeat<K, T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            spec: FeatSpec::new(name),
            keys: Vec::new(),
            coercers: Vec::new(),
            reader: None,
            writer: None,
            cache: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Fix the set of valid keys. Without this any key is accepted.
    pub fn with_keys(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.keys = keys.into_iter().collect();
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.spec.description = Some(description.into());
        self
    }

    pub fn with_unit(mut self, unit: Unit) -> Self {
        self.spec.unit = Some(unit);
        self
    }

    pub fn read_once(mut self) -> Self {
        self.spec.read_once = true;
        self
    }

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
        reader: impl Fn(K) -> BoxFuture<'static, Result<T>> + Send + Sync + 'static,
    ) -> Self {
        self.reader = Some(Arc::new(reader));
        self.spec.readable = true;
        self
    }

    pub fn with_writer(
        mut self,
        writer: impl Fn(K, T) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
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

    pub fn keys(&self) -> &[K] {
        &self.keys
    }

    pub fn cached(&self, key: &K) -> Option<T> {
        self.cache.lock().get(key).cloned()
    }

    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }

    /// Reject keys outside a fixed key set.
    pub fn check_key(&self, key: &K) -> Result<()> {
        if self.keys.is_empty() || self.keys.contains(key) {
            Ok(())
        } else {
            Err(LabError::InvalidKey {
                feat: self.spec.name.clone(),
                key: key.to_string(),
                keys: self.key_labels(),
            })
        }
    }

    pub fn key_labels(&self) -> Vec<String> {
        self.keys.iter().map(ToString::to_string).collect()
    }

    /// Parse a key from text (CLI/JSON) and check it.
    pub fn parse_key(&self, text: &str) -> Result<K> {
        let key = text.trim().parse::<K>().map_err(|_| LabError::InvalidKey {
            feat: self.spec.name.clone(),
            key: text.to_string(),
            keys: self.key_labels(),
        })?;
        self.check_key(&key)?;
        Ok(key)
    }

    pub async fn get(&self, key: K) -> Result<T> {
        self.check_key(&key)?;
        if self.spec.read_once {
            if let Some(v) = self.cached(&key) {
                return Ok(v);
            }
        }
        match &self.reader {
            Some(reader) => {
                let value = reader(key.clone()).await?;
                tracing::trace!(feat = %self.spec.name, key = %key, value = ?value, "feat read");
                self.cache.lock().insert(key, value.clone());
                Ok(value)
            }
            None => self.cached(&key).ok_or_else(|| LabError::NotReadable {
                feat: format!("{}[{}]", self.spec.name, key),
            }),
        }
    }

    pub async fn set(&self, key: K, value: T) -> Result<()> {
        self.write(key, value, false).await
    }

    pub async fn set_forced(&self, key: K, value: T) -> Result<()> {
        self.write(key, value, true).await
    }

    async fn write(&self, key: K, value: T, force: bool) -> Result<()> {
        self.check_key(&key)?;
        let writer = self.writer.as_ref().ok_or_else(|| LabError::ReadOnly {
            feat: self.spec.name.clone(),
        })?;
        let value = self
            .coercers
            .iter()
            .try_fold(value, |v, c| c(&self.spec.name, v))?;

        if !force && self.cached(&key).as_ref() == Some(&value) {
            return Ok(());
        }

        writer(key.clone(), value.clone()).await?;
        tracing::debug!(feat = %self.spec.name, key = %key, value = ?value, "feat set");
        self.cache.lock().insert(key, value);
        Ok(())
    }
}

impl<K: FeatKey, T: FeatValue + LimitValue> DictFeat<K, T> {
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.spec.limits = Some(limits);
        self.coercers.push(Arc::new(move |feat: &str, value: T| {
            limits.check(feat, value.to_f64()).map(T::from_f64)
        }));
        self
    }
}
