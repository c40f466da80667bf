//! Type-erased registry of a driver's feats and actions.
//!
//! Drivers keep typed `Feat`/`DictFeat` fields for their own methods and
//! register clones (which share the cache) here, so the registry and CLI can
//! enumerate and drive them by name with JSON values.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Number, Value};

use crate::action::Action;
use crate::dict_feat::{DictFeat, FeatKey};
use crate::error::{LabError, Result};
use crate::feat::{Feat, FeatSpec, FeatValue};
use crate::units::{Dimension, Quantity};

/// Object-safe view of a `Feat` or `DictFeat`.
#[async_trait]
pub trait FeatAny: Send + Sync {
    fn spec(&self) -> &FeatSpec;

    /// Key labels for keyed feats, `None` for plain feats.
    fn key_labels(&self) -> Option<Vec<String>>;

    async fn get_json(&self, key: Option<&str>) -> Result<Value>;

    async fn set_json(&self, key: Option<&str>, value: Value) -> Result<()>;
}

#[async_trait]
impl<T: FeatValue> FeatAny for Feat<T> {
    fn spec(&self) -> &FeatSpec {
        Feat::spec(self)
    }

    fn key_labels(&self) -> Option<Vec<String>> {
        None
    }

    async fn get_json(&self, key: Option<&str>) -> Result<Value> {
        reject_key(self.name(), key)?;
        Ok(serde_json::to_value(self.get().await?)?)
    }

    async fn set_json(&self, key: Option<&str>, value: Value) -> Result<()> {
        reject_key(self.name(), key)?;
        let value = normalize_quantity(Feat::spec(self), value)?;
        let typed: T = serde_json::from_value(value)?;
        self.set(typed).await
    }
}

#[async_trait]
impl<K: FeatKey, T: FeatValue> FeatAny for DictFeat<K, T> {
    fn spec(&self) -> &FeatSpec {
        DictFeat::spec(self)
    }

    fn key_labels(&self) -> Option<Vec<String>> {
        Some(DictFeat::key_labels(self))
    }

    async fn get_json(&self, key: Option<&str>) -> Result<Value> {
        let key = self.parse_key(require_key(self, key)?)?;
        Ok(serde_json::to_value(self.get(key).await?)?)
    }

    async fn set_json(&self, key: Option<&str>, value: Value) -> Result<()> {
        let key = self.parse_key(require_key(self, key)?)?;
        let value = normalize_quantity(DictFeat::spec(self), value)?;
        let typed: T = serde_json::from_value(value)?;
        self.set(key, typed).await
    }
}

fn reject_key(feat: &str, key: Option<&str>) -> Result<()> {
    match key {
        None => Ok(()),
        Some(k) => Err(LabError::InvalidKey {
            feat: feat.to_string(),
            key: k.to_string(),
            keys: Vec::new(),
        }),
    }
}

fn require_key<'a, K: FeatKey, T: FeatValue>(
    feat: &DictFeat<K, T>,
    key: Option<&'a str>,
) -> Result<&'a str> {
    key.ok_or_else(|| LabError::MissingKey {
        feat: feat.name().to_string(),
        keys: feat.key_labels(),
    })
}

/// Convert a quantity string (`"50 mW"`) into a number in the feat's unit.
///
/// Strings that do not parse as a quantity are passed through untouched so
/// enumerated feats still receive their labels.
pub fn normalize_quantity(spec: &FeatSpec, value: Value) -> Result<Value> {
    let (Some(unit), Some(text)) = (spec.unit, value.as_str().map(str::to_owned)) else {
        return Ok(value);
    };
    let Ok(quantity) = Quantity::parse(&text) else {
        return Ok(value);
    };
    let magnitude = if quantity.unit.dimension == Dimension::Dimensionless {
        quantity.value
    } else {
        quantity.value_in(unit)?
    };
    let number = if magnitude.fract() == 0.0 && magnitude.abs() < 9.0e15 {
        Number::from(magnitude as i64)
    } else {
        Number::from_f64(magnitude).ok_or(LabError::InvalidQuantity(text))?
    };
    Ok(Value::Number(number))
}

/// Kind of registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatKind {
    Feat,
    DictFeat,
    Action,
}

/// Serializable description of one registry entry.
#[derive(Debug, Clone, Serialize)]
pub struct FeatInfo {
    pub kind: FeatKind,
    #[serde(flatten)]
    pub spec: FeatSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<Vec<String>>,
}

/// Ordered registry of feats and actions for one instrument.
#[derive(Default, Clone)]
pub struct FeatSet {
    feats: Vec<Arc<dyn FeatAny>>,
    actions: Vec<Action>,
}

impl FeatSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feat (a clone sharing its cache).
    pub fn register(&mut self, feat: impl FeatAny + 'static) -> &mut Self {
        let name = feat.spec().name.clone();
        self.feats.retain(|f| f.spec().name != name);
        self.feats.push(Arc::new(feat));
        self
    }

    pub fn register_action(&mut self, action: Action) -> &mut Self {
        self.actions.retain(|a| a.name() != action.name());
        self.actions.push(action);
        self
    }

    pub fn feat(&self, name: &str) -> Option<&dyn FeatAny> {
        self.feats
            .iter()
            .find(|f| f.spec().name == name)
            .map(|f| f.as_ref())
    }

    pub fn action(&self, name: &str) -> Option<&Action> {
        self.actions.iter().find(|a| a.name() == name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.feats
            .iter()
            .map(|f| f.spec().name.as_str())
            .chain(self.actions.iter().map(Action::name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.feats.len() + self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn describe(&self) -> Vec<FeatInfo> {
        let feats = self.feats.iter().map(|f| {
            let keys = f.key_labels();
            FeatInfo {
                kind: if keys.is_some() {
                    FeatKind::DictFeat
                } else {
                    FeatKind::Feat
                },
                spec: f.spec().clone(),
                keys,
            }
        });
        let actions = self.actions.iter().map(|a| FeatInfo {
            kind: FeatKind::Action,
            spec: FeatSpec {
                name: a.name().to_string(),
                description: a.description().map(str::to_string),
                ..Default::default()
            },
            keys: None,
        });
        feats.chain(actions).collect()
    }

    pub async fn get_json(&self, name: &str, key: Option<&str>) -> Result<Value> {
        self.lookup(name)?.get_json(key).await
    }

    pub async fn set_json(&self, name: &str, key: Option<&str>, value: Value) -> Result<()> {
        self.lookup(name)?.set_json(key, value).await
    }

    pub async fn call(&self, name: &str, args: Value) -> Result<Value> {
        self.action(name)
            .ok_or_else(|| LabError::UnknownFeat(name.to_string()))?
            .call(args)
            .await
    }

    /// Read every readable, non-keyed feat. Failures are logged and skipped.
    pub async fn snapshot(&self) -> BTreeMap<String, Value> {
        let mut values = BTreeMap::new();
        for feat in &self.feats {
            let spec = feat.spec();
            if !spec.readable || feat.key_labels().is_some() {
                continue;
            }
            match feat.get_json(None).await {
                Ok(v) => {
                    values.insert(spec.name.clone(), v);
                }
                Err(e) => tracing::warn!(feat = %spec.name, error = %e, "snapshot read failed"),
            }
        }
        values
    }

    fn lookup(&self, name: &str) -> Result<&dyn FeatAny> {
        self.feat(name)
            .ok_or_else(|| LabError::UnknownFeat(name.to_string()))
    }
}

impl std::fmt::Debug for FeatSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatSet")
            .field("names", &self.names())
            .finish()
    }
}
