//! Logical ↔ wire value translation for enumerated feats.

use std::fmt::Debug;

use crate::error::{LabError, Result};

/// Relative tolerance for matching numeric table entries.
pub const TABLE_TOLERANCE: f64 = 1e-9;

/// Bidirectional map between logical values and the strings an instrument
/// uses on the wire.
///
/// Wire comparison ignores surrounding whitespace and ASCII case, and falls
/// back to a numeric comparison so `"1"` matches a reply of `"+1"` or `"1.0"`.
#[derive(Debug, Clone)]
pub struct ValueMap<T> {
    entries: Vec<(T, String)>,
}

impl<T> ValueMap<T>
where
    T: Clone + PartialEq + Debug,
{
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (T, S)>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(|(v, w)| (v, w.into())).collect(),
        }
    }

    /// Wire string for a logical value.
    pub fn to_wire(&self, feat: &str, value: &T) -> Result<&str> {
        self.entries
            .iter()
            .find(|(v, _)| v == value)
            .map(|(_, w)| w.as_str())
            .ok_or_else(|| LabError::InvalidChoice {
                feat: feat.to_string(),
                value: format!("{value:?}"),
                choices: self.labels(),
            })
    }

    /// Logical value for a wire reply.
    pub fn from_wire(&self, feat: &str, wire: &str) -> Result<T> {
        let wire = wire.trim();
        let exact = self
            .entries
            .iter()
            .find(|(_, w)| w.eq_ignore_ascii_case(wire));
        let found = exact.or_else(|| {
            let n: f64 = wire.parse().ok()?;
            self.entries
                .iter()
                .find(|(_, w)| w.parse::<f64>().map(|m| m == n).unwrap_or(false))
        });
        found.map(|(v, _)| v.clone()).ok_or_else(|| LabError::InvalidChoice {
            feat: feat.to_string(),
            value: wire.to_string(),
            choices: self.entries.iter().map(|(_, w)| w.clone()).collect(),
        })
    }

    pub fn contains(&self, value: &T) -> bool {
        self.entries.iter().any(|(v, _)| v == value)
    }

    pub fn values(&self) -> impl Iterator<Item = &T> {
        self.entries.iter().map(|(v, _)| v)
    }

    /// Debug labels of the logical values, for error messages and metadata.
    pub fn labels(&self) -> Vec<String> {
        self.entries
            .iter()
            .map(|(v, _)| format!("{v:?}").trim_matches('"').to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ValueMap<f64> {
    /// Map an indexed table of values (`SENS 0..26` style) to their index.
    pub fn indexed(values: &[f64]) -> Self {
        Self::new(values.iter().enumerate().map(|(i, v)| (*v, i.to_string())))
    }

    /// The table entry equal to `value` up to float rounding.
    ///
    /// Unit conversion rarely lands bit-exactly on a table value
    /// (`100 nV` scales to `1.0000000000000001e-7`), so entries match
    /// within a relative tolerance of [`TABLE_TOLERANCE`].
    pub fn snap(&self, value: f64) -> Option<f64> {
        self.entries
            .iter()
            .map(|(v, _)| *v)
            .find(|v| (v - value).abs() <= TABLE_TOLERANCE * v.abs().max(value.abs()))
    }

    /// The table entry closest to `value`.
    pub fn nearest(&self, value: f64) -> Option<f64> {
        self.entries
            .iter()
            .map(|(v, _)| *v)
            .min_by(|a, b| {
                (a - value)
                    .abs()
                    .partial_cmp(&(b - value).abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    }
}

impl ValueMap<String> {
    /// Map string labels to wire strings.
    pub fn strings<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::new(entries.into_iter().map(|(v, w)| (v.to_string(), w)))
    }
}

impl ValueMap<bool> {
    /// The common `0`/`1` boolean encoding.
    pub fn on_off() -> Self {
        Self::new([(false, "0"), (true, "1")])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_lookup_is_case_insensitive() {
        let map = ValueMap::new([("sine", "SIN"), ("square", "SQU")]);
        assert_eq!(map.to_wire("function", &"square").unwrap(), "SQU");
        assert_eq!(map.from_wire("function", " sin\r").unwrap(), "sine");
    }

    #[test]
    fn numeric_fallback() {
        let map = ValueMap::on_off();
        assert!(map.from_wire("output", "+1").unwrap());
        assert!(!map.from_wire("output", "0.0").unwrap());
    }

    #[test]
    fn unknown_values_are_invalid_choices() {
        let map = ValueMap::new([(1u8, "A"), (2u8, "B")]);
        assert!(matches!(
            map.from_wire("input", "C"),
            Err(LabError::InvalidChoice { .. })
        ));
        assert!(map.to_wire("input", &3).is_err());
    }

    #[test]
    fn indexed_table_and_nearest() {
        let map = ValueMap::indexed(&[1e-3, 3e-3, 10e-3]);
        assert_eq!(map.to_wire("tc", &3e-3).unwrap(), "1");
        assert_eq!(map.from_wire("tc", "2").unwrap(), 10e-3);
        assert_eq!(map.nearest(4e-3), Some(3e-3));
    }

    #[test]
    fn snap_absorbs_unit_rounding() {
        let map = ValueMap::indexed(&[10e-9, 100e-9, 1e-6]);
        assert_eq!(map.snap(100.0 * 1e-9), Some(100e-9));
        assert_eq!(map.snap(1.0000000000000001e-7), Some(100e-9));
        assert_eq!(map.snap(9.999999999999999e-7), Some(1e-6));
        assert_eq!(map.snap(150e-9), None);
    }
}
