//! Numeric limits for feats, plus shared hard limits for transports.
//!
//! This module centralizes:
//! - [`Limits`]: min/max/step constraints attached to numeric feats
//! - Default timeouts and payload ceilings used by the transports

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

// =============================================================================
// Timeout Constants
// =============================================================================

/// Default reply timeout for message-based transports.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Timeout used when draining stale bytes before a query.
pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(20);

/// Base delay for `query_with_retry`; attempt `n` waits `n * RETRY_BASE_DELAY`.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum allowed binary block payload in bytes (16 MB).
pub const MAX_BLOCK_BYTES: usize = 16 * 1024 * 1024;

/// Maximum length of a single ASCII reply line.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

// =============================================================================
// Feat Limits
// =============================================================================

/// Inclusive numeric range with an optional step.
///
/// When a step is given, accepted values are quantized to
/// `min + k * step` (rounding to nearest), never exceeding `max`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    pub min: f64,
    pub max: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
}

impl Limits {
    pub const fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            step: None,
        }
    }

    /// Limits starting at zero, as instruments usually document them.
    pub const fn up_to(max: f64) -> Self {
        Self::new(0.0, max)
    }

    pub const fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    /// Range-check and quantize `value` for feat `feat`.
    pub fn check(&self, feat: &str, value: f64) -> Result<f64> {
        if !value.is_finite() || !self.contains(value) {
            return Err(LabError::OutOfRange {
                feat: feat.to_string(),
                value,
                min: self.min,
                max: self.max,
            });
        }
        match self.step {
            Some(step) if step > 0.0 => {
                let steps = ((value - self.min) / step).round();
                let mut quantized = self.min + steps * step;
                if quantized > self.max {
                    quantized -= step;
                }
                Ok(quantized)
            }
            _ => Ok(value),
        }
    }
}

/// Conversion between a feat's value type and the f64 domain of [`Limits`].
pub trait LimitValue: Copy {
    fn to_f64(self) -> f64;
    fn from_f64(value: f64) -> Self;
}

impl LimitValue for f64 {
    fn to_f64(self) -> f64 {
        self
    }
    fn from_f64(value: f64) -> Self {
        value
    }
}

macro_rules! int_limit_value {
    ($($t:ty),*) => {
        $(
            impl LimitValue for $t {
                fn to_f64(self) -> f64 {
                    self as f64
                }
                fn from_f64(value: f64) -> Self {
                    value.round() as $t
                }
            }
        )*
    };
}

int_limit_value!(i32, i64, u8, u16, u32, u64, usize);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_inside_rejects_outside() {
        let limits = Limits::new(300.0, 1100.0);
        assert_eq!(limits.check("wavelength", 633.0).unwrap(), 633.0);
        assert!(matches!(
            limits.check("wavelength", 1200.0),
            Err(LabError::OutOfRange { max, .. }) if max == 1100.0
        ));
    }

    #[test]
    fn nan_and_infinity_rejected() {
        let limits = Limits::new(-1.0, 1.0);
        assert!(limits.check("x", f64::NAN).is_err());
        assert!(limits.check("x", f64::INFINITY).is_err());
    }

    #[test]
    fn step_quantizes_from_min() {
        let limits = Limits::new(0.004, 5.0).with_step(0.002);
        let q = limits.check("amplitude", 0.0071).unwrap();
        assert!((q - 0.008).abs() < 1e-12);
    }

    #[test]
    fn step_never_exceeds_max() {
        let limits = Limits::new(0.0, 10.0).with_step(3.0);
        // 10 is 3.33 steps; rounds to 9, not 12
        assert_eq!(limits.check("x", 10.0).unwrap(), 9.0);
    }

    #[test]
    fn integer_round_trip() {
        assert_eq!(<u32 as LimitValue>::from_f64(7.6), 8);
        assert_eq!(5i64.to_f64(), 5.0);
    }
}
