//! Physical units and quantities.
//!
//! Drivers declare the unit a feat is expressed in (usually the unit the
//! instrument speaks on the wire) and callers may supply values in any
//! compatible unit:
//!
//! ```rust,ignore
//! let q = Quantity::parse("820nm")?;
//! assert_eq!(q.value_in(units::METER)?, 820e-9);
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Serialize, Serializer};

use crate::error::{LabError, Result};

/// Physical dimension of a unit. Conversion is only allowed within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dimension {
    Dimensionless,
    Length,
    Time,
    Frequency,
    Power,
    Voltage,
    Current,
    Temperature,
    Angle,
}

/// A unit as a linear map onto the SI base of its dimension:
/// `si = value * scale + offset`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Unit {
    pub symbol: &'static str,
    pub dimension: Dimension,
    pub scale: f64,
    pub offset: f64,
}

const fn unit(symbol: &'static str, dimension: Dimension, scale: f64) -> Unit {
    Unit {
        symbol,
        dimension,
        scale,
        offset: 0.0,
    }
}

pub const DIMENSIONLESS: Unit = unit("", Dimension::Dimensionless, 1.0);
pub const PERCENT: Unit = unit("%", Dimension::Dimensionless, 0.01);

pub const METER: Unit = unit("m", Dimension::Length, 1.0);
pub const MILLIMETER: Unit = unit("mm", Dimension::Length, 1e-3);
pub const MICROMETER: Unit = unit("um", Dimension::Length, 1e-6);
pub const NANOMETER: Unit = unit("nm", Dimension::Length, 1e-9);

pub const SECOND: Unit = unit("s", Dimension::Time, 1.0);
pub const MILLISECOND: Unit = unit("ms", Dimension::Time, 1e-3);
pub const MICROSECOND: Unit = unit("us", Dimension::Time, 1e-6);
pub const NANOSECOND: Unit = unit("ns", Dimension::Time, 1e-9);
pub const PICOSECOND: Unit = unit("ps", Dimension::Time, 1e-12);
pub const HOUR: Unit = unit("h", Dimension::Time, 3600.0);

pub const HERTZ: Unit = unit("Hz", Dimension::Frequency, 1.0);
pub const KILOHERTZ: Unit = unit("kHz", Dimension::Frequency, 1e3);
pub const MEGAHERTZ: Unit = unit("MHz", Dimension::Frequency, 1e6);
pub const GIGAHERTZ: Unit = unit("GHz", Dimension::Frequency, 1e9);

pub const WATT: Unit = unit("W", Dimension::Power, 1.0);
pub const MILLIWATT: Unit = unit("mW", Dimension::Power, 1e-3);
pub const MICROWATT: Unit = unit("uW", Dimension::Power, 1e-6);
pub const NANOWATT: Unit = unit("nW", Dimension::Power, 1e-9);

pub const VOLT: Unit = unit("V", Dimension::Voltage, 1.0);
pub const MILLIVOLT: Unit = unit("mV", Dimension::Voltage, 1e-3);
pub const MICROVOLT: Unit = unit("uV", Dimension::Voltage, 1e-6);
pub const NANOVOLT: Unit = unit("nV", Dimension::Voltage, 1e-9);

pub const AMPERE: Unit = unit("A", Dimension::Current, 1.0);
pub const MILLIAMPERE: Unit = unit("mA", Dimension::Current, 1e-3);
pub const MICROAMPERE: Unit = unit("uA", Dimension::Current, 1e-6);

pub const KELVIN: Unit = unit("K", Dimension::Temperature, 1.0);
pub const CELSIUS: Unit = Unit {
    symbol: "degC",
    dimension: Dimension::Temperature,
    scale: 1.0,
    offset: 273.15,
};

pub const DEGREE: Unit = unit("deg", Dimension::Angle, std::f64::consts::PI / 180.0);
pub const RADIAN: Unit = unit("rad", Dimension::Angle, 1.0);

const KNOWN: &[Unit] = &[
    PERCENT,
    METER,
    MILLIMETER,
    MICROMETER,
    NANOMETER,
    SECOND,
    MILLISECOND,
    MICROSECOND,
    NANOSECOND,
    PICOSECOND,
    HOUR,
    HERTZ,
    KILOHERTZ,
    MEGAHERTZ,
    GIGAHERTZ,
    WATT,
    MILLIWATT,
    MICROWATT,
    NANOWATT,
    VOLT,
    MILLIVOLT,
    MICROVOLT,
    NANOVOLT,
    AMPERE,
    MILLIAMPERE,
    MICROAMPERE,
    KELVIN,
    CELSIUS,
    DEGREE,
    RADIAN,
];

impl Unit {
    /// Look up a unit by symbol. `µ` and `u` are interchangeable, and a few
    /// spelled-out aliases (`deg`, `°`, `°C`, `sec`) are accepted.
    /// Prefixes are case-sensitive where case decides milli versus mega.
    pub fn parse(symbol: &str) -> Result<Unit> {
        let normalized = symbol.trim().replace('µ', "u").replace('μ', "u");
        let normalized = match normalized.as_str() {
            "" => return Ok(DIMENSIONLESS),
            "°" | "degree" | "degrees" => "deg",
            "°C" | "C" | "celsius" => "degC",
            "sec" => "s",
            "hz" => "Hz",
            "khz" => "kHz",
            other => other,
        }
        .to_string();

        KNOWN
            .iter()
            .find(|u| u.symbol == normalized)
            .copied()
            .ok_or_else(|| LabError::InvalidQuantity(symbol.to_string()))
    }

    /// Convert `value` expressed in `self` to `target`.
    pub fn convert(&self, value: f64, target: &Unit) -> Result<f64> {
        if self.dimension != target.dimension {
            return Err(LabError::IncompatibleUnits {
                from: self.symbol.to_string(),
                to: target.symbol.to_string(),
            });
        }
        let si = value * self.scale + self.offset;
        Ok((si - target.offset) / target.scale)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol)
    }
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol)
    }
}

/// A magnitude with a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Quantity {
    pub value: f64,
    pub unit: Unit,
}

impl Quantity {
    pub fn new(value: f64, unit: Unit) -> Self {
        Self { value, unit }
    }

    /// Parse `"820nm"`, `"5 mW"`, `"1e-3 s"` or a bare number (dimensionless).
    pub fn parse(text: &str) -> Result<Quantity> {
        let text = text.trim();
        let split = number_prefix_len(text);
        if split == 0 {
            return Err(LabError::InvalidQuantity(text.to_string()));
        }
        let value: f64 = text[..split]
            .parse()
            .map_err(|_| LabError::InvalidQuantity(text.to_string()))?;
        let unit = Unit::parse(&text[split..])
            .map_err(|_| LabError::InvalidQuantity(text.to_string()))?;
        Ok(Quantity { value, unit })
    }

    pub fn to(&self, target: Unit) -> Result<Quantity> {
        Ok(Quantity {
            value: self.unit.convert(self.value, &target)?,
            unit: target,
        })
    }

    pub fn value_in(&self, target: Unit) -> Result<f64> {
        self.unit.convert(self.value, &target)
    }
}

impl FromStr for Quantity {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        Quantity::parse(s)
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.unit.symbol.is_empty() {
            write!(f, "{}", self.value)
        } else {
            write!(f, "{} {}", self.value, self.unit)
        }
    }
}

/// Length of the leading floating-point literal in `text`.
fn number_prefix_len(text: &str) -> usize {
    let bytes = text.as_bytes();
    let mut i = 0;
    if i < bytes.len() && (bytes[i] == b'+' || bytes[i] == b'-') {
        i += 1;
    }
    let digits_start = i;
    while i < bytes.len() && (bytes[i].is_ascii_digit() || bytes[i] == b'.') {
        i += 1;
    }
    if i == digits_start {
        return 0;
    }
    // Exponent only counts when followed by digits ("5e-3" but not "5 eV").
    if i < bytes.len() && (bytes[i] == b'e' || bytes[i] == b'E') {
        let mut j = i + 1;
        if j < bytes.len() && (bytes[j] == b'+' || bytes[j] == b'-') {
            j += 1;
        }
        if j < bytes.len() && bytes[j].is_ascii_digit() {
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            i = j;
        }
    }
    i
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= 1e-12 * a.abs().max(b.abs()).max(1.0)
    }

    #[test]
    fn parses_with_and_without_space() {
        let q = Quantity::parse("820nm").unwrap();
        assert_eq!(q.value, 820.0);
        assert_eq!(q.unit, NANOMETER);

        let q = Quantity::parse("5 mW").unwrap();
        assert_eq!(q.unit, MILLIWATT);
        assert!(close(q.value_in(WATT).unwrap(), 0.005));
    }

    #[test]
    fn exponent_and_micro_sign() {
        let q = Quantity::parse("1e-3 s").unwrap();
        assert!(close(q.value_in(MILLISECOND).unwrap(), 1.0));

        let q = Quantity::parse("30 µs").unwrap();
        assert_eq!(q.unit, MICROSECOND);
    }

    #[test]
    fn mega_prefix_is_case_sensitive() {
        assert_eq!(Unit::parse("MHz").unwrap(), MEGAHERTZ);
        assert_eq!(Unit::parse("khz").unwrap(), KILOHERTZ);
        assert!(Unit::parse("mhz").is_err());
        assert!(Quantity::parse("10 mhz").is_err());
    }

    #[test]
    fn bare_number_is_dimensionless() {
        let q = Quantity::parse("42").unwrap();
        assert_eq!(q.unit, DIMENSIONLESS);
        assert_eq!(q.value, 42.0);
    }

    #[test]
    fn celsius_kelvin_offset() {
        let q = Quantity::new(25.0, CELSIUS);
        assert!(close(q.value_in(KELVIN).unwrap(), 298.15));
        let back = Quantity::new(77.0, KELVIN).to(CELSIUS).unwrap();
        assert!(close(back.value, -196.15));
    }

    #[test]
    fn cross_dimension_conversion_fails() {
        let err = Quantity::new(1.0, WATT).to(VOLT).unwrap_err();
        assert!(matches!(err, LabError::IncompatibleUnits { .. }));
    }

    #[test]
    fn rejects_garbage() {
        assert!(Quantity::parse("nm").is_err());
        assert!(Quantity::parse("5 furlongs").is_err());
    }

    #[test]
    fn display_round_trips_symbol() {
        assert_eq!(Quantity::new(5.0, MILLIWATT).to_string(), "5 mW");
        assert_eq!(Quantity::new(90.0, DEGREE).to_string(), "90 deg");
    }
}
