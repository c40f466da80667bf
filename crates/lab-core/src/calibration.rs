//! Calibrations between physical units and raw device quantities.
//!
//! Two shapes cover the catalogue:
//! - [`Polynomial`]: a small fitted polynomial over a bounded domain
//! - [`LookupTable`]: measured `(x, y)` pairs with linear interpolation,
//!   usually loaded from a two-column CSV file
//!
//! Both are invertible as long as they are monotonic over their domain,
//! which is what a setter needs ("give me 30 % transmission" → angle).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// `y = c0 + c1 x + c2 x² + ...` valid on `[domain.0, domain.1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Polynomial {
    pub coefficients: Vec<f64>,
    pub domain: (f64, f64),
}

impl Polynomial {
    pub fn new(coefficients: Vec<f64>, domain: (f64, f64)) -> Self {
        Self {
            coefficients,
            domain,
        }
    }

    pub fn eval(&self, x: f64) -> f64 {
        self.coefficients
            .iter()
            .rev()
            .fold(0.0, |acc, c| acc * x + c)
    }

    /// Solve `eval(x) == y` on the domain by bisection.
    pub fn inverse(&self, y: f64) -> Result<f64> {
        let (mut lo, mut hi) = self.domain;
        let mut f_lo = self.eval(lo) - y;
        let f_hi = self.eval(hi) - y;
        if f_lo == 0.0 {
            return Ok(lo);
        }
        if f_hi == 0.0 {
            return Ok(hi);
        }
        if f_lo.signum() == f_hi.signum() {
            return Err(LabError::Calibration(format!(
                "{y} is outside the calibrated range [{}, {}]",
                self.eval(self.domain.0).min(self.eval(self.domain.1)),
                self.eval(self.domain.0).max(self.eval(self.domain.1)),
            )));
        }
        for _ in 0..100 {
            let mid = 0.5 * (lo + hi);
            let f_mid = self.eval(mid) - y;
            if f_mid == 0.0 || (hi - lo).abs() < 1e-12 {
                return Ok(mid);
            }
            if f_mid.signum() == f_lo.signum() {
                lo = mid;
                f_lo = f_mid;
            } else {
                hi = mid;
            }
        }
        Ok(0.5 * (lo + hi))
    }
}

/// Piecewise-linear table. `x` is strictly increasing and every point is
/// finite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupTable {
    x: Vec<f64>,
    y: Vec<f64>,
}

impl LookupTable {
    pub fn new(x: Vec<f64>, y: Vec<f64>) -> Result<Self> {
        if x.len() != y.len() || x.len() < 2 {
            return Err(LabError::Calibration(format!(
                "table needs at least two matching points, got {} x and {} y",
                x.len(),
                y.len()
            )));
        }
        if let Some(i) = x.iter().zip(&y).position(|(a, b)| !a.is_finite() || !b.is_finite()) {
            return Err(LabError::Calibration(format!(
                "table point {} ({}, {}) is not finite",
                i + 1,
                x[i],
                y[i]
            )));
        }
        if x.windows(2).any(|w| w[1] <= w[0]) {
            return Err(LabError::Calibration(
                "table x values must be strictly increasing".into(),
            ));
        }
        Ok(Self { x, y })
    }

    /// Two-column CSV (`x,y`). A header row is skipped if present.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .comment(Some(b'#'))
            .from_path(path)?;

        let (mut xs, mut ys) = (Vec::new(), Vec::new());
        for (row, record) in reader.records().enumerate() {
            let record = record?;
            let (Some(a), Some(b)) = (record.get(0), record.get(1)) else {
                return Err(LabError::Calibration(format!(
                    "{}: row {} has fewer than two columns",
                    path.display(),
                    row + 1
                )));
            };
            match (a.parse::<f64>(), b.parse::<f64>()) {
                (Ok(x), Ok(y)) => {
                    xs.push(x);
                    ys.push(y);
                }
                _ if row == 0 => continue,
                _ => {
                    return Err(LabError::Calibration(format!(
                        "{}: row {} is not numeric",
                        path.display(),
                        row + 1
                    )))
                }
            }
        }
        tracing::debug!(path = %path.display(), points = xs.len(), "loaded calibration table");
        Self::new(xs, ys)
    }

    pub fn x_range(&self) -> (f64, f64) {
        (self.x[0], self.x[self.x.len() - 1])
    }

    pub fn interpolate(&self, x: f64) -> Result<f64> {
        interpolate(&self.x, &self.y, x)
    }

    /// Inverse lookup; requires `y` to be monotonic.
    pub fn inverse(&self, y: f64) -> Result<f64> {
        let increasing = self.y.windows(2).all(|w| w[1] > w[0]);
        let decreasing = self.y.windows(2).all(|w| w[1] < w[0]);
        if increasing {
            interpolate(&self.y, &self.x, y)
        } else if decreasing {
            let ry: Vec<f64> = self.y.iter().rev().copied().collect();
            let rx: Vec<f64> = self.x.iter().rev().copied().collect();
            interpolate(&ry, &rx, y)
        } else {
            Err(LabError::Calibration(
                "table y values are not monotonic; cannot invert".into(),
            ))
        }
    }
}

fn interpolate(xs: &[f64], ys: &[f64], x: f64) -> Result<f64> {
    let (first, last) = (xs[0], xs[xs.len() - 1]);
    if !(first..=last).contains(&x) {
        return Err(LabError::Calibration(format!(
            "{x} is outside the calibrated range [{first}, {last}]"
        )));
    }
    let i = xs.partition_point(|v| *v < x).max(1);
    let (x0, x1, y0, y1) = (xs[i - 1], xs[i], ys[i - 1], ys[i]);
    Ok(y0 + (y1 - y0) * (x - x0) / (x1 - x0))
}

/// How a calibration is specified in device configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibrationConfig {
    Polynomial {
        coefficients: Vec<f64>,
        domain: (f64, f64),
    },
    Table {
        path: PathBuf,
    },
    Points {
        x: Vec<f64>,
        y: Vec<f64>,
    },
}

/// A loaded calibration mapping raw `x` to physical `y`.
#[derive(Debug, Clone, PartialEq)]
pub enum Calibration {
    Polynomial(Polynomial),
    Table(LookupTable),
}

impl Calibration {
    pub fn load(config: &CalibrationConfig) -> Result<Self> {
        match config {
            CalibrationConfig::Polynomial {
                coefficients,
                domain,
            } => Ok(Self::Polynomial(Polynomial::new(coefficients.clone(), *domain))),
            CalibrationConfig::Table { path } => Ok(Self::Table(LookupTable::from_csv(path)?)),
            CalibrationConfig::Points { x, y } => {
                Ok(Self::Table(LookupTable::new(x.clone(), y.clone())?))
            }
        }
    }

    pub fn forward(&self, x: f64) -> Result<f64> {
        match self {
            Self::Polynomial(p) => {
                let (lo, hi) = p.domain;
                if !(lo..=hi).contains(&x) {
                    return Err(LabError::Calibration(format!(
                        "{x} is outside the calibrated domain [{lo}, {hi}]"
                    )));
                }
                Ok(p.eval(x))
            }
            Self::Table(t) => t.interpolate(x),
        }
    }

    pub fn inverse(&self, y: f64) -> Result<f64> {
        match self {
            Self::Polynomial(p) => p.inverse(y),
            Self::Table(t) => t.inverse(y),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn polynomial_eval_and_inverse() {
        // y = 1 + 2x + 3x²
        let p = Polynomial::new(vec![1.0, 2.0, 3.0], (0.0, 10.0));
        assert_eq!(p.eval(2.0), 17.0);
        let x = p.inverse(17.0).unwrap();
        assert!((x - 2.0).abs() < 1e-9);
        assert!(p.inverse(-5.0).is_err());
    }

    #[test]
    fn table_interpolates_and_inverts_decreasing() {
        let t = LookupTable::new(vec![0.0, 45.0, 90.0], vec![1.0, 0.5, 0.0]).unwrap();
        assert!((t.interpolate(22.5).unwrap() - 0.75).abs() < 1e-12);
        assert!((t.inverse(0.25).unwrap() - 67.5).abs() < 1e-12);
        assert!(t.interpolate(100.0).is_err());
    }

    #[test]
    fn table_rejects_unsorted_x() {
        assert!(LookupTable::new(vec![0.0, 0.0], vec![1.0, 2.0]).is_err());
        assert!(LookupTable::new(vec![1.0], vec![1.0]).is_err());
    }

    #[test]
    fn table_rejects_non_finite_points() {
        assert!(LookupTable::new(vec![0.0, f64::NAN, 90.0], vec![1.0, 0.5, 0.0]).is_err());
        assert!(LookupTable::new(vec![0.0, 90.0], vec![f64::INFINITY, 0.0]).is_err());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "0, 1.0").unwrap();
        writeln!(file, "45, NaN").unwrap();
        writeln!(file, "90, 0.0").unwrap();
        assert!(matches!(
            LookupTable::from_csv(file.path()),
            Err(LabError::Calibration(_))
        ));
    }

    #[test]
    fn csv_with_header_and_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# attenuator sweep").unwrap();
        writeln!(file, "angle_deg, transmission").unwrap();
        writeln!(file, "0, 0.0").unwrap();
        writeln!(file, "45, 0.5").unwrap();
        writeln!(file, "90, 1.0").unwrap();

        let cal = Calibration::load(&CalibrationConfig::Table {
            path: file.path().to_path_buf(),
        })
        .unwrap();
        assert!((cal.forward(30.0).unwrap() - 1.0 / 3.0).abs() < 1e-12);
        assert!((cal.inverse(0.75).unwrap() - 67.5).abs() < 1e-12);
    }

    #[test]
    fn config_deserializes_from_toml() {
        let cfg: CalibrationConfig = toml::from_str(
            r#"
            kind = "polynomial"
            coefficients = [0.0, 0.011]
            domain = [0.0, 90.0]
            "#,
        )
        .unwrap();
        let cal = Calibration::load(&cfg).unwrap();
        assert!((cal.forward(50.0).unwrap() - 0.55).abs() < 1e-12);
        assert!(cal.forward(91.0).is_err());
    }
}
