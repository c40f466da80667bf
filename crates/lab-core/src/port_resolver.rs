//! Stable serial port lookup by USB identity.
//!
//! `/dev/ttyUSB0` moves around between reboots; udev's
//! `/dev/serial/by-id/usb-{VENDOR}_{MODEL}_{SERIAL}-if{N}-port{N}` links do
//! not. A [`PortSpec`] matches against those names so configuration can say
//! "the FTDI cable with serial DJ00XXXX" instead of a device node.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LabError, Result};

/// Directory udev populates with stable serial links.
pub const BY_ID_DIR: &str = "/dev/serial/by-id";

/// USB identity filter. Every field that is set must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortSpec {
    #[serde(default)]
    pub vendor: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub serial: Option<String>,
}

impl PortSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vendor(mut self, vendor: impl Into<String>) -> Self {
        self.vendor = Some(vendor.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn serial(mut self, serial: impl Into<String>) -> Self {
        self.serial = Some(serial.into());
        self
    }

    pub fn is_valid(&self) -> bool {
        self.vendor.is_some() || self.model.is_some() || self.serial.is_some()
    }

    /// Resolve against `/dev/serial/by-id`.
    pub fn resolve(&self) -> Result<String> {
        self.resolve_in(Path::new(BY_ID_DIR))
    }

    /// Resolve against an arbitrary directory of by-id style names.
    pub fn resolve_in(&self, dir: &Path) -> Result<String> {
        if !self.is_valid() {
            return Err(LabError::Configuration(
                "USB port spec needs at least one of vendor, model or serial".into(),
            ));
        }
        if !dir.exists() {
            return Err(LabError::Configuration(format!(
                "{} does not exist",
                dir.display()
            )));
        }

        let mut matches = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if self.matches_name(&name.to_string_lossy()) {
                matches.push(entry.path().to_string_lossy().into_owned());
            }
        }
        matches.sort();

        match matches.len() {
            0 => Err(LabError::Configuration(format!(
                "no serial port matches vendor={:?} model={:?} serial={:?}",
                self.vendor, self.model, self.serial
            ))),
            1 => Ok(matches.remove(0)),
            _ => Err(LabError::Configuration(format!(
                "multiple serial ports match: {matches:?}"
            ))),
        }
    }

    /// `usb-{VENDOR}_{MODEL}_{SERIAL}-if{N}-port{N}`
    fn matches_name(&self, name: &str) -> bool {
        let Some(name) = name.strip_prefix("usb-") else {
            return false;
        };
        if let Some(vendor) = &self.vendor {
            if !name.starts_with(vendor.as_str()) {
                return false;
            }
        }
        if let Some(model) = &self.model {
            if !name.contains(model.as_str()) {
                return false;
            }
        }
        if let Some(serial) = &self.serial {
            if !name.contains(serial.as_str()) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn by_id_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        dir
    }

    #[test]
    fn matches_vendor_model_and_serial() {
        let dir = by_id_dir(&[
            "usb-FTDI_FT230X_Basic_UART_DJ00AAAA-if00-port0",
            "usb-FTDI_FT230X_Basic_UART_DJ00BBBB-if00-port0",
            "usb-Silicon_Labs_CP2102_USB_to_UART_Bridge_0001-if00-port0",
        ]);

        let path = PortSpec::new()
            .vendor("FTDI")
            .serial("DJ00BBBB")
            .resolve_in(dir.path())
            .unwrap();
        assert!(path.ends_with("usb-FTDI_FT230X_Basic_UART_DJ00BBBB-if00-port0"));

        let path = PortSpec::new()
            .model("CP2102")
            .resolve_in(dir.path())
            .unwrap();
        assert!(path.contains("Silicon_Labs"));
    }

    #[test]
    fn ambiguous_and_missing() {
        let dir = by_id_dir(&[
            "usb-FTDI_FT230X_Basic_UART_DJ00AAAA-if00-port0",
            "usb-FTDI_FT230X_Basic_UART_DJ00BBBB-if00-port0",
        ]);
        let err = PortSpec::new().vendor("FTDI").resolve_in(dir.path()).unwrap_err();
        assert!(err.to_string().contains("multiple"));

        let err = PortSpec::new().vendor("Prolific").resolve_in(dir.path()).unwrap_err();
        assert!(err.to_string().contains("no serial port"));
    }

    #[test]
    fn empty_spec_is_rejected() {
        let dir = by_id_dir(&[]);
        assert!(PortSpec::new().resolve_in(dir.path()).is_err());
    }
}
