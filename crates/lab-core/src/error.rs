//! Error taxonomy shared by every driver family.
//!
//! Vendors report failures in wildly different ways: sentinel replies
//! (`ERR`, `OVER`), numeric error codes behind an `ERR?`-style query, or hex
//! status registers. Every driver maps those into [`LabError`] so callers
//! handle a single type regardless of which instrument they talk to.
//!
//! ## Categories
//!
//! - **Transport**: `Io`, `Timeout`, `ConnectionClosed`, `Serial`, `Http`
//! - **Reply interpretation**: `Parse`
//! - **Value validation**: `OutOfRange`, `InvalidChoice`, `InvalidKey`,
//!   `MissingKey`, `ReadOnly`, `NotReadable`, `UnknownFeat`, `Unsupported`
//! - **Device-reported**: `Instrument` (error strings/codes), `Status`
//!   (decoded status register flags)
//! - **Units**: `IncompatibleUnits`, `InvalidQuantity`
//! - **Setup**: `Calibration`, `Configuration`, `Json`, `Csv`
//!
//! Validation errors are always raised before anything is written to the
//! device.

use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type Result<T> = std::result::Result<T, LabError>;

/// Primary error type for instrument drivers.
#[derive(Error, Debug)]
pub enum LabError {
    /// Underlying I/O failure on the connection.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No reply within the transport timeout.
    #[error("{device}: timed out waiting for reply to {command:?}")]
    Timeout { device: String, command: String },

    /// The peer closed the connection mid-exchange.
    #[error("{device}: connection closed")]
    ConnectionClosed { device: String },

    /// Serial port could not be opened or configured.
    #[cfg(feature = "serial")]
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// HTTP request to an embedded web server failed.
    #[cfg(feature = "http")]
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A reply did not match the documented format.
    #[error("{device}: cannot parse reply {response:?} to {command:?}: {reason}")]
    Parse {
        device: String,
        command: String,
        response: String,
        reason: String,
    },

    /// Numeric value outside a feat's limits (NaN included).
    #[error("{feat}: {value} is outside [{min}, {max}]")]
    OutOfRange {
        feat: String,
        value: f64,
        min: f64,
        max: f64,
    },

    /// Value is not one of the enumerated choices.
    #[error("{feat}: {value} is not one of {choices:?}")]
    InvalidChoice {
        feat: String,
        value: String,
        choices: Vec<String>,
    },

    /// Channel key not valid for a DictFeat.
    #[error("{feat}: key {key} is not one of {keys:?}")]
    InvalidKey {
        feat: String,
        key: String,
        keys: Vec<String>,
    },

    /// A DictFeat was accessed without a key.
    #[error("{feat} requires a key (one of {keys:?})")]
    MissingKey { feat: String, keys: Vec<String> },

    #[error("{feat} is read-only")]
    ReadOnly { feat: String },

    #[error("{feat} cannot be read and has no cached value")]
    NotReadable { feat: String },

    /// No feat or action registered under this name.
    #[error("no feat or action named {0:?}")]
    UnknownFeat(String),

    /// Capability method the device does not implement.
    #[error("{0} is not supported by this device")]
    Unsupported(String),

    /// The instrument reported an error (message or code).
    #[error("{device} reported an error: {message}")]
    Instrument { device: String, message: String },

    /// A status register has fatal flags set.
    #[error("{device} status: {}", .flags.join(", "))]
    Status { device: String, flags: Vec<String> },

    #[error("cannot convert {from} to {to}")]
    IncompatibleUnits { from: String, to: String },

    #[error("invalid quantity {0:?}")]
    InvalidQuantity(String),

    #[error("calibration error: {0}")]
    Calibration(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl LabError {
    /// Build a [`LabError::Parse`] for a reply that did not match.
    pub fn parse(
        device: impl Into<String>,
        command: impl Into<String>,
        response: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Parse {
            device: device.into(),
            command: command.into(),
            response: response.into(),
            reason: reason.into(),
        }
    }

    /// Build a [`LabError::Instrument`] from a device-reported message.
    pub fn instrument(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Instrument {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same exchange might succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Parse { .. } | Self::Io(_)
        )
    }
}
