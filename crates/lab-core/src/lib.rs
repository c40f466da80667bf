//! `lab-core`
//!
//! Shared building blocks for lab instrument drivers.
//!
//! Every driver in the workspace is a thin translation between an
//! instrument's literal command set and a typed attribute interface. This
//! crate provides everything that translation needs and nothing
//! instrument-specific:
//!
//! - **Descriptors**: [`Feat`], [`DictFeat`] and [`Action`], collected in a
//!   [`FeatSet`] for by-name access
//! - **Validation**: [`Limits`] (range + step) and [`ValueMap`]
//!   (logical ↔ wire)
//! - **Transports**: [`MessageTransport`] for line-oriented protocols over
//!   serial, TCP, GPIB, USB-serial or USBTMC; `HttpTransport` behind the
//!   `http` feature
//! - **Units**: [`Unit`] and [`Quantity`] for specifying and converting
//!   physical values
//! - **Errors**: [`LabError`], the single taxonomy every driver maps into
//! - **Lifecycle**: [`Instrument`], [`scoped`], the capability traits and
//!   [`DriverFactory`]
//! - **Testing**: [`mock`] devices served over in-memory streams
//!
//! ## Example
//!
//! ```rust,ignore
//! use lab_core::{ConnectionConfig, ConnectionDefaults, SerialSettings, TransportOptions};
//!
//! let defaults = ConnectionDefaults::new(
//!     SerialSettings::new(9600),
//!     TransportOptions::default().with_termination("\n", b'\n'),
//! );
//! let transport = ConnectionConfig::serial("/dev/ttyUSB0")
//!     .open("1830-C", &defaults)
//!     .await?;
//! let power: f64 = transport.query_parse("D?").await?;
//! ```

pub mod action;
pub mod bind;
pub mod block;
pub mod calibration;
pub mod capabilities;
pub mod dict_feat;
pub mod driver;
pub mod error;
pub mod feat;
pub mod feat_set;
#[cfg(feature = "http")]
pub mod http;
pub mod limits;
pub mod mock;
pub mod port_resolver;
pub mod scpi;
pub mod serial;
pub mod status;
pub mod transport;
pub mod units;
pub mod value_map;

pub use action::Action;
pub use calibration::{Calibration, CalibrationConfig};
pub use capabilities::{
    DeviceCategory, EmissionControl, Movable, Readable, ShutterControl, Triggerable,
    WavelengthTunable,
};
pub use dict_feat::{DictFeat, FeatKey};
pub use driver::{parse_config, scoped, Capability, DeviceComponents, DriverFactory, Instrument};
pub use error::{LabError, Result};
pub use feat::{Feat, FeatSpec, FeatValue};
pub use feat_set::{FeatAny, FeatInfo, FeatKind, FeatSet};
pub use limits::{LimitValue, Limits};
pub use serial::{FlowControl, Parity, SerialSettings};
pub use status::StatusRegister;
pub use transport::{
    ConnectionConfig, ConnectionDefaults, GpibController, MessageTransport, TransportOptions,
};
pub use units::{Quantity, Unit};
pub use value_map::ValueMap;
