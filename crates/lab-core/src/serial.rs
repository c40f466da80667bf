//! Async byte-stream abstractions shared by every transport.
//!
//! Serial ports, TCP sockets, USBTMC character devices and test duplex
//! streams are all erased to [`DynSerial`] and wrapped in a [`SharedPort`]
//! (a mutex around a `BufReader`), so the message layer above never cares
//! which physical link carries the bytes.
//!
//! # Example
//!
//! ```rust,ignore
//! use lab_core::serial::{open_serial_async, wrap_shared, SerialSettings};
//!
//! let settings = SerialSettings::new(19200);
//! let port = open_serial_async("/dev/ttyUSB0", &settings, "ESP300").await?;
//! let shared = wrap_shared(Box::new(port));
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, BufReader};
use tokio::sync::Mutex;

// =============================================================================
// Serial Port Trait
// =============================================================================

/// Trait alias for async byte-stream I/O.
///
/// Any type implementing `AsyncRead + AsyncWrite + Unpin + Send` can carry
/// instrument traffic:
/// - `tokio_serial::SerialStream` (real hardware)
/// - `tokio::net::TcpStream` (LAN instruments, GPIB-Ethernet controllers)
/// - `tokio::fs::File` (Linux USBTMC devices)
/// - `tokio::io::DuplexStream` (testing)
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed byte stream.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Exclusively owned connection with buffered reading.
///
/// The `BufReader` enables `read_until()` on line-delimited protocols; the
/// mutex serializes write/read exchanges so a reply is never interleaved
/// with another command.
pub type SharedPort = Arc<Mutex<BufReader<DynSerial>>>;

pub fn wrap_shared(port: DynSerial) -> SharedPort {
    Arc::new(Mutex::new(BufReader::new(port)))
}

// =============================================================================
// Line Settings
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    None,
    Odd,
    Even,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// RS-232 line settings. Defaults to 9600 8N1 without flow control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialSettings {
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: u8,
    pub flow_control: FlowControl,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: 1,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialSettings {
    /// 8N1 at `baud_rate`.
    pub fn new(baud_rate: u32) -> Self {
        Self {
            baud_rate,
            ..Default::default()
        }
    }

    pub fn with_framing(mut self, data_bits: u8, parity: Parity, stop_bits: u8) -> Self {
        self.data_bits = data_bits;
        self.parity = parity;
        self.stop_bits = stop_bits;
        self
    }

    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

// =============================================================================
// Serial Port Utilities
// =============================================================================

/// Open a serial port using spawn_blocking.
///
/// Port opening can block on some platforms (udev, USB-serial enumeration),
/// so it runs off the async runtime.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    settings: &SerialSettings,
    device_name: &str,
) -> crate::error::Result<tokio_serial::SerialStream> {
    use crate::error::LabError;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let data_bits = match settings.data_bits {
        5 => tokio_serial::DataBits::Five,
        6 => tokio_serial::DataBits::Six,
        7 => tokio_serial::DataBits::Seven,
        8 => tokio_serial::DataBits::Eight,
        other => {
            return Err(LabError::Configuration(format!(
                "{device_name}: unsupported data bits {other}"
            )))
        }
    };
    let stop_bits = match settings.stop_bits {
        1 => tokio_serial::StopBits::One,
        2 => tokio_serial::StopBits::Two,
        other => {
            return Err(LabError::Configuration(format!(
                "{device_name}: unsupported stop bits {other}"
            )))
        }
    };
    let parity = match settings.parity {
        Parity::None => tokio_serial::Parity::None,
        Parity::Odd => tokio_serial::Parity::Odd,
        Parity::Even => tokio_serial::Parity::Even,
    };
    let flow_control = match settings.flow_control {
        FlowControl::None => tokio_serial::FlowControl::None,
        FlowControl::Software => tokio_serial::FlowControl::Software,
        FlowControl::Hardware => tokio_serial::FlowControl::Hardware,
    };

    let path = port_path.to_string();
    let baud_rate = settings.baud_rate;
    tracing::debug!(device = device_name, port = %path, baud_rate, "opening serial port");

    spawn_blocking(move || {
        tokio_serial::new(&path, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .flow_control(flow_control)
            .open_native_async()
    })
    .await
    .map_err(|e| LabError::Io(std::io::Error::other(e)))?
    .map_err(LabError::from)
}

/// Read and discard whatever arrives within `timeout`.
///
/// Used before queries so a late reply to an earlier command (or a stray
/// prompt) is not mistaken for the answer.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout: Duration) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + timeout;
    let mut total_discarded = 0usize;

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => total_discarded += n,
            Ok(Err(_)) | Err(_) => break,
        }
    }

    total_discarded
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn shared_port_reads_lines_from_duplex() {
        let (mut host, device) = tokio::io::duplex(64);
        let port: SharedPort = wrap_shared(Box::new(device));

        host.write_all(b"Hello\n").await.unwrap();

        let mut guard = port.lock().await;
        let mut line = String::new();
        guard.read_line(&mut line).await.unwrap();
        assert_eq!(line.trim(), "Hello");
    }

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut device, Duration::from_millis(50)).await;
        assert_eq!(discarded, 16);
    }

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: SerialSettings = toml::from_str(
            r#"
            baud_rate = 9600
            data_bits = 7
            parity = "odd"
            "#,
        )
        .unwrap();
        assert_eq!(settings.data_bits, 7);
        assert_eq!(settings.parity, Parity::Odd);
        assert_eq!(settings.stop_bits, 1);
        assert_eq!(settings.flow_control, FlowControl::None);
    }
}
