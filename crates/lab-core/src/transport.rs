//! Line-oriented message transport (write / read / query).
//!
//! [`MessageTransport`] owns one connection and implements the exchange
//! every ASCII/SCPI driver needs: append the write termination, optionally
//! skip the device's echo of the command, wait a fixed settle delay, read
//! one line up to the read terminator, strip prompts and whitespace.
//!
//! The connection itself is any [`DynSerial`] byte stream; constructors
//! exist for serial ports, raw TCP sockets, GPIB through a Prologix-style
//! controller, USB-serial adapters resolved by identity, and Linux USBTMC
//! character devices. [`ConnectionConfig`] is the serde form used in device
//! configuration files.
//!
//! ```rust,ignore
//! let t = MessageTransport::via_tcp("192.168.1.40", 5025, "DG645").await?
//!     .with_termination("\n", b'\n');
//! let idn = t.query("*IDN?").await?;
//! t.write("TSRC 0").await?;
//! let rate: f64 = t.query_parse("TRAT?").await?;
//! ```

use std::fmt::Debug;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::time::Instant;
use tracing::instrument;

use crate::block;
use crate::error::{LabError, Result};
use crate::limits::{DEFAULT_TIMEOUT, DRAIN_TIMEOUT, MAX_LINE_BYTES, RETRY_BASE_DELAY};
use crate::port_resolver::PortSpec;
use crate::serial::{drain_serial_buffer, wrap_shared, DynSerial, FlowControl, Parity, SerialSettings, SharedPort};

/// Default TCP port of Prologix GPIB-ETHERNET controllers.
pub const PROLOGIX_TCP_PORT: u16 = 1234;

// =============================================================================
// Options
// =============================================================================

/// Framing and timing of the message exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportOptions {
    /// Appended to every command.
    pub write_termination: String,
    /// Byte that ends a reply line.
    pub read_terminator: u8,
    /// Maximum wait for a complete reply.
    pub timeout: Duration,
    /// Fixed settle delay after each write.
    pub write_delay: Duration,
    /// Device echoes every command line back.
    pub echo: bool,
    /// Prompt the device prints when ready (e.g. `"> "`), stripped from replies.
    pub prompt: Option<String>,
    /// Sent after a command to request the reply (GPIB controllers).
    pub read_request: Option<String>,
    /// Discard unsolicited bytes before each query.
    pub drain_before_query: bool,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            write_termination: "\r\n".to_string(),
            read_terminator: b'\n',
            timeout: DEFAULT_TIMEOUT,
            write_delay: Duration::ZERO,
            echo: false,
            prompt: None,
            read_request: None,
            drain_before_query: false,
        }
    }
}

impl TransportOptions {
    pub fn with_termination(mut self, write: &str, read: u8) -> Self {
        self.write_termination = write.to_string();
        self.read_terminator = read;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.to_string());
        self
    }

    pub fn with_drain(mut self, drain: bool) -> Self {
        self.drain_before_query = drain;
        self
    }
}

// =============================================================================
// Message Transport
// =============================================================================

/// One instrument connection with message-level read/write/query.
pub struct MessageTransport {
    port: SharedPort,
    name: String,
    options: TransportOptions,
}

impl Debug for MessageTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTransport")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl MessageTransport {
    /// Wrap an already-open byte stream (also how tests inject mocks).
    pub fn new(port: DynSerial, name: impl Into<String>) -> Self {
        Self {
            port: wrap_shared(port),
            name: name.into(),
            options: TransportOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransportOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_termination(mut self, write: &str, read: u8) -> Self {
        self.options = self.options.with_termination(write, read);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.options.write_delay = delay;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.options.echo = echo;
        self
    }

    pub fn with_prompt(mut self, prompt: &str) -> Self {
        self.options.prompt = Some(prompt.to_string());
        self
    }

    pub fn with_read_request(mut self, request: &str) -> Self {
        self.options.read_request = Some(request.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    /// Open a local serial port.
    #[cfg(feature = "serial")]
    pub async fn from_serial_port(
        path: &str,
        settings: &SerialSettings,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let port = crate::serial::open_serial_async(path, settings, &name).await?;
        tracing::info!(device = %name, port = path, baud_rate = settings.baud_rate, "connected via serial");
        Ok(Self::new(Box::new(port), name))
    }

    /// Open a USB-serial adapter found by vendor/model/serial.
    #[cfg(feature = "serial")]
    pub async fn via_usb(
        spec: &PortSpec,
        settings: &SerialSettings,
        name: impl Into<String>,
    ) -> Result<Self> {
        let path = spec.resolve()?;
        Self::from_serial_port(&path, settings, name).await
    }

    /// Connect to a raw TCP socket (SCPI-over-LAN, usually port 5025).
    pub async fn via_tcp(host: &str, port: u16, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let stream = tokio::time::timeout(
            DEFAULT_TIMEOUT,
            tokio::net::TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| LabError::Timeout {
            device: name.clone(),
            command: format!("connect {host}:{port}"),
        })??;
        stream.set_nodelay(true)?;
        tracing::info!(device = %name, host, port, "connected via TCP");
        Ok(Self::new(Box::new(stream), name))
    }

    /// Open a Linux USBTMC character device (`/dev/usbtmc0`).
    ///
    /// Each read returns one complete device message, so stale-input
    /// draining is disabled.
    pub async fn via_usbtmc(path: &str, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .await?;
        tracing::info!(device = %name, path, "connected via USBTMC");
        let mut transport = Self::new(Box::new(file), name).with_termination("\n", b'\n');
        transport.options.drain_before_query = false;
        Ok(transport)
    }

    /// Address an instrument on a GPIB bus through a Prologix-style
    /// controller (USB-serial or Ethernet).
    ///
    /// The controller is put in controller mode with auto-read off; every
    /// query is followed by `++read eoi`, and EOI is mapped to a trailing LF
    /// so replies are always line-terminated.
    pub async fn via_gpib(
        controller: &GpibController,
        address: u8,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        if address > 30 {
            return Err(LabError::Configuration(format!(
                "{name}: GPIB address {address} outside 0..=30"
            )));
        }
        let transport = match controller {
            #[cfg(feature = "serial")]
            GpibController::Serial { port, baud_rate } => {
                let settings = SerialSettings::new(baud_rate.unwrap_or(115_200));
                Self::from_serial_port(port, &settings, name.clone()).await?
            }
            #[cfg(not(feature = "serial"))]
            GpibController::Serial { .. } => {
                return Err(LabError::Configuration(format!(
                    "{name}: serial GPIB controllers need the `serial` feature"
                )))
            }
            GpibController::Tcp { host, port } => Self::via_tcp(host, *port, name.clone()).await?,
        };
        let transport = transport
            .with_termination("\n", b'\n')
            .with_read_request("++read eoi");

        for setup in [
            "++mode 1".to_string(),
            format!("++addr {address}"),
            "++auto 0".to_string(),
            "++eoi 1".to_string(),
            "++eos 2".to_string(),
            "++eot_enable 1".to_string(),
            "++eot_char 10".to_string(),
        ] {
            transport.write_line_raw(&setup).await?;
        }
        tracing::info!(device = %name, address, "GPIB controller configured");
        Ok(transport)
    }

    // -------------------------------------------------------------------------
    // Message operations
    // -------------------------------------------------------------------------

    /// Send a command that produces no reply.
    #[instrument(level = "debug", skip(self), fields(device = %self.name), err)]
    pub async fn write(&self, command: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        self.send_locked(&mut port, command).await?;
        if self.options.echo {
            let deadline = Instant::now() + self.options.timeout;
            let echo = self.read_line_locked(&mut port, command, deadline).await?;
            if echo != command.trim() {
                tracing::warn!(device = %self.name, command, echo = %echo, "unexpected echo");
            }
        }
        self.settle().await;
        Ok(())
    }

    /// Read one reply line that was not requested by a query.
    pub async fn read(&self) -> Result<String> {
        let mut port = self.port.lock().await;
        if let Some(request) = &self.options.read_request {
            self.write_line_locked(&mut port, request).await?;
        }
        let deadline = Instant::now() + self.options.timeout;
        self.read_reply_locked(&mut port, "", deadline).await
    }

    /// Write a command and read its reply as one exclusive exchange.
    #[instrument(level = "debug", skip(self), fields(device = %self.name), err)]
    pub async fn query(&self, command: &str) -> Result<String> {
        let mut port = self.port.lock().await;
        self.discard_pending(&mut port).await;
        self.send_locked(&mut port, command).await?;
        self.settle().await;
        if let Some(request) = &self.options.read_request {
            self.write_line_locked(&mut port, request).await?;
        }
        let deadline = Instant::now() + self.options.timeout;
        let reply = self.read_reply_locked(&mut port, command, deadline).await?;
        tracing::trace!(device = %self.name, command, reply = %reply, "query");
        Ok(reply)
    }

    /// `query` with linear backoff on transient failures (timeouts, garbled
    /// replies).
    pub async fn query_with_retry(&self, command: &str, retries: u32) -> Result<String> {
        let mut attempt = 0;
        loop {
            match self.query(command).await {
                Ok(reply) => return Ok(reply),
                Err(e) if e.is_transient() && attempt < retries => {
                    attempt += 1;
                    tracing::warn!(
                        device = %self.name,
                        command,
                        attempt,
                        error = %e,
                        "query failed, retrying"
                    );
                    tokio::time::sleep(RETRY_BASE_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Query and parse the reply with `FromStr`.
    pub async fn query_parse<T>(&self, command: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let reply = self.query(command).await?;
        self.parse_reply(command, &reply)
    }

    /// Parse a reply with `FromStr`, mapping failures to [`LabError::Parse`].
    pub fn parse_reply<T>(&self, command: &str, reply: &str) -> Result<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        reply
            .trim()
            .parse::<T>()
            .map_err(|e| LabError::parse(&self.name, command, reply, e.to_string()))
    }

    /// Write a command and read an IEEE 488.2 definite-length block.
    pub async fn query_block(&self, command: &str) -> Result<Vec<u8>> {
        let mut port = self.port.lock().await;
        self.discard_pending(&mut port).await;
        self.send_locked(&mut port, command).await?;
        self.settle().await;
        if let Some(request) = &self.options.read_request {
            self.write_line_locked(&mut port, request).await?;
        }
        let deadline = Instant::now() + self.options.timeout;
        self.read_block_locked(&mut port, command, deadline).await
    }

    /// Read a definite-length block that is already on its way.
    pub async fn read_block(&self) -> Result<Vec<u8>> {
        let mut port = self.port.lock().await;
        let deadline = Instant::now() + self.options.timeout;
        self.read_block_locked(&mut port, "", deadline).await
    }

    // -------------------------------------------------------------------------
    // Raw byte operations (binary protocols)
    // -------------------------------------------------------------------------

    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        let mut port = self.port.lock().await;
        port.get_mut().write_all(bytes).await?;
        port.get_mut().flush().await?;
        tracing::trace!(device = %self.name, bytes = ?bytes, "raw write");
        Ok(())
    }

    pub async fn read_exact(&self, len: usize) -> Result<Vec<u8>> {
        let mut port = self.port.lock().await;
        let mut buf = vec![0u8; len];
        self.with_deadline(
            "",
            Instant::now() + self.options.timeout,
            port.read_exact(&mut buf),
        )
        .await?;
        Ok(buf)
    }

    /// Read up to and excluding `terminator`.
    pub async fn read_until(&self, terminator: u8) -> Result<Vec<u8>> {
        let mut port = self.port.lock().await;
        let deadline = Instant::now() + self.options.timeout;
        self.read_until_locked(&mut port, terminator, "", deadline)
            .await
    }

    /// Write raw bytes and read the reply up to `terminator` in one exchange.
    pub async fn query_raw(
        &self,
        bytes: &[u8],
        terminator: u8,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let mut port = self.port.lock().await;
        self.discard_pending(&mut port).await;
        port.get_mut().write_all(bytes).await?;
        port.get_mut().flush().await?;
        let label = format!("{bytes:02X?}");
        let reply = self
            .read_until_locked(&mut port, terminator, &label, Instant::now() + timeout)
            .await?;
        tracing::trace!(device = %self.name, sent = ?bytes, reply = ?reply, "raw query");
        Ok(reply)
    }

    /// Discard anything the device sent that nobody asked for.
    pub async fn drain(&self) -> usize {
        let mut port = self.port.lock().await;
        let buffered = port.buffer().len();
        port.consume(buffered);
        buffered + drain_serial_buffer(port.get_mut(), DRAIN_TIMEOUT).await
    }

    // -------------------------------------------------------------------------
    // Locked helpers
    // -------------------------------------------------------------------------

    async fn settle(&self) {
        if !self.options.write_delay.is_zero() {
            tokio::time::sleep(self.options.write_delay).await;
        }
    }

    async fn discard_pending(&self, port: &mut BufReader<DynSerial>) {
        let buffered = port.buffer().len();
        if buffered > 0 {
            tracing::debug!(device = %self.name, bytes = buffered, "discarding buffered input");
            port.consume(buffered);
        }
        if self.options.drain_before_query {
            let n = drain_serial_buffer(port.get_mut(), DRAIN_TIMEOUT).await;
            if n > 0 {
                tracing::debug!(device = %self.name, bytes = n, "discarded stale input");
            }
        }
    }

    async fn send_locked(&self, port: &mut BufReader<DynSerial>, command: &str) -> Result<()> {
        tracing::trace!(device = %self.name, command, "write");
        let framed = format!("{command}{}", self.options.write_termination);
        port.get_mut().write_all(framed.as_bytes()).await?;
        port.get_mut().flush().await?;
        Ok(())
    }

    async fn write_line_locked(&self, port: &mut BufReader<DynSerial>, line: &str) -> Result<()> {
        port.get_mut().write_all(format!("{line}\n").as_bytes()).await?;
        port.get_mut().flush().await?;
        Ok(())
    }

    /// Controller setup lines bypass echo handling and settle delays.
    async fn write_line_raw(&self, line: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        self.write_line_locked(&mut port, line).await
    }

    /// First meaningful line of a reply: skips blanks, prompts and echoes.
    async fn read_reply_locked(
        &self,
        port: &mut BufReader<DynSerial>,
        command: &str,
        deadline: Instant,
    ) -> Result<String> {
        let command = command.trim();
        loop {
            let line = self.read_line_locked(port, command, deadline).await?;
            if line.is_empty() {
                continue;
            }
            if self.options.echo && line == command {
                tracing::trace!(device = %self.name, "skipping echo");
                continue;
            }
            return Ok(line);
        }
    }

    async fn read_line_locked(
        &self,
        port: &mut BufReader<DynSerial>,
        command: &str,
        deadline: Instant,
    ) -> Result<String> {
        let raw = self
            .read_until_locked(port, self.options.read_terminator, command, deadline)
            .await?;
        let text = String::from_utf8_lossy(&raw);
        let mut line = text.trim();
        if let Some(prompt) = self.options.prompt.as_deref().map(str::trim) {
            if !prompt.is_empty() {
                while let Some(rest) = line.strip_prefix(prompt) {
                    line = rest.trim_start();
                }
            }
        }
        Ok(line.to_string())
    }

    async fn read_until_locked(
        &self,
        port: &mut BufReader<DynSerial>,
        terminator: u8,
        command: &str,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        // One byte past the limit is enough to tell an overlong line apart
        let mut bounded = (&mut *port).take(MAX_LINE_BYTES as u64 + 1);
        let n = self
            .with_deadline(command, deadline, bounded.read_until(terminator, &mut buf))
            .await?;
        if n == 0 {
            return Err(LabError::ConnectionClosed {
                device: self.name.clone(),
            });
        }
        if buf.len() > MAX_LINE_BYTES {
            return Err(LabError::parse(
                &self.name,
                command,
                format!("<{} bytes>", buf.len()),
                "reply line too long",
            ));
        }
        if buf.last() == Some(&terminator) {
            buf.pop();
        }
        Ok(buf)
    }

    async fn read_block_locked(
        &self,
        port: &mut BufReader<DynSerial>,
        command: &str,
        deadline: Instant,
    ) -> Result<Vec<u8>> {
        // Skip stray whitespace before '#'
        let mut first = [0u8; 1];
        loop {
            self.with_deadline(command, deadline, port.read_exact(&mut first))
                .await?;
            if !first[0].is_ascii_whitespace() {
                break;
            }
        }
        let mut header = vec![first[0]];
        let parsed = loop {
            if let Some(h) = block::parse_header(&header).map_err(|e| self.reparse(command, e))? {
                break h;
            }
            let mut next = [0u8; 1];
            self.with_deadline(command, deadline, port.read_exact(&mut next))
                .await?;
            header.push(next[0]);
        };
        let mut payload = vec![0u8; parsed.payload_len];
        self.with_deadline(command, deadline, port.read_exact(&mut payload))
            .await?;
        tracing::debug!(device = %self.name, command, bytes = payload.len(), "block received");
        Ok(payload)
    }

    fn reparse(&self, command: &str, err: LabError) -> LabError {
        match err {
            LabError::Parse {
                response, reason, ..
            } => LabError::parse(&self.name, command, response, reason),
            other => other,
        }
    }

    async fn with_deadline<F, T>(&self, command: &str, deadline: Instant, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = std::io::Result<T>>,
    {
        match tokio::time::timeout_at(deadline, fut).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(LabError::ConnectionClosed {
                    device: self.name.clone(),
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(LabError::Timeout {
                device: self.name.clone(),
                command: command.to_string(),
            }),
        }
    }
}

// =============================================================================
// Connection configuration
// =============================================================================

/// GPIB controller reachable over serial or TCP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GpibController {
    Serial {
        port: String,
        #[serde(default)]
        baud_rate: Option<u32>,
    },
    Tcp {
        host: String,
        #[serde(default = "default_prologix_port")]
        port: u16,
    },
}

fn default_prologix_port() -> u16 {
    PROLOGIX_TCP_PORT
}

/// How to reach an instrument, as written in device configuration.
///
/// ```toml
/// [devices.config.connection]
/// type = "serial"
/// port = "/dev/ttyUSB0"
/// baud_rate = 19200         # optional, driver default otherwise
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConnectionConfig {
    Serial {
        port: String,
        #[serde(default)]
        baud_rate: Option<u32>,
        #[serde(default)]
        data_bits: Option<u8>,
        #[serde(default)]
        parity: Option<Parity>,
        #[serde(default)]
        stop_bits: Option<u8>,
        #[serde(default)]
        flow_control: Option<FlowControl>,
    },
    Usb {
        #[serde(default)]
        vendor: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        serial: Option<String>,
        #[serde(default)]
        baud_rate: Option<u32>,
    },
    Tcp {
        host: String,
        port: u16,
    },
    Gpib {
        controller: GpibController,
        address: u8,
    },
    Usbtmc {
        path: String,
    },
}

/// Transport defaults a driver applies to every connection it opens.
#[derive(Debug, Clone, Default)]
pub struct ConnectionDefaults {
    pub serial: SerialSettings,
    pub options: TransportOptions,
}

impl ConnectionDefaults {
    pub fn new(serial: SerialSettings, options: TransportOptions) -> Self {
        Self { serial, options }
    }
}

impl ConnectionConfig {
    /// Shorthand for a serial port with driver-default line settings.
    pub fn serial(port: impl Into<String>) -> Self {
        Self::Serial {
            port: port.into(),
            baud_rate: None,
            data_bits: None,
            parity: None,
            stop_bits: None,
            flow_control: None,
        }
    }

    /// Line settings after applying overrides to `defaults`.
    pub fn serial_settings(&self, defaults: &SerialSettings) -> SerialSettings {
        let mut settings = *defaults;
        match self {
            Self::Serial {
                baud_rate,
                data_bits,
                parity,
                stop_bits,
                flow_control,
                ..
            } => {
                if let Some(b) = baud_rate {
                    settings.baud_rate = *b;
                }
                if let Some(d) = data_bits {
                    settings.data_bits = *d;
                }
                if let Some(p) = parity {
                    settings.parity = *p;
                }
                if let Some(s) = stop_bits {
                    settings.stop_bits = *s;
                }
                if let Some(f) = flow_control {
                    settings.flow_control = *f;
                }
            }
            Self::Usb {
                baud_rate: Some(b), ..
            } => settings.baud_rate = *b,
            _ => {}
        }
        settings
    }

    /// Validate fields that serde cannot check.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Serial { port, .. } if port.trim().is_empty() => Err(
                LabError::Configuration("serial connection needs a port".into()),
            ),
            Self::Usb {
                vendor,
                model,
                serial,
                ..
            } if vendor.is_none() && model.is_none() && serial.is_none() => {
                Err(LabError::Configuration(
                    "usb connection needs vendor, model or serial".into(),
                ))
            }
            Self::Tcp { host, .. } if host.trim().is_empty() => {
                Err(LabError::Configuration("tcp connection needs a host".into()))
            }
            Self::Gpib { address, .. } if *address > 30 => Err(LabError::Configuration(
                format!("GPIB address {address} outside 0..=30"),
            )),
            _ => Ok(()),
        }
    }

    /// Open the connection and apply the driver's transport defaults.
    pub async fn open(&self, name: &str, defaults: &ConnectionDefaults) -> Result<MessageTransport> {
        self.validate()?;
        let transport = match self {
            #[cfg(feature = "serial")]
            Self::Serial { port, .. } => {
                let settings = self.serial_settings(&defaults.serial);
                MessageTransport::from_serial_port(port, &settings, name)
                    .await?
                    .with_options(defaults.options.clone())
            }
            #[cfg(feature = "serial")]
            Self::Usb {
                vendor,
                model,
                serial,
                ..
            } => {
                let spec = PortSpec {
                    vendor: vendor.clone(),
                    model: model.clone(),
                    serial: serial.clone(),
                };
                let settings = self.serial_settings(&defaults.serial);
                MessageTransport::via_usb(&spec, &settings, name)
                    .await?
                    .with_options(defaults.options.clone())
            }
            #[cfg(not(feature = "serial"))]
            Self::Serial { .. } | Self::Usb { .. } => {
                return Err(LabError::Configuration(format!(
                    "{name}: serial connections need the `serial` feature"
                )))
            }
            Self::Tcp { host, port } => MessageTransport::via_tcp(host, *port, name)
                .await?
                .with_options(defaults.options.clone()),
            Self::Gpib {
                controller,
                address,
            } => {
                // The controller link framing replaces the instrument's own.
                let mut options = defaults.options.clone();
                options.write_termination = "\n".into();
                options.read_terminator = b'\n';
                options.read_request = Some("++read eoi".into());
                MessageTransport::via_gpib(controller, *address, name)
                    .await?
                    .with_options(options)
            }
            Self::Usbtmc { path } => {
                let mut options = defaults.options.clone();
                options.drain_before_query = false;
                MessageTransport::via_usbtmc(path, name)
                    .await?
                    .with_options(options)
            }
        };
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn pair() -> (MessageTransport, tokio::io::DuplexStream) {
        let (host, device) = tokio::io::duplex(4096);
        (
            MessageTransport::new(Box::new(host), "test")
                .with_timeout(Duration::from_millis(200)),
            device,
        )
    }

    async fn read_available(device: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 256];
        let n = device.read(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn write_appends_termination() {
        let (t, mut device) = pair();
        t.write("W0800").await.unwrap();
        assert_eq!(read_available(&mut device).await, "W0800\r\n");
    }

    #[tokio::test]
    async fn query_trims_reply() {
        let (t, mut device) = pair();
        let responder = tokio::spawn(async move {
            let cmd = read_available(&mut device).await;
            assert_eq!(cmd, "D?\r\n");
            device.write_all(b"  +1.234E-03 \r\n").await.unwrap();
            device
        });
        let value: f64 = t.query_parse("D?").await.unwrap();
        assert!((value - 1.234e-3).abs() < 1e-12);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn echo_and_prompt_are_skipped() {
        let (host, mut device) = tokio::io::duplex(4096);
        let t = MessageTransport::new(Box::new(host), "fw")
            .with_termination("\r", b'\r')
            .with_echo(true)
            .with_prompt(">");
        let responder = tokio::spawn(async move {
            let _ = read_available(&mut device).await;
            device.write_all(b"pos?\r3\r> ").await.unwrap();
            device
        });
        assert_eq!(t.query("pos?").await.unwrap(), "3");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn timeout_names_command() {
        let (t, _device) = pair();
        match t.query("W?").await {
            Err(LabError::Timeout { command, .. }) => assert_eq!(command, "W?"),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn closed_connection_is_reported() {
        let (t, device) = pair();
        drop(device);
        assert!(matches!(
            t.query("W?").await,
            Err(LabError::ConnectionClosed { .. }) | Err(LabError::Io(_))
        ));
    }

    #[tokio::test]
    async fn parse_failure_carries_reply() {
        let (t, mut device) = pair();
        let responder = tokio::spawn(async move {
            let _ = read_available(&mut device).await;
            device.write_all(b"OVER\n").await.unwrap();
            device
        });
        match t.query_parse::<f64>("D?").await {
            Err(LabError::Parse { response, .. }) => assert_eq!(response, "OVER"),
            other => panic!("expected parse error, got {other:?}"),
        }
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn block_query_reads_exact_payload() {
        let (t, mut device) = pair();
        let responder = tokio::spawn(async move {
            let _ = read_available(&mut device).await;
            let mut reply = block::encode_block(&[1, 2, 3, 10, 13]);
            reply.push(b'\n');
            device.write_all(&reply).await.unwrap();
            device
        });
        assert_eq!(t.query_block("CURV?").await.unwrap(), vec![1, 2, 3, 10, 13]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn raw_query_reads_to_terminator() {
        let (t, mut device) = pair();
        let responder = tokio::spawn(async move {
            let mut byte = [0u8; 1];
            device.read_exact(&mut byte).await.unwrap();
            device.write_all(&[byte[0], 0x0D]).await.unwrap();
            device
        });
        let reply = t
            .query_raw(&[0xAA], 0x0D, Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(reply, vec![0xAA]);
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn retry_recovers_after_timeout() {
        let (host, mut device) = tokio::io::duplex(4096);
        let t = MessageTransport::new(Box::new(host), "retry")
            .with_timeout(Duration::from_millis(50));
        let responder = tokio::spawn(async move {
            // Ignore the first attempt, answer the second.
            let _ = read_available(&mut device).await;
            let _ = read_available(&mut device).await;
            device.write_all(b"42\r\n").await.unwrap();
            device
        });
        assert_eq!(t.query_with_retry("X?", 3).await.unwrap(), "42");
        responder.await.unwrap();
    }

    #[test]
    fn connection_config_from_toml() {
        let cfg: ConnectionConfig = toml::from_str(
            r#"
            type = "serial"
            port = "/dev/ttyUSB0"
            parity = "odd"
            data_bits = 7
            "#,
        )
        .unwrap();
        let settings = cfg.serial_settings(&SerialSettings::new(9600));
        assert_eq!(settings.parity, Parity::Odd);
        assert_eq!(settings.data_bits, 7);
        assert_eq!(settings.baud_rate, 9600);

        let cfg: ConnectionConfig = toml::from_str(
            r#"
            type = "gpib"
            address = 8
            controller = { type = "tcp", host = "10.0.0.5" }
            "#,
        )
        .unwrap();
        match cfg {
            ConnectionConfig::Gpib {
                controller: GpibController::Tcp { port, .. },
                address,
            } => {
                assert_eq!(port, PROLOGIX_TCP_PORT);
                assert_eq!(address, 8);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn connection_config_validation() {
        assert!(ConnectionConfig::serial("").validate().is_err());
        assert!(ConnectionConfig::Gpib {
            controller: GpibController::Tcp {
                host: "h".into(),
                port: 1234
            },
            address: 31
        }
        .validate()
        .is_err());
        assert!(ConnectionConfig::Tcp {
            host: "10.0.0.2".into(),
            port: 5025
        }
        .validate()
        .is_ok());
    }

    #[tokio::test]
    async fn endless_line_is_cut_off_at_limit() {
        let (t, mut device) = pair();
        tokio::spawn(async move {
            let chunk = vec![b'x'; 4096];
            while device.write_all(&chunk).await.is_ok() {}
        });
        match t.query("D?").await {
            Err(LabError::Parse { .. }) => {}
            other => panic!("expected parse error, got {other:?}"),
        }
    }
}
