//! In-memory instruments for driver tests.
//!
//! Two tools, for two kinds of protocol:
//!
//! - [`MockSerialPort`] / [`MockDeviceHarness`]: a scripted byte pipe. The
//!   test asserts exactly what the driver wrote and decides exactly what
//!   comes back. Suited to binary protocols and ordering-sensitive tests.
//! - [`MockInstrument`]: a line-oriented responder running in its own task.
//!   Commands map to canned replies; the device can echo commands and print
//!   a prompt the way real firmware does. Every received line is recorded in
//!   a [`MockLog`] for assertions.
//!
//! ```rust,ignore
//! let (transport, log) = MockInstrument::new()
//!     .on("W?", "0800")
//!     .on("D?", "1.234E-03")
//!     .spawn_transport("1830-C", Newport1830C::transport_options());
//! let meter = Newport1830C::with_transport(transport).await?;
//! assert_eq!(meter.wavelength().await?, 800.0);
//! assert!(log.contains("W?"));
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::serial::DynSerial;
use crate::transport::{MessageTransport, TransportOptions};

// =============================================================================
// Scripted byte pipe
// =============================================================================

/// Driver-facing end of a scripted pipe.
#[derive(Debug)]
pub struct MockSerialPort {
    writes_tx: UnboundedSender<Vec<u8>>,
    reads_rx: UnboundedReceiver<Vec<u8>>,
    read_buffer: VecDeque<u8>,
}

/// Test-facing end of a scripted pipe.
#[derive(Debug)]
pub struct MockDeviceHarness {
    writes_rx: UnboundedReceiver<Vec<u8>>,
    reads_tx: UnboundedSender<Vec<u8>>,
    write_buffer: Vec<u8>,
}

/// Connected port/harness pair.
pub fn pipe() -> (MockSerialPort, MockDeviceHarness) {
    let (writes_tx, writes_rx) = mpsc::unbounded_channel();
    let (reads_tx, reads_rx) = mpsc::unbounded_channel();
    (
        MockSerialPort {
            writes_tx,
            reads_rx,
            read_buffer: VecDeque::new(),
        },
        MockDeviceHarness {
            writes_rx,
            reads_tx,
            write_buffer: Vec::new(),
        },
    )
}

impl AsyncRead for MockSerialPort {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.read_buffer.is_empty() {
            match self.reads_rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => self.read_buffer.extend(chunk),
                // Harness dropped: end of file
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
        let n = buf.remaining().min(self.read_buffer.len());
        let chunk: Vec<u8> = self.read_buffer.drain(..n).collect();
        buf.put_slice(&chunk);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for MockSerialPort {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.writes_tx.send(buf.to_vec()) {
            Ok(()) => Poll::Ready(Ok(buf.len())),
            Err(_) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "mock device harness disconnected",
            ))),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

impl MockDeviceHarness {
    /// Queue bytes for the driver to read.
    pub fn send_response(&self, data: &[u8]) -> Result<(), &'static str> {
        self.reads_tx
            .send(data.to_vec())
            .map_err(|_| "mock port disconnected")
    }

    /// Wait up to two seconds for the driver to write `expected`.
    ///
    /// # Panics
    /// On timeout or mismatch.
    pub async fn expect_write(&mut self, expected: &[u8]) {
        let limit = Duration::from_secs(2);
        while self.write_buffer.len() < expected.len() {
            match tokio::time::timeout(limit, self.writes_rx.recv()).await {
                Ok(Some(chunk)) => self.write_buffer.extend_from_slice(&chunk),
                Ok(None) => panic!("driver side closed while expecting {expected:02X?}"),
                Err(_) => panic!(
                    "timed out waiting for {expected:02X?}, got {:02X?}",
                    self.write_buffer
                ),
            }
        }
        let actual: Vec<u8> = self.write_buffer.drain(..expected.len()).collect();
        assert_eq!(actual, expected, "unexpected bytes from driver");
    }

    pub async fn expect_and_respond(&mut self, expected: &[u8], response: &[u8]) {
        self.expect_write(expected).await;
        if let Err(e) = self.send_response(response) {
            panic!("{e}");
        }
    }

    /// Discard writes arriving within 50 ms.
    pub async fn drain_writes(&mut self) {
        while let Ok(Some(_)) =
            tokio::time::timeout(Duration::from_millis(50), self.writes_rx.recv()).await
        {}
        self.write_buffer.clear();
    }
}

// =============================================================================
// Line-oriented responder
// =============================================================================

/// Lines received by a [`MockInstrument`].
#[derive(Debug, Clone, Default)]
pub struct MockLog {
    lines: Arc<Mutex<Vec<String>>>,
    notify: Arc<Notify>,
}

impl MockLog {
    fn push(&self, line: String) {
        self.lines.lock().push(line);
        self.notify.notify_waiters();
    }

    pub fn commands(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    pub fn contains(&self, command: &str) -> bool {
        self.lines.lock().iter().any(|l| l == command)
    }

    /// Number of times `command` was received.
    pub fn count(&self, command: &str) -> usize {
        self.lines.lock().iter().filter(|l| *l == command).count()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    /// Wait until `command` has been received, up to `timeout`.
    pub async fn wait_for(&self, command: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.notify.notified();
            if self.contains(command) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.contains(command);
            }
        }
    }
}

/// Canned-reply instrument served over an in-memory duplex stream.
///
/// Replies registered with [`on`](Self::on) for the same command are played
/// in order; the last one repeats. Unknown commands get no reply, which the
/// driver sees as a timeout. GPIB controller lines (`++...`) are logged and
/// otherwise ignored.
#[derive(Debug, Clone)]
pub struct MockInstrument {
    replies: HashMap<String, VecDeque<Vec<u8>>>,
    echo: bool,
    prompt: Option<Vec<u8>>,
    reply_terminator: Vec<u8>,
    greeting: Option<Vec<u8>>,
}

impl Default for MockInstrument {
    fn default() -> Self {
        Self::new()
    }
}

impl MockInstrument {
    pub fn new() -> Self {
        Self {
            replies: HashMap::new(),
            echo: false,
            prompt: None,
            reply_terminator: b"\r\n".to_vec(),
            greeting: None,
        }
    }

    /// Reply to `command` with `reply` plus the reply terminator.
    pub fn on(mut self, command: &str, reply: &str) -> Self {
        let mut bytes = reply.as_bytes().to_vec();
        bytes.extend_from_slice(&self.reply_terminator);
        self.replies
            .entry(command.to_string())
            .or_default()
            .push_back(bytes);
        self
    }

    /// Reply to `command` with raw bytes, unterminated.
    pub fn on_bytes(mut self, command: &str, reply: &[u8]) -> Self {
        self.replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.to_vec());
        self
    }

    /// Echo each received line back before replying.
    pub fn echo(mut self) -> Self {
        self.echo = true;
        self
    }

    /// Print `prompt` after handling each line.
    pub fn prompt(mut self, prompt: &str) -> Self {
        self.prompt = Some(prompt.as_bytes().to_vec());
        self
    }

    /// Terminator for subsequently registered replies and echoes.
    pub fn reply_terminator(mut self, terminator: &str) -> Self {
        self.reply_terminator = terminator.as_bytes().to_vec();
        self
    }

    /// Unsolicited bytes sent as soon as the connection opens.
    pub fn greeting(mut self, bytes: &[u8]) -> Self {
        self.greeting = Some(bytes.to_vec());
        self
    }

    /// Start serving; returns the driver-side stream and the command log.
    pub fn spawn(self) -> (DynSerial, MockLog) {
        let (host, device) = tokio::io::duplex(64 * 1024);
        let log = MockLog::default();
        tokio::spawn(self.serve(device, log.clone()));
        (Box::new(host), log)
    }

    /// [`spawn`](Self::spawn) wrapped in a [`MessageTransport`].
    pub fn spawn_transport(
        self,
        name: &str,
        options: TransportOptions,
    ) -> (MessageTransport, MockLog) {
        let (port, log) = self.spawn();
        (MessageTransport::new(port, name).with_options(options), log)
    }

    async fn serve(mut self, mut device: tokio::io::DuplexStream, log: MockLog) {
        if let Some(greeting) = self.greeting.take() {
            if device.write_all(&greeting).await.is_err() {
                return;
            }
        }
        let mut pending = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = match device.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            pending.extend_from_slice(&buf[..n]);
            while let Some(pos) = pending.iter().position(|b| *b == b'\r' || *b == b'\n') {
                let raw: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw[..raw.len() - 1]).trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let out = self.respond(&line);
                log.push(line);
                if !out.is_empty() && device.write_all(&out).await.is_err() {
                    return;
                }
            }
        }
    }

    fn respond(&mut self, line: &str) -> Vec<u8> {
        if line.starts_with("++") {
            return Vec::new();
        }
        let mut out = Vec::new();
        if self.echo {
            out.extend_from_slice(line.as_bytes());
            out.extend_from_slice(&self.reply_terminator);
        }
        if let Some(queue) = self.replies.get_mut(line) {
            let reply = if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            };
            if let Some(reply) = reply {
                out.extend_from_slice(&reply);
            }
        }
        if let Some(prompt) = &self.prompt {
            out.extend_from_slice(prompt);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn harness_scripts_exchange() {
        let (port, mut harness) = pipe();
        let mut port = BufReader::new(port);
        let app = tokio::spawn(async move {
            port.write_all(b"PING\n").await.unwrap();
            let mut reply = String::new();
            port.read_line(&mut reply).await.unwrap();
            reply
        });
        harness.expect_and_respond(b"PING\n", b"PONG\n").await;
        assert_eq!(app.await.unwrap(), "PONG\n");
    }

    #[tokio::test]
    async fn instrument_plays_replies_in_order_then_repeats() {
        let (transport, log) = MockInstrument::new()
            .on("D?", "1")
            .on("D?", "2")
            .spawn_transport("mock", TransportOptions::default());
        assert_eq!(transport.query("D?").await.unwrap(), "1");
        assert_eq!(transport.query("D?").await.unwrap(), "2");
        assert_eq!(transport.query("D?").await.unwrap(), "2");
        assert_eq!(log.count("D?"), 3);
    }

    #[tokio::test]
    async fn instrument_echo_and_prompt() {
        let options = TransportOptions::default()
            .with_termination("\r", b'\r')
            .with_echo(true)
            .with_prompt(">");
        let (transport, log) = MockInstrument::new()
            .reply_terminator("\r")
            .echo()
            .prompt("> ")
            .on("pos?", "4")
            .spawn_transport("fw", options);
        transport.write("pos=2").await.unwrap();
        assert_eq!(transport.query("pos?").await.unwrap(), "4");
        assert_eq!(log.commands(), vec!["pos=2", "pos?"]);
    }

    #[tokio::test]
    async fn log_wait_for() {
        let (transport, log) =
            MockInstrument::new().spawn_transport("mock", TransportOptions::default());
        transport.write("OUTX 1").await.unwrap();
        assert!(log.wait_for("OUTX 1", Duration::from_secs(1)).await);
        assert!(!log.wait_for("never", Duration::from_millis(20)).await);
    }
}
