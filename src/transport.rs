//! Serial link to the stage controller.
//!
//! The protocol is newline-delimited ASCII: the host writes one command
//! line, the controller echoes one response line (`ok` or `error:...`).
//! The dispatcher owns the transport exclusively for the lifetime of a
//! connection; everything behind the [`Transport`] trait so the dispatcher
//! can be driven by a simulated link in tests and dry runs.

use std::time::Duration;

use async_trait::async_trait;
use serial2_tokio::SerialPort;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("serial port error: {0}")]
    Serial(#[from] std::io::Error),
    #[error("not connected to the stage controller")]
    NotConnected,
    #[error("timeout waiting for controller response")]
    Timeout,
    #[error("controller sent invalid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// One write / one response-line exchange with the controller.
#[async_trait]
pub trait Transport: Send {
    /// Transmit one command line; a trailing newline is appended if absent.
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError>;
    /// Read the controller's next response line, without the terminator.
    async fn read_line(&mut self) -> Result<String, TransportError>;
}

/// Real serial link via serial2-tokio.
pub struct SerialTransport {
    port: SerialPort,
    read_buf: Vec<u8>,
    response_timeout: Duration,
}

impl SerialTransport {
    pub async fn open(port_name: &str, baud: u32) -> Result<Self, TransportError> {
        tracing::info!("opening serial port {} at {} baud", port_name, baud);
        let port = SerialPort::open(port_name, baud)?;
        Ok(Self {
            port,
            read_buf: Vec::new(),
            response_timeout: Duration::from_millis(5000),
        })
    }

    pub fn set_response_timeout(&mut self, timeout: Duration) {
        self.response_timeout = timeout;
    }

    /// GRBL boot sequence: send a bare newline pair, give the controller
    /// time to come up, then discard the boot banner.
    pub async fn wake(&mut self) -> Result<(), TransportError> {
        self.port.write_all(b"\r\n\r\n").await?;
        tokio::time::sleep(Duration::from_secs(2)).await;
        self.drain().await;
        Ok(())
    }

    /// Discard whatever the controller has sent so far.
    async fn drain(&mut self) {
        let mut buf = [0u8; 256];
        while let Ok(Ok(n)) = timeout(Duration::from_millis(50), self.port.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            tracing::trace!("drained {} bytes of controller output", n);
        }
        self.read_buf.clear();
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        tracing::debug!("stage <- {}", line.trim_end());
        let framed = if line.ends_with('\n') {
            line.to_string()
        } else {
            format!("{line}\n")
        };
        self.port.write_all(framed.as_bytes()).await?;
        self.port.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        loop {
            if let Some(pos) = self.read_buf.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = self.read_buf.drain(..=pos).collect();
                let text = String::from_utf8(line)?;
                let text = text.trim_end().to_string();
                tracing::debug!("stage -> {}", text);
                return Ok(text);
            }
            let mut buf = [0u8; 256];
            let n = timeout(self.response_timeout, self.port.read(&mut buf))
                .await
                .map_err(|_| TransportError::Timeout)??;
            if n == 0 {
                return Err(TransportError::NotConnected);
            }
            self.read_buf.extend_from_slice(&buf[..n]);
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    sent: Vec<String>,
    scripted: std::collections::VecDeque<String>,
    pending: std::collections::VecDeque<String>,
}

/// Loopback link for tests and dry runs: acknowledges every command with
/// `ok` (or a scripted response) and records what was sent.
///
/// Clones share state, so a test can keep one handle while the dispatcher
/// owns another.
#[derive(Debug, Clone, Default)]
pub struct SimTransport {
    state: std::sync::Arc<std::sync::Mutex<SimState>>,
}

impl SimTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim transport mutex poisoned")
    }

    /// Queue a canned response to use instead of `ok` for an upcoming
    /// command, in FIFO order.
    pub fn script_response(&self, response: impl Into<String>) {
        self.lock().scripted.push_back(response.into());
    }

    /// Every line transmitted so far, in transmission order.
    pub fn sent(&self) -> Vec<String> {
        self.lock().sent.clone()
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn send_line(&mut self, line: &str) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.sent.push(line.trim_end().to_string());
        let response = state
            .scripted
            .pop_front()
            .unwrap_or_else(|| "ok".to_string());
        state.pending.push_back(response);
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, TransportError> {
        self.lock()
            .pending
            .pop_front()
            .ok_or(TransportError::NotConnected)
    }
}
