//! Serial transport for the LoRa modem AT link
//!
//! Protocol:
//! - Baud: 115200 by default, 8N1
//! - Outbound: `AT+PSEND=<hex>\r\n`
//! - Inbound: newline-terminated modem lines; only lines carrying
//!   `EVT:RXP2P` matter, everything else (OK, TX done, noise) is ignored
//!
//! The transport owns no arbitration: callers must hold the arbiter permit
//! before opening a connection. Dropping a [`SerialConnection`] closes the
//! port on every exit path.

use crate::domain::codec;
use std::io::ErrorKind;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{ClearBuffer, SerialPort, SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Attempts to open the port before giving up
const OPEN_ATTEMPTS: usize = 3;
/// Spacing between open attempts
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Largest read slice handed to the poll loop by `next_frame`
const READ_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open serial port {device}: {source}")]
    Open {
        device: String,
        #[source]
        source: tokio_serial::Error,
    },
    #[error("serial i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("no matching radio frame before deadline")]
    Timeout,
}

/// Factory for serial connections; carries the device path and baud rate.
#[derive(Debug, Clone)]
pub struct SerialLink {
    device: String,
    baud: u32,
}

impl SerialLink {
    pub fn new(device: &str, baud: u32) -> Self {
        Self { device: device.to_string(), baud }
    }

    /// Open the port, retrying up to three times with one second spacing,
    /// and drain both buffers.
    pub async fn open(&self) -> Result<SerialConnection, TransportError> {
        let mut last_err = None;

        for attempt in 1..=OPEN_ATTEMPTS {
            match tokio_serial::new(&self.device, self.baud)
                .timeout(Duration::from_millis(100))
                .open_native_async()
            {
                Ok(port) => {
                    info!(device = %self.device, attempt, "serial_port_opened");
                    if let Err(e) = port.clear(ClearBuffer::All) {
                        warn!(error = %e, "serial_buffer_clear_failed");
                    }
                    return Ok(SerialConnection { port, read_buffer: Vec::with_capacity(256) });
                }
                Err(e) => {
                    warn!(device = %self.device, attempt, error = %e, "serial_port_open_failed");
                    last_err = Some(e);
                    if attempt < OPEN_ATTEMPTS {
                        tokio::time::sleep(OPEN_RETRY_DELAY).await;
                    }
                }
            }
        }

        Err(TransportError::Open {
            device: self.device.clone(),
            source: last_err.unwrap_or_else(|| {
                tokio_serial::Error::new(tokio_serial::ErrorKind::Unknown, "open failed")
            }),
        })
    }
}

/// An open port plus a persistent read buffer.
///
/// Modem lines can arrive in chunks, so partial data is kept across reads.
pub struct SerialConnection {
    port: SerialStream,
    read_buffer: Vec<u8>,
}

impl SerialConnection {
    /// Write one `AT+PSEND` command and flush.
    pub async fn send_payload(&mut self, hex_payload: &str) -> Result<(), TransportError> {
        let at_command = format!("AT+PSEND={}\r\n", hex_payload);
        debug!(command = %at_command.trim_end(), "serial_send");
        self.port.write_all(at_command.as_bytes()).await?;
        self.port.flush().await?;
        Ok(())
    }

    /// Read for at most `slice` and return the next decoded `EVT:RXP2P`
    /// payload if one completed. `Ok(None)` means no frame yet; callers
    /// poll again, which gives them a checkpoint between slices.
    pub async fn poll_frame(&mut self, slice: Duration) -> Result<Option<String>, TransportError> {
        if let Some(frame) = take_frame(&mut self.read_buffer) {
            return Ok(Some(frame));
        }

        let mut chunk = [0u8; 256];
        match tokio::time::timeout(slice, self.port.read(&mut chunk)).await {
            Ok(Ok(n)) if n > 0 => {
                self.read_buffer.extend_from_slice(&chunk[..n]);
                Ok(take_frame(&mut self.read_buffer))
            }
            Ok(Ok(_)) => Ok(None),
            Ok(Err(e)) if e.kind() == ErrorKind::TimedOut => Ok(None),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// Poll until a frame arrives or the deadline elapses.
    pub async fn next_frame(&mut self, deadline: Duration) -> Result<String, TransportError> {
        let limit = Instant::now() + deadline;
        loop {
            let remaining = limit.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(TransportError::Timeout);
            }
            if let Some(frame) = self.poll_frame(remaining.min(READ_SLICE)).await? {
                return Ok(frame);
            }
        }
    }

    /// One full request/response cycle: send, then wait for the first frame.
    pub async fn exchange(
        &mut self,
        hex_payload: &str,
        deadline: Duration,
    ) -> Result<String, TransportError> {
        self.send_payload(hex_payload).await?;
        self.next_frame(deadline).await
    }
}

/// Pull complete lines off the buffer and return the first decodable
/// `EVT:RXP2P` payload. Lines that fail hex decoding are dropped; a
/// trailing partial line stays buffered for the next read.
fn take_frame(buffer: &mut Vec<u8>) -> Option<String> {
    while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
        let line_bytes: Vec<u8> = buffer.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&line_bytes);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        debug!(line = %line, "serial_line");

        let Some(hex_payload) = codec::extract_frame_payload(line) else {
            continue;
        };
        match codec::decode(hex_payload) {
            Some(ascii) => return Some(ascii),
            None => continue,
        }
    }
    None
}
