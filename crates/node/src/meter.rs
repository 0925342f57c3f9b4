//! Power meter channel: one request/settle/read/decode round-trip per call.
//!
//! The serial transport has no "response ready" signal, so the channel writes
//! the request, waits a fixed settle interval and then takes whatever bytes
//! the port has buffered.  Retry policy belongs to the caller.

use std::io;
use std::time::Duration;

use thiserror::Error;
use tokio::time::sleep;

use crate::frame::{self, DecodeError, ElectricalSample, ReadRequest, RESPONSE_LEN};

/// Default wait between writing the request and reading the response.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(200);

// ── Transport seam ──────────────────────────────────────────────────────────

/// Byte-level serial transport as the meter channel needs it.
pub trait SerialLink {
    /// Write the whole buffer.
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    /// Number of bytes waiting in the receive buffer.
    fn bytes_available(&mut self) -> io::Result<usize>;
    /// Drain and return every buffered byte.
    fn read_available(&mut self) -> io::Result<Vec<u8>>;
}

/// Diagnostic outcome of a failed sample.  None of these are fatal.
#[derive(Debug, Error)]
pub enum MeterFault {
    #[error("meter did not respond")]
    NoResponse,
    #[error("incomplete packet: {received} of {RESPONSE_LEN} bytes")]
    IncompletePacket { received: usize },
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),
    #[error("serial i/o failed: {0}")]
    Io(#[from] io::Error),
}

// ── Channel ─────────────────────────────────────────────────────────────────

pub struct MeterChannel<S> {
    port: S,
    request: [u8; 8],
    settle: Duration,
}

impl<S: SerialLink> MeterChannel<S> {
    pub fn new(port: S, request: ReadRequest, settle: Duration) -> Self {
        Self {
            port,
            request: request.encode(),
            settle,
        }
    }

    /// Request, wait, read, decode.  Exactly one write and at most one read.
    pub async fn sample(&mut self) -> Result<ElectricalSample, MeterFault> {
        self.port.write_all(&self.request)?;

        // Blocks the whole loop; there is nothing else to run meanwhile.
        sleep(self.settle).await;

        if self.port.bytes_available()? == 0 {
            return Err(MeterFault::NoResponse);
        }

        let response = self.port.read_available()?;
        if response.len() < RESPONSE_LEN {
            return Err(MeterFault::IncompletePacket {
                received: response.len(),
            });
        }

        Ok(frame::decode(&response)?)
    }
}

// ── Raspberry Pi UART ───────────────────────────────────────────────────────

#[cfg(feature = "hardware")]
pub use uart::UartPort;

#[cfg(feature = "hardware")]
mod uart {
    use std::io;
    use std::time::Duration;

    use rppal::uart::{Parity, Uart};

    use super::SerialLink;

    /// 8N1 UART backed by `rppal`, reads in non-blocking mode.
    pub struct UartPort {
        uart: Uart,
    }

    impl UartPort {
        pub fn open(path: &str, baud_rate: u32) -> anyhow::Result<Self> {
            let mut uart = Uart::with_path(path, baud_rate, Parity::None, 8, 1)?;
            uart.set_read_mode(0, Duration::ZERO)?;
            uart.set_write_mode(true)?;

            tracing::info!(path, baud_rate, "meter uart opened");

            Ok(Self { uart })
        }
    }

    impl SerialLink for UartPort {
        fn write_all(&mut self, mut bytes: &[u8]) -> io::Result<()> {
            while !bytes.is_empty() {
                let n = self.uart.write(bytes).map_err(io::Error::other)?;
                if n == 0 {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                bytes = &bytes[n..];
            }
            Ok(())
        }

        fn bytes_available(&mut self) -> io::Result<usize> {
            self.uart.input_len().map_err(io::Error::other)
        }

        fn read_available(&mut self) -> io::Result<Vec<u8>> {
            let mut out = Vec::with_capacity(super::RESPONSE_LEN);
            let mut buf = [0u8; 64];
            loop {
                let n = self.uart.read(&mut buf).map_err(io::Error::other)?;
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            Ok(out)
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
