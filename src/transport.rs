//! Byte transport: a narrow interface over a platform byte stream.
//!
//! Backends never touch a serial port or socket directly; they speak this
//! trait, which maps straight onto a host serial device (two baud rates are
//! used in practice: 9600 for framed commands, 115200 for bit-banging) or
//! onto an in-process client of a firmware coprocessor.

use crate::error::Result;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Contract every backend's physical link satisfies.
pub trait ByteTransport: Send {
    /// Writes `bytes`, returning how many were actually written. A partial
    /// write is reported, not retried: the caller decides whether to retry
    /// or abort.
    fn write(&mut self, bytes: &[u8]) -> Result<usize>;

    /// Reads up to `max` bytes, returning early once at least one byte has
    /// arrived or `deadline` has passed. Returns an empty vector on
    /// timeout, never an error for "nothing arrived yet".
    fn read(&mut self, max: usize, deadline: Instant) -> Result<Vec<u8>>;

    /// Switches the line rate. Some backends (the passive bit-banger) must
    /// switch baud before every bit and restore it after.
    fn set_baud(&mut self, baud: u32) -> Result<()>;

    /// Clears any sticky error/overrun state the transport may be holding.
    fn reset_errors(&mut self) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// Host serial device realization of [`ByteTransport`], backed by the
/// `serialport` crate.
pub struct SerialTransport {
    port: Box<dyn serialport::SerialPort>,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(50))
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .open()?;
        Ok(Self { port })
    }
}

impl ByteTransport for SerialTransport {
    fn write(&mut self, bytes: &[u8]) -> Result<usize> {
        Ok(self.port.write(bytes)?)
    }

    fn read(&mut self, max: usize, deadline: Instant) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max];
        let mut collected = Vec::new();
        while collected.is_empty() && Instant::now() < deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.port
                .set_timeout(remaining.min(Duration::from_millis(50)))?;
            match self.port.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => collected.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(collected)
    }

    fn set_baud(&mut self, baud: u32) -> Result<()> {
        Ok(self.port.set_baud_rate(baud)?)
    }

    fn reset_errors(&mut self) -> Result<()> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(Into::into)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! In-memory transport double used by the backend and protocol-engine
    //! tests: a script of canned reply chunks, consumed one `read` at a
    //! time, plus a log of every write for assertions.
    use super::*;
    use std::collections::VecDeque;

    pub struct MockTransport {
        pub writes: Vec<u8>,
        pub write_log: Vec<Vec<u8>>,
        replies: VecDeque<Vec<u8>>,
        pub baud: u32,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self {
                writes: Vec::new(),
                write_log: Vec::new(),
                replies: VecDeque::new(),
                baud: 9600,
            }
        }

        pub fn push_reply(&mut self, reply: impl Into<Vec<u8>>) -> &mut Self {
            self.replies.push_back(reply.into());
            self
        }
    }

    impl ByteTransport for MockTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<usize> {
            self.writes.extend_from_slice(bytes);
            self.write_log.push(bytes.to_vec());
            Ok(bytes.len())
        }

        fn read(&mut self, max: usize, _deadline: Instant) -> Result<Vec<u8>> {
            match self.replies.pop_front() {
                Some(mut reply) => {
                    reply.truncate(max);
                    Ok(reply)
                }
                None => Ok(Vec::new()),
            }
        }

        fn set_baud(&mut self, baud: u32) -> Result<()> {
            self.baud = baud;
            Ok(())
        }

        fn reset_errors(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }
}
