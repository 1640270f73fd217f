use thiserror::Error;

/// Result
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Error
///
/// One variant per error kind the bus driver can surface to a slave driver
/// or to the host's `get`/`set` command surface.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport lost: {0}")]
    TransportLost(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serial(#[from] serialport::Error),
    #[error("timeout waiting for {0}")]
    Timeout(&'static str),
    #[error("protocol framing error: {0}")]
    ProtocolFraming(String),
    #[error("no presence pulse on reset")]
    NoPresence,
    #[error("crc mismatch {{ expected={expected:#04x}, got={got:#04x} }}")]
    CrcMismatch { expected: u16, got: u16 },
    #[error("bus conflict: {0}")]
    BusConflict(String),
    #[error("request cancelled")]
    Cancelled,
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("device not found")]
    DeviceNotFound,
    #[error("unsupported operation on this backend: {0}")]
    Unsupported(&'static str),
}

impl Error {
    /// User-visible one-line diagnostic naming the bus, the operation, and
    /// the error kind, per the `get`/`set` command contract.
    pub fn diagnostic(&self, bus: &str, operation: &str) -> String {
        format!("{bus}: {operation}: {self}")
    }
}
