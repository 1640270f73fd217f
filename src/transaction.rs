//! The transaction composer: reset → select → write → read → delay, the
//! one sequence every slave driver builds on top of, shared by the active
//! and passive backends. The firmware backend packages the same five
//! fields into a single coprocessor command instead (see
//! [`crate::backend::FirmwareMaster`] and the executor), since it has no
//! raw selection byte to compose on the wire.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::rom::RomId;
use std::thread;
use std::time::Duration;

pub const MATCH_ROM: u8 = 0x55;
pub const SKIP_ROM: u8 = 0xCC;
pub const READ_ROM: u8 = 0x33;

/// The unit of work the executor dispatches.
#[derive(Clone, Debug, Default)]
pub struct Transaction {
    /// Emit a 1-Wire reset and require presence before the rest, unless
    /// `allow_absent` is set.
    pub reset: bool,
    /// `Some` issues match-ROM; `None` issues skip-ROM.
    pub target: Option<RomId>,
    /// Bytes transmitted after selection.
    pub write: Vec<u8>,
    /// Number of bytes to collect after the write.
    pub read_len: usize,
    /// Mandatory wait after the transaction completes, for slave-side
    /// conversion times.
    pub delay_ms: u64,
    /// Opaque token returned verbatim to the completion callback.
    pub context: u64,
    /// Allows a missing presence pulse to proceed rather than fail —
    /// needed by discovery code paths that probe for absence.
    pub allow_absent: bool,
}

/// Outcome of running a [`Transaction`] against a backend.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TransactionOutcome {
    pub read: Vec<u8>,
    pub alarm: bool,
}

/// Runs `tx` against `backend`: reset, selection, write, read, delay, in
/// that order, matching spec.md §4.6 exactly. Suspension points are the
/// backend's own I/O and the trailing `delay_ms` sleep; nothing else in
/// this function can block.
pub fn execute(backend: &mut dyn Backend, tx: &Transaction) -> Result<TransactionOutcome> {
    if let Some(result) = backend.execute_packaged(tx) {
        return result;
    }

    let mut alarm = false;
    if tx.reset {
        let presence = backend.reset()?;
        alarm = presence.alarm;
        if !presence.presence && !tx.allow_absent {
            return Err(Error::NoPresence);
        }
    }

    let mut buffer = Vec::with_capacity(9 + tx.write.len() + tx.read_len);
    match &tx.target {
        Some(rom) => {
            buffer.push(MATCH_ROM);
            buffer.extend_from_slice(&rom.as_bytes());
        }
        None => buffer.push(SKIP_ROM),
    }
    buffer.extend_from_slice(&tx.write);
    let write_len = buffer.len();
    buffer.extend(std::iter::repeat(0xFFu8).take(tx.read_len));

    let echoed = backend.block(&buffer)?;
    if echoed.len() != buffer.len() {
        return Err(Error::ProtocolFraming(format!(
            "block echoed {} bytes, expected {}",
            echoed.len(),
            buffer.len()
        )));
    }
    let read = echoed[write_len..].to_vec();
    if read.len() != tx.read_len {
        return Err(Error::ProtocolFraming(format!(
            "read {} bytes, expected {}",
            read.len(),
            tx.read_len
        )));
    }

    if tx.delay_ms > 0 {
        thread::sleep(Duration::from_millis(tx.delay_ms));
    }

    Ok(TransactionOutcome { read, alarm })
}
