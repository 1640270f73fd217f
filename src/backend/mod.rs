//! The backend layer: one driver per wire encoding, dispatched as a tagged
//! variant rather than the source's string-tag-plus-`if`-chain, with a
//! shared capability set every backend implements and one optional
//! capability (`level`) only the active master exposes.

mod active;
mod firmware;
mod passive;

pub use active::ActiveMaster;
pub use firmware::{FirmwareCompletion, FirmwareMaster};
pub use passive::PassiveMaster;

use crate::error::Result;
use crate::rom::RomId;
use crate::search::{SearchMode, SearchState};
use crate::transaction::{Transaction, TransactionOutcome};

/// Outcome of a 1-Wire reset: whether any slave answered with a presence
/// pulse, and whether the reply indicated an alarm condition.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResetPresence {
    pub presence: bool,
    pub alarm: bool,
}

/// Bus power level, the one supported power-delivery primitive in scope
/// (spec Non-goals exclude anything beyond this).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Normal,
    StrongPullup,
}

/// Tag identifying which wire encoding a backend speaks, used by
/// `BusController` bookkeeping and diagnostics; not used for dispatch
/// (dispatch goes through the `Backend` trait object).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BackendKind {
    Active,
    Passive,
    Firmware,
}

/// Capability set shared by all three backends. `level` has a default
/// "unsupported" implementation since only the active master can drive a
/// strong pull-up.
pub trait Backend: Send {
    fn kind(&self) -> BackendKind;

    /// Issues a 1-Wire reset and returns presence/alarm. Non-suspending
    /// beyond the transport's own blocking I/O.
    fn reset(&mut self) -> Result<ResetPresence>;

    /// Transmits `write` and returns the same-length echo, one byte per
    /// 1-Wire byte time: sent bytes echo their own transmitted bits, and a
    /// byte sent as `0xFF` samples the bus during the corresponding read
    /// slot. Callers wanting to *read* N bytes append N `0xFF` fill bytes.
    fn block(&mut self, write: &[u8]) -> Result<Vec<u8>>;

    /// Runs one round of the ROM search state machine in `mode`, updating
    /// `state` in place. `last_rom` is the ROM id the previous round
    /// returned (used to resolve branches below `last_discrepancy`).
    fn search_round(
        &mut self,
        mode: SearchMode,
        state: &mut SearchState,
        last_rom: Option<&RomId>,
    ) -> Result<Option<RomId>>;

    fn level(&mut self, _level: Level) -> Result<()> {
        Err(crate::error::Error::Unsupported("strong pull-up"))
    }

    /// Override point for backends with no raw selection byte on the wire
    /// (the firmware backend packages reset/select/write/read/delay into one
    /// coprocessor command instead, see spec.md §4.6). Returning `None`
    /// tells [`crate::transaction::execute`] to fall back to its generic
    /// reset-select-write-read-delay composer over `block`.
    fn execute_packaged(&mut self, _tx: &Transaction) -> Option<Result<TransactionOutcome>> {
        None
    }
}
