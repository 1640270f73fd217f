//! Host-side driver for the 1-Wire bus: a wired-AND single-master bus
//! where every slave carries a 64-bit ROM id. Three backends speak the
//! same `reset`/`block`/`search_round` capability set over three
//! different wire encodings — DS2480-class active master, DS9097-class
//! passive bit-banger, and a firmware coprocessor offload — so slave
//! drivers, the enumerator, and the transaction composer are written
//! once and work against any of the three.

pub use self::error::{Error, Result};

pub mod backend;
pub mod config;
pub mod controller;
pub mod crc;
pub mod enumerator;
pub mod error;
pub mod executor;
pub mod roster;
pub mod rom;
pub mod search;
pub mod transaction;
pub mod transport;

pub use backend::{Backend, BackendKind, Level, ResetPresence};
pub use controller::BusController;
pub use rom::RomId;
pub use roster::{DeviceRoster, RosterDiff};
pub use transaction::{Transaction, TransactionOutcome};
