//! The enumerator: drives the search state machine to either discover
//! every present ROM id or filter down to the alarmed ones, and bounds how
//! long it will keep trying against a misbehaving bus.

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::rom::RomId;
use crate::search::{SearchMode, SearchState};
use log::warn;
use std::collections::HashSet;

/// Caps total search-round attempts per discover/alarm-scan call, so a
/// bus that keeps producing discrepancies (or a flaky transport) can't
/// wedge the caller in an unbounded loop.
const MAX_ATTEMPTS: usize = 256;

pub struct Enumerator {
    max_attempts: usize,
}

impl Enumerator {
    pub fn new() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
        }
    }

    pub fn discover(&self, backend: &mut dyn Backend) -> Result<HashSet<RomId>> {
        self.run(backend, SearchMode::Discover)
    }

    pub fn alarm_scan(&self, backend: &mut dyn Backend) -> Result<HashSet<RomId>> {
        self.run(backend, SearchMode::Alarm)
    }

    fn run(&self, backend: &mut dyn Backend, mode: SearchMode) -> Result<HashSet<RomId>> {
        let mut found = HashSet::new();
        let mut state = SearchState::default();
        let mut last_rom: Option<RomId> = None;

        for _ in 0..self.max_attempts {
            match backend.search_round(mode, &mut state, last_rom.as_ref()) {
                Ok(Some(rom)) => {
                    found.insert(rom);
                    last_rom = Some(rom);
                    if state.done {
                        break;
                    }
                }
                Ok(None) => break,
                Err(Error::CrcMismatch { .. }) | Err(Error::BusConflict(_)) | Err(Error::NoPresence) => {
                    warn!("search round self-terminated in {mode:?} mode after {} device(s)", found.len());
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(found)
    }
}

impl Default for Enumerator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{BackendKind, Level, ResetPresence};
    use crate::crc::crc8;
    use std::cell::RefCell;

    /// A backend double driven by the same simulated-bus wired-AND model
    /// the search unit tests use, wrapped so it can implement `Backend`.
    struct SimulatedBackend {
        candidates: RefCell<Vec<RomId>>,
        alarmed: RefCell<Vec<RomId>>,
    }

    impl SimulatedBackend {
        fn pair(candidates: &[RomId], b: u8) -> (bool, bool) {
            let mut id_bit = true;
            let mut cmp_id_bit = true;
            for rom in candidates {
                let bit = rom.bit(b);
                id_bit &= bit;
                cmp_id_bit &= !bit;
            }
            (id_bit, cmp_id_bit)
        }
    }

    impl Backend for SimulatedBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Passive
        }
        fn reset(&mut self) -> Result<ResetPresence> {
            Ok(ResetPresence {
                presence: true,
                alarm: false,
            })
        }
        fn block(&mut self, write: &[u8]) -> Result<Vec<u8>> {
            Ok(write.to_vec())
        }
        fn search_round(
            &mut self,
            mode: SearchMode,
            state: &mut SearchState,
            last_rom: Option<&RomId>,
        ) -> Result<Option<RomId>> {
            let pool = match mode {
                SearchMode::Discover => &self.candidates,
                SearchMode::Alarm => &self.alarmed,
            };
            crate::search::search_round(
                |b| Ok(Self::pair(&pool.borrow(), b)),
                |b, direction| {
                    pool.borrow_mut().retain(|rom| rom.bit(b) == direction);
                    Ok(())
                },
                state,
                last_rom,
            )
        }
        fn level(&mut self, _level: Level) -> Result<()> {
            Ok(())
        }
    }

    fn rom(serial: u8) -> RomId {
        let mut bytes = [0x28, 0, 0, 0, 0, 0, serial, 0];
        bytes[7] = crc8(&bytes[..7]);
        RomId::from_bytes(bytes).unwrap()
    }

    #[test]
    fn discover_finds_every_device_on_a_simulated_bus() {
        let roms: Vec<RomId> = (0..8).map(rom).collect();
        let mut backend = SimulatedBackend {
            candidates: RefCell::new(roms.clone()),
            alarmed: RefCell::new(Vec::new()),
        };
        let enumerator = Enumerator::new();
        let found = enumerator.discover(&mut backend).unwrap();
        let expected: HashSet<RomId> = roms.into_iter().collect();
        assert_eq!(found, expected);
    }

    #[test]
    fn empty_bus_yields_empty_roster_without_error() {
        let mut backend = SimulatedBackend {
            candidates: RefCell::new(Vec::new()),
            alarmed: RefCell::new(Vec::new()),
        };
        let enumerator = Enumerator::new();
        let found = enumerator.discover(&mut backend).unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn alarm_scan_is_subset_of_discover_on_same_bus() {
        let roms: Vec<RomId> = (0..5).map(rom).collect();
        let alarmed = vec![roms[2]];
        let mut backend = SimulatedBackend {
            candidates: RefCell::new(roms.clone()),
            alarmed: RefCell::new(alarmed.clone()),
        };
        let enumerator = Enumerator::new();
        let present = enumerator.discover(&mut backend).unwrap();
        let alarm_set = enumerator.alarm_scan(&mut backend).unwrap();
        assert!(alarm_set.is_subset(&present));
        assert_eq!(alarm_set, alarmed.into_iter().collect());
    }
}
