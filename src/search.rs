//! The classical 1-Wire ROM search: a branch-and-bound algorithm that walks
//! bit discrepancies to enumerate every ROM id on the bus, or (in alarm
//! mode) every ROM id whose alarm condition is asserted.
//!
//! The decision rule in [`decide`] is a pure function of the bit index, the
//! two bus readings at that bit, the running [`SearchState`], and the
//! previous round's ROM id. Kept pure and free of I/O so it can drive both
//! the passive backend's live bit-by-bit loop and the active backend's
//! batch search-accelerator protocol (which must precompute a full 64-bit
//! guess buffer before it has seen any bus response, then replay the exact
//! same rule against the accelerator's reply to reconstruct what actually
//! happened on the wire).

use crate::crc::crc8;
use crate::error::{Error, Result};
use crate::rom::RomId;

/// Command byte that selects discover-or-verify search vs. alarm search.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SearchMode {
    Discover,
    Alarm,
}

impl SearchMode {
    pub fn command(self) -> u8 {
        match self {
            SearchMode::Discover => 0xF0,
            SearchMode::Alarm => 0xEC,
        }
    }
}

/// Three counters tracked across successive search steps. Cleared by
/// [`SearchState::default`], updated in place by [`search_round`], and
/// reset whenever a round fails CRC or the bus fails to present.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SearchState {
    /// Bit index (1..=64) of the most recent branch point, or 0 if none.
    pub last_discrepancy: u8,
    /// Same, but confined to the family byte (bits 1..=8).
    pub last_family_discrepancy: u8,
    pub done: bool,
}

impl SearchState {
    /// Seeds a state for the "verify a candidate is still present" search
    /// variant: pretend the whole ROM id was a discrepancy, so the round
    /// walks every bit of `candidate` and fails if any slave disagrees.
    pub fn verify_seed() -> Self {
        Self {
            last_discrepancy: 64,
            last_family_discrepancy: 0,
            done: false,
        }
    }
}

enum BitOutcome {
    NoDevices,
    Taken(bool),
}

fn decide(b: u8, id_bit: bool, cmp_id_bit: bool, state: &SearchState, last_rom: Option<&RomId>) -> BitOutcome {
    if id_bit && cmp_id_bit {
        return BitOutcome::NoDevices;
    }
    if id_bit != cmp_id_bit {
        return BitOutcome::Taken(id_bit);
    }
    let direction = if b < state.last_discrepancy {
        last_rom.is_some_and(|rom| rom.bit(b))
    } else if b == state.last_discrepancy {
        true
    } else {
        false
    };
    BitOutcome::Taken(direction)
}

/// Precomputes the 64 direction bits the active backend must send to the
/// search accelerator *before* it has seen any live response: every bit is
/// treated as a hypothetical discrepancy (`id_bit = cmp_id_bit = false`),
/// matching what the hardware actually consults the guess for — at a true
/// discrepancy point the bus genuinely reads `00`, and at any other point
/// the hardware resolves the branch on its own and ignores the guess.
pub(crate) fn guess_directions(state: &SearchState, last_rom: Option<&RomId>) -> [bool; 64] {
    let mut guesses = [false; 64];
    for b in 1..=64u8 {
        if let BitOutcome::Taken(direction) = decide(b, false, false, state, last_rom) {
            guesses[(b - 1) as usize] = direction;
        }
    }
    guesses
}

/// Runs one full 64-bit search round.
///
/// `read_pair(b)` must yield `(id_bit, cmp_id_bit)` for bit `b` — either by
/// reading two bits live off the wire (passive backend), or by indexing
/// into a buffer the search accelerator already returned (active backend).
/// `write_direction(b, direction)` must commit the chosen direction bit —
/// either by writing it live (passive), or as a no-op (active, where the
/// bit was already physically sent as part of the guess buffer).
///
/// Returns `Ok(None)` if the state was already terminal, or the ROM id
/// this round found. A CRC failure or a bus conflict (`id_bit ==
/// cmp_id_bit == true` at some bit, meaning no slave answered) resets
/// `state` to default and the caller should abort this search sequence.
pub(crate) fn search_round<R, W>(
    mut read_pair: R,
    mut write_direction: W,
    state: &mut SearchState,
    last_rom: Option<&RomId>,
) -> Result<Option<RomId>>
where
    R: FnMut(u8) -> Result<(bool, bool)>,
    W: FnMut(u8, bool) -> Result<()>,
{
    if state.done {
        return Ok(None);
    }

    let mut accumulator: u64 = 0;
    let mut last_zero: u8 = 0;
    let mut last_family_zero: u8 = 0;

    for b in 1..=64u8 {
        let (id_bit, cmp_id_bit) = read_pair(b)?;
        let direction = match decide(b, id_bit, cmp_id_bit, state, last_rom) {
            BitOutcome::NoDevices => {
                *state = SearchState::default();
                return Err(Error::BusConflict(format!(
                    "no device responded at bit {b}"
                )));
            }
            BitOutcome::Taken(direction) => direction,
        };
        if id_bit == cmp_id_bit && !direction {
            last_zero = b;
            if b < 9 {
                last_family_zero = b;
            }
        }
        write_direction(b, direction)?;
        if direction {
            accumulator |= 1u64 << (b - 1);
        }
    }

    state.last_discrepancy = last_zero;
    state.last_family_discrepancy = last_family_zero;
    if last_zero == 0 {
        state.done = true;
    }

    let rom_bytes = accumulator.to_le_bytes();
    let crc = crc8(&rom_bytes[..7]);
    if crc != rom_bytes[7] {
        *state = SearchState::default();
        return Err(Error::CrcMismatch {
            expected: crc as u16,
            got: rom_bytes[7] as u16,
        });
    }
    Ok(Some(RomId::from_accumulator_unchecked(accumulator)))
}

#[cfg(test)]
mod test {
    use super::*;

    /// A simulated bus: each device contributes its bit at every position;
    /// the bus ANDs the non-complement readings and ANDs the complements,
    /// the classical 1-Wire wired-AND behavior. Interior mutability lets
    /// the read and write closures both hold only a shared reference.
    struct SimulatedBus {
        candidates: std::cell::RefCell<Vec<RomId>>,
    }

    impl SimulatedBus {
        fn pair(&self, b: u8) -> (bool, bool) {
            let mut id_bit = true;
            let mut cmp_id_bit = true;
            for rom in self.candidates.borrow().iter() {
                let bit = rom.bit(b);
                id_bit &= bit;
                cmp_id_bit &= !bit;
            }
            (id_bit, cmp_id_bit)
        }

        fn filter(&self, b: u8, direction: bool) {
            self.candidates
                .borrow_mut()
                .retain(|rom| rom.bit(b) == direction);
        }
    }

    fn rom_with_bits(family: u8, serial: [u8; 6]) -> RomId {
        let mut bytes = [0u8; 8];
        bytes[0] = family;
        bytes[1..7].copy_from_slice(&serial);
        bytes[7] = crc8(&bytes[..7]);
        RomId::from_bytes(bytes).unwrap()
    }

    fn run_discover(devices: Vec<RomId>) -> Vec<RomId> {
        let mut found = Vec::new();
        let mut state = SearchState::default();
        let mut last_rom: Option<RomId> = None;
        loop {
            let bus = SimulatedBus {
                candidates: std::cell::RefCell::new(devices.clone()),
            };
            // Filter candidates down to only those consistent with already
            // chosen prefix bits, mirroring what physically happens as the
            // search commits directions bit by bit.
            let result = search_round(
                |b| Ok(bus.pair(b)),
                |b, direction| {
                    bus.filter(b, direction);
                    Ok(())
                },
                &mut state,
                last_rom.as_ref(),
            )
            .unwrap();
            match result {
                Some(rom) => {
                    found.push(rom);
                    last_rom = Some(rom);
                }
                None => break,
            }
            if state.done {
                break;
            }
        }
        found
    }

    #[test]
    fn discover_empty_bus_terminates_immediately() {
        let mut state = SearchState::default();
        let result = search_round(|_| Ok((true, true)), |_, _| Ok(()), &mut state, None);
        assert!(matches!(result, Err(Error::BusConflict(_))));
        assert_eq!(state, SearchState::default());
    }

    #[test]
    fn discover_single_device() {
        let rom = rom_with_bits(0x10, [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let found = run_discover(vec![rom]);
        assert_eq!(found, vec![rom]);
    }

    #[test]
    fn discover_two_devices_completes_in_two_rounds() {
        let a = rom_with_bits(0x10, [0, 0, 0, 0, 0, 0x0A]);
        let b = rom_with_bits(0x10, [0, 0, 0, 0, 0, 0x0B]);
        let found = run_discover(vec![a, b]);
        assert_eq!(found.len(), 2);
        assert!(found.contains(&a));
        assert!(found.contains(&b));
    }

    #[test]
    fn discover_many_devices_multiset_equality() {
        let roms: Vec<RomId> = (0u8..16)
            .map(|i| rom_with_bits(0x28, [0, 0, 0, 0, 0, i]))
            .collect();
        let mut found = run_discover(roms.clone());
        let mut expected = roms;
        found.sort();
        expected.sort();
        assert_eq!(found, expected);
    }

    #[test]
    fn verify_is_fixed_point_of_discover() {
        let rom = rom_with_bits(0x28, [1, 2, 3, 4, 5, 6]);
        let mut state = SearchState::verify_seed();
        let bus = SimulatedBus {
            candidates: std::cell::RefCell::new(vec![rom]),
        };
        let result = search_round(
            |b| Ok(bus.pair(b)),
            |_, _| Ok(()),
            &mut state,
            Some(&rom),
        )
        .unwrap();
        assert_eq!(result, Some(rom));
    }

    #[test]
    fn guess_directions_matches_prior_rom_below_last_discrepancy() {
        let rom = rom_with_bits(0x28, [0, 0, 0, 0, 0, 0b0000_0101]);
        let state = SearchState {
            last_discrepancy: 40,
            last_family_discrepancy: 0,
            done: false,
        };
        let guesses = guess_directions(&state, Some(&rom));
        for b in 1..40u8 {
            assert_eq!(guesses[(b - 1) as usize], rom.bit(b));
        }
        assert!(guesses[39]); // bit == last_discrepancy forced to 1
        assert!(!guesses[40]); // bit > last_discrepancy forced to 0
    }
}
