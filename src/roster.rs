//! The device roster: the set of ROM ids last seen present on the bus, and
//! the set last seen alarmed. Written only by the enumerator (on the
//! executor's worker context); clients read it through snapshot copies.

use crate::rom::RomId;
use std::collections::HashSet;

/// What changed between two successive `present` snapshots. Autocreate/
/// adopt/retire policy for slave-driver bindings lives in the host
/// automation framework; the core only publishes this diff.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RosterDiff {
    pub added: Vec<RomId>,
    pub removed: Vec<RomId>,
}

/// Two sets of `RomId`s, populated by enumeration and alarm-scan
/// respectively. Every element is, by construction, a CRC-valid `RomId` —
/// nothing can be inserted into either set except the output of a
/// successful search round.
#[derive(Clone, Debug, Default)]
pub struct DeviceRoster {
    present: HashSet<RomId>,
    alarmed: HashSet<RomId>,
}

impl DeviceRoster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn present(&self) -> &HashSet<RomId> {
        &self.present
    }

    pub fn alarmed(&self) -> &HashSet<RomId> {
        &self.alarmed
    }

    /// Replaces the present set with `found`, returning the diff against
    /// the previous snapshot.
    pub fn replace_present(&mut self, found: HashSet<RomId>) -> RosterDiff {
        let added = found.difference(&self.present).copied().collect();
        let removed = self.present.difference(&found).copied().collect();
        self.present = found;
        RosterDiff { added, removed }
    }

    pub fn replace_alarmed(&mut self, found: HashSet<RomId>) {
        self.alarmed = found;
    }
}
