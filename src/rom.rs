//! ROM identifier: the 64-bit address every 1-Wire slave carries.

use crate::crc::crc8;
use crate::error::{Error, Result};
use std::fmt;

/// Well-known 1-Wire family codes, used only for the `get devices` CLI
/// listing's chip-name column.
pub mod family {
    pub const DS18S20: u8 = 0x10;
    pub const DS2406: u8 = 0x12;
    pub const DS1923: u8 = 0x1D;
    pub const DS2423: u8 = 0x1D;
    pub const DS2413: u8 = 0x3A;
    pub const DS2438: u8 = 0x26;
    pub const DS18B20: u8 = 0x28;
    pub const DS2408: u8 = 0x29;
    pub const DS2431: u8 = 0x2D;
}

/// Best-effort family byte -> marketing name, for diagnostics only.
pub fn chip_name(family_code: u8) -> &'static str {
    match family_code {
        family::DS18S20 => "DS18S20",
        family::DS2406 => "DS2406",
        family::DS2423 => "DS2423/DS1923",
        family::DS2413 => "DS2413",
        family::DS2438 => "DS2438",
        family::DS18B20 => "DS18B20",
        family::DS2408 => "DS2408",
        family::DS2431 => "DS2431",
        _ => "unknown",
    }
}

/// A 64-bit ROM identifier: `family(1) || serial(6) || crc8(1)`.
///
/// Constructed from the bus during search (or parsed from its printable
/// form); read-only thereafter. The invariant `crc8(family || serial) ==
/// crc` is checked at every construction site, never re-derived later.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RomId {
    bytes: [u8; 8],
}

impl RomId {
    /// Builds a `RomId` from its 8 wire bytes (family, 6 serial bytes, crc),
    /// verifying the CRC8 invariant.
    pub fn from_bytes(bytes: [u8; 8]) -> Result<Self> {
        let crc = crc8(&bytes[..7]);
        if crc != bytes[7] {
            return Err(Error::CrcMismatch {
                expected: crc as u16,
                got: bytes[7] as u16,
            });
        }
        Ok(Self { bytes })
    }

    /// Builds a `RomId` from a raw accumulator (bit 0 = family LSB, as
    /// assembled bit-by-bit by the search state machine) without
    /// re-verifying the CRC — callers that just computed it via the search
    /// loop verify separately and can skip the redundant check.
    pub(crate) fn from_accumulator_unchecked(accumulator: u64) -> Self {
        Self {
            bytes: accumulator.to_le_bytes(),
        }
    }

    pub fn family_code(&self) -> u8 {
        self.bytes[0]
    }

    pub fn serial(&self) -> [u8; 6] {
        let mut serial = [0u8; 6];
        serial.copy_from_slice(&self.bytes[1..7]);
        serial
    }

    pub fn crc(&self) -> u8 {
        self.bytes[7]
    }

    /// The 8 wire bytes, family first, CRC last — the order every write
    /// buffer and every match-ROM selection transmits LSB-first.
    pub fn as_bytes(&self) -> [u8; 8] {
        self.bytes
    }

    pub fn chip_name(&self) -> &'static str {
        chip_name(self.family_code())
    }

    /// Bit `b` (1-indexed, 1..=64) of the ROM id, LSB of byte 0 first.
    pub(crate) fn bit(&self, b: u8) -> bool {
        let index = (b - 1) as usize;
        let byte = self.bytes[index / 8];
        (byte >> (index % 8)) & 1 != 0
    }

    /// Parses the canonical printable form `FF.XXXXXXXXXXXX.CC`.
    pub fn parse(text: &str) -> Result<Self> {
        let parts: Vec<&str> = text.split('.').collect();
        if parts.len() != 3 || parts[0].len() != 2 || parts[1].len() != 12 || parts[2].len() != 2
        {
            return Err(Error::Configuration(format!(
                "malformed rom id {text:?}, expected FF.XXXXXXXXXXXX.CC"
            )));
        }
        let parse_byte = |s: &str| {
            u8::from_str_radix(s, 16)
                .map_err(|_| Error::Configuration(format!("malformed rom id {text:?}")))
        };
        let mut bytes = [0u8; 8];
        bytes[0] = parse_byte(parts[0])?;
        for i in 0..6 {
            bytes[1 + i] = parse_byte(&parts[1][2 * i..2 * i + 2])?;
        }
        bytes[7] = parse_byte(parts[2])?;
        Self::from_bytes(bytes)
    }
}

impl fmt::Display for RomId {
    /// `FF.XXXXXXXXXXXX.CC`: family hex, serial in bus order, CRC-8 hex.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}.", self.bytes[0])?;
        for byte in &self.bytes[1..7] {
            write!(f, "{byte:02X}")?;
        }
        write!(f, ".{:02X}", self.bytes[7])
    }
}

impl fmt::Debug for RomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RomId({self})")
    }
}
