//! Configuration string parsing and the active/passive auto-detection
//! sequence of spec.md §6.

use crate::backend::{ActiveMaster, Backend, FirmwareMaster, PassiveMaster};
use crate::error::{Error, Result};
use crate::transport::{ByteTransport, SerialTransport};
use log::{debug, warn};
use std::thread;
use std::time::{Duration, Instant};

const AUTODETECT_BAUD: u32 = 9600;
const TIMING_BYTE: u8 = 0xC1;
const PROBE: [u8; 5] = [0x17, 0x45, 0x5B, 0x0F, 0x91];
const MAX_PROBE_ATTEMPTS: usize = 100;
const PROBE_RETRY_BACKOFF: Duration = Duration::from_millis(500);
const PROBE_READ_WINDOW: Duration = Duration::from_millis(200);

const ACTIVE_FIRST_TIME: [[u8; 5]; 2] = [
    [0x16, 0x44, 0x5A, 0x00, 0x90],
    [0x16, 0x44, 0x5A, 0x00, 0x93],
];
const ACTIVE_REDETECT: [u8; 5] = [0x17, 0x45, 0x5B, 0x0F, 0x91];
const PASSIVE_FALLBACK_5: [u8; 5] = [0x17, 0x0A, 0x5B, 0x0F, 0x02];

/// What a configuration string's backend address resolved to, before the
/// active/passive split (which needs a live probe) is decided.
enum AddressKind {
    Serial(String),
    NetworkActive(String),
    Firmware(u8),
}

/// A parsed `<name> <backend-address> [options]` configuration line.
pub struct BusConfig {
    pub name: String,
    address: AddressKind,
    /// First option token, if present. The address grammar (spec.md §6)
    /// gives the firmware and network-active forms no device path of
    /// their own (a pin number, or a hostname no `serialport` transport
    /// can dial directly) — this crate requires the underlying serial
    /// link as an explicit option in those two cases rather than guessing
    /// one from the bus name.
    device_path: Option<String>,
}

impl BusConfig {
    /// Parses spec.md §6's configuration grammar. Only the first option
    /// token is interpreted (as the underlying serial device path); any
    /// further options are accepted and ignored — the host automation
    /// framework is the consumer of bus-specific options beyond that.
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| Error::Configuration("missing bus name".into()))?
            .to_string();
        let address = parts
            .next()
            .ok_or_else(|| Error::Configuration("missing backend address".into()))?;
        let device_path = parts.next().map(str::to_string);

        let address = if let Ok(pin) = address.parse::<u8>() {
            if pin <= 127 {
                AddressKind::Firmware(pin)
            } else {
                return Err(Error::Configuration(format!(
                    "firmware pin {pin} out of range 0..=127"
                )));
            }
        } else if address.contains("CUNO") || address.contains("COC") {
            AddressKind::NetworkActive(address.to_string())
        } else {
            AddressKind::Serial(address.to_string())
        };

        Ok(Self {
            name,
            address,
            device_path,
        })
    }

    /// Opens the transport implied by this configuration and, for serial
    /// addresses, runs the active/passive auto-detection sequence.
    pub fn open(&self) -> Result<Box<dyn Backend>> {
        match &self.address {
            AddressKind::Firmware(pin) => {
                let path = self.device_path.as_deref().ok_or_else(|| {
                    Error::Configuration(
                        "firmware backend requires a serial device path option".into(),
                    )
                })?;
                let transport = SerialTransport::open(path, AUTODETECT_BAUD)?;
                Ok(Box::new(FirmwareMaster::new(Box::new(transport), *pin)))
            }
            AddressKind::NetworkActive(addr) => {
                let path = self.device_path.as_deref().unwrap_or(addr);
                let transport = SerialTransport::open(path, AUTODETECT_BAUD)?;
                Ok(Box::new(ActiveMaster::new(Box::new(transport))?))
            }
            AddressKind::Serial(path) => {
                let mut transport = SerialTransport::open(path, AUTODETECT_BAUD)?;
                match detect(&mut transport)? {
                    Detected::Active => Ok(Box::new(ActiveMaster::new(Box::new(transport))?)),
                    Detected::Passive => Ok(Box::new(PassiveMaster::new(Box::new(transport)))),
                }
            }
        }
    }
}

enum Detected {
    Active,
    Passive,
}

/// Runs spec.md §6's detection table: one timing byte, then up to 100
/// probe/read rounds classified against the table of known replies.
fn detect(transport: &mut dyn ByteTransport) -> Result<Detected> {
    transport.write(&[TIMING_BYTE])?;

    for attempt in 0..MAX_PROBE_ATTEMPTS {
        transport.write(&PROBE)?;
        let deadline = Instant::now() + PROBE_READ_WINDOW;
        let reply = transport.read(5, deadline)?;

        if ACTIVE_FIRST_TIME.iter().any(|pattern| reply == pattern) || reply == ACTIVE_REDETECT {
            debug!("backend auto-detect: active master on attempt {attempt}");
            return Ok(Detected::Active);
        }
        if reply == PASSIVE_FALLBACK_5
            || reply.starts_with(&[0x00, 0x17, 0x0A, 0x5B, 0x0F])
            || reply.starts_with(&[0x30, 0xF8, 0x00])
        {
            debug!("backend auto-detect: passive master on attempt {attempt}");
            return Ok(Detected::Passive);
        }
        warn!("backend auto-detect: unrecognized reply {reply:02x?}, retrying");
        thread::sleep(PROBE_RETRY_BACKOFF);
    }

    Err(Error::TransportLost(
        "backend auto-detection exhausted all probe attempts".into(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_serial_address() {
        let config = BusConfig::parse("bus0 /dev/ttyUSB0").unwrap();
        assert_eq!(config.name, "bus0");
        assert!(matches!(config.address, AddressKind::Serial(_)));
    }

    #[test]
    fn parses_firmware_pin_address() {
        let config = BusConfig::parse("bus0 7").unwrap();
        assert!(matches!(config.address, AddressKind::Firmware(7)));
    }

    #[test]
    fn rejects_out_of_range_firmware_pin() {
        assert!(BusConfig::parse("bus0 128").is_err());
    }

    #[test]
    fn parses_network_active_address() {
        let config = BusConfig::parse("bus0 CUNO.local:4304").unwrap();
        assert!(matches!(config.address, AddressKind::NetworkActive(_)));
    }

    #[test]
    fn rejects_missing_address() {
        assert!(BusConfig::parse("bus0").is_err());
    }

    #[test]
    fn detect_classifies_active_redetect_reply() {
        let mut transport = crate::transport::mock::MockTransport::new();
        transport.push_reply(ACTIVE_REDETECT);
        assert!(matches!(detect(&mut transport).unwrap(), Detected::Active));
    }

    #[test]
    fn detect_classifies_passive_fallback_after_garbage() {
        let mut transport = crate::transport::mock::MockTransport::new();
        transport.push_reply([0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
        transport.push_reply([0xDE, 0xAD, 0xBE, 0xEF, 0x00]);
        transport.push_reply(PASSIVE_FALLBACK_5);
        let result = detect(&mut transport);
        assert!(matches!(result.unwrap(), Detected::Passive));
    }
}
