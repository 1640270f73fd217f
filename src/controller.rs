//! `BusController`: the façade spec.md §4.9 describes, exposed to slave
//! drivers and to the host's `get`/`set` command surface (§6). Owns one
//! backend, one roster, and the sticky alarm flag for exactly one
//! configured bus — nothing here is process-wide global state (§9).

use crate::backend::Backend;
use crate::config::BusConfig;
use crate::enumerator::Enumerator;
use crate::error::{Error, Result};
use crate::rom::RomId;
use crate::roster::{DeviceRoster, RosterDiff};
use crate::transaction::{self, Transaction};
use log::{info, warn};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

/// `set interval` clamps below this floor instead of erroring, matching
/// the original driver's tolerant-degrade style (spec.md §9).
const MIN_KICK_INTERVAL_SECS: u64 = 15;
const KICK_COMMAND: [u8; 2] = [0xCC, 0x44];
const KICK_SETTLE: Duration = Duration::from_millis(500);

/// Clamps a requested kick interval to the spec-mandated floor.
fn kick_interval_floor(requested_secs: u64) -> u64 {
    requested_secs.max(MIN_KICK_INTERVAL_SECS)
}

struct Policy {
    interval_secs: u64,
    follow_alarms: bool,
    kick_enabled: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            interval_secs: MIN_KICK_INTERVAL_SECS,
            follow_alarms: false,
            kick_enabled: false,
        }
    }
}

/// One configured 1-Wire bus: a backend, its device roster, the sticky
/// alarm flag, and the kick policy. `Mutex`-guarded internals let
/// `handle_command` take `&self` (the host automation framework holds one
/// `Arc<BusController>` per bus and calls it from multiple client
/// contexts), matching §5's "client context" vs. "worker context" split —
/// here both collapse onto whichever thread calls in, serialized by the
/// mutex rather than a dedicated worker.
pub struct BusController {
    name: String,
    backend: Mutex<Box<dyn Backend>>,
    roster: Mutex<DeviceRoster>,
    alarmed_flag: Mutex<bool>,
    policy: Mutex<Policy>,
    enumerator: Enumerator,
}

impl BusController {
    /// Opens the transport, detects the backend, and starts with an empty
    /// roster. Scheduling the periodic `kick` (spec.md §4.9) is the host
    /// automation framework's job once it owns this controller; this
    /// crate only exposes `kick()` and `set()` for the host to drive.
    pub fn init(config: &BusConfig) -> Result<Self> {
        let backend = config.open()?;
        Ok(Self {
            name: config.name.clone(),
            backend: Mutex::new(backend),
            roster: Mutex::new(DeviceRoster::new()),
            alarmed_flag: Mutex::new(false),
            policy: Mutex::new(Policy::default()),
            enumerator: Enumerator::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Issues a bus reset and updates the sticky alarm flag per spec.md
    /// §7: cleared on `r2 == 3` (no presence, no alarm), set on `r2 == 2`.
    pub fn reset(&self) -> Result<bool> {
        let mut backend = self.backend.lock().unwrap();
        let presence = backend.reset()?;
        if presence.alarm {
            *self.alarmed_flag.lock().unwrap() = true;
        } else if !presence.presence {
            *self.alarmed_flag.lock().unwrap() = false;
        }
        Ok(presence.alarm)
    }

    /// Runs discovery and replaces the present roster, returning the diff.
    /// Autocreate/adopt/retire policy for slave driver bindings lives in
    /// the host; this only publishes the diff (spec.md §4.9).
    pub fn discover(&self) -> Result<RosterDiff> {
        let found = {
            let mut backend = self.backend.lock().unwrap();
            self.enumerator.discover(backend.as_mut())?
        };
        Ok(self.roster.lock().unwrap().replace_present(found))
    }

    /// Runs an alarm-scan and replaces the alarmed roster.
    pub fn alarms(&self) -> Result<Vec<RomId>> {
        let found = {
            let mut backend = self.backend.lock().unwrap();
            self.enumerator.alarm_scan(backend.as_mut())?
        };
        let mut roster = self.roster.lock().unwrap();
        roster.replace_alarmed(found);
        let mut alarmed: Vec<RomId> = roster.alarmed().iter().copied().collect();
        alarmed.sort();
        Ok(alarmed)
    }

    /// One seeded search step confirming `rom_id` is still present
    /// (spec.md §8 property 6: verify is a fixed point of discover).
    pub fn verify(&self, rom_id: &RomId) -> Result<bool> {
        let mut backend = self.backend.lock().unwrap();
        let mut state = crate::search::SearchState::verify_seed();
        let found = backend.search_round(
            crate::search::SearchMode::Discover,
            &mut state,
            Some(rom_id),
        )?;
        Ok(found.as_ref() == Some(rom_id))
    }

    /// Builds and dispatches a transaction against `target` (or every
    /// device, skip-ROM, if `None`).
    pub fn complex(
        &self,
        target: Option<RomId>,
        write: Vec<u8>,
        read_len: usize,
        delay_ms: u64,
    ) -> Result<Vec<u8>> {
        let tx = Transaction {
            reset: true,
            target,
            write,
            read_len,
            delay_ms,
            ..Default::default()
        };
        let mut backend = self.backend.lock().unwrap();
        let outcome = transaction::execute(backend.as_mut(), &tx)?;
        Ok(outcome.read)
    }

    /// Broadcasts the skip-ROM temperature-convert command to every
    /// parasitic-powered device on the bus and waits for the conversion
    /// window, when the installation opts into periodic kicks.
    pub fn kick(&self) -> Result<()> {
        if !self.policy.lock().unwrap().kick_enabled {
            return Ok(());
        }
        let mut backend = self.backend.lock().unwrap();
        backend.block(&KICK_COMMAND)?;
        drop(backend);
        thread::sleep(KICK_SETTLE);
        if self.policy.lock().unwrap().follow_alarms && *self.alarmed_flag.lock().unwrap() {
            info!("{}: alarm flag set, running alarm-scan after kick", self.name);
            drop(self.alarms()?);
        }
        Ok(())
    }

    /// Adjusts kick cadence and alarm-follow policy; interval is clamped
    /// to the 15 s floor rather than rejected (spec.md §9).
    pub fn set(&self, interval_secs: u64, follow_alarms: bool) {
        let mut policy = self.policy.lock().unwrap();
        let clamped = kick_interval_floor(interval_secs);
        if clamped != interval_secs {
            warn!(
                "{}: requested kick interval {interval_secs}s clamped to floor {clamped}s",
                self.name
            );
        }
        policy.interval_secs = clamped;
        policy.follow_alarms = follow_alarms;
        policy.kick_enabled = true;
    }

    pub fn interval_secs(&self) -> u64 {
        self.policy.lock().unwrap().interval_secs
    }

    /// Runs one `get`/`set` CLI command (spec.md §6) and formats the
    /// result (or the error, per §7's `"<bus>: <operation>: <kind>"`
    /// contract) as a single response string.
    pub fn handle_command(&self, line: &str) -> String {
        let mut parts = line.split_whitespace();
        let verb = parts.next().unwrap_or("");
        let noun = parts.next().unwrap_or("");
        let rest: Vec<&str> = parts.collect();

        match (verb, noun) {
            ("get", "alarms") => self.cmd_get_alarms(),
            ("get", "devices") => self.cmd_get_devices(),
            ("get", "raw") => self.cmd_get_raw(&rest),
            ("set", "interval") => self.cmd_set_interval(&rest),
            ("set", "followAlarms") => self.cmd_set_follow_alarms(&rest),
            _ => format!("{}: {line}: unrecognized command", self.name),
        }
    }

    fn cmd_get_alarms(&self) -> String {
        match self.alarms() {
            Ok(ids) => ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join("\n"),
            Err(e) => e.diagnostic(&self.name, "get alarms"),
        }
    }

    fn cmd_get_devices(&self) -> String {
        match self.discover() {
            Ok(_) => {
                let roster = self.roster.lock().unwrap();
                let mut ids: Vec<RomId> = roster.present().iter().copied().collect();
                ids.sort();
                ids.iter()
                    .map(|id| {
                        let serial: String = id.serial().iter().map(|b| format!("{b:02X}")).collect();
                        format!("{:02X}.{serial} {}", id.family_code(), id.chip_name())
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            }
            Err(e) => e.diagnostic(&self.name, "get devices"),
        }
    }

    fn cmd_get_raw(&self, rest: &[&str]) -> String {
        let result = (|| -> Result<Vec<u8>> {
            let target = match rest.first() {
                Some(&id) => Some(RomId::parse(id)?),
                None => return Err(Error::Configuration("get raw requires a rom id".into())),
            };
            let write: Vec<u8> = rest
                .get(1)
                .map(|hex| parse_hex_bytes(hex))
                .transpose()?
                .unwrap_or_default();
            let read_len: usize = rest
                .get(2)
                .map(|n| n.parse::<usize>().map_err(|_| Error::Configuration(format!("bad read length {n}"))))
                .transpose()?
                .unwrap_or(0);
            self.complex(target, write, read_len, 0)
        })();
        match result {
            Ok(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(""),
            Err(e) => e.diagnostic(&self.name, "get raw"),
        }
    }

    fn cmd_set_interval(&self, rest: &[&str]) -> String {
        match rest.first().and_then(|s| s.parse::<u64>().ok()) {
            Some(secs) => {
                let mut policy = self.policy.lock().unwrap();
                policy.interval_secs = kick_interval_floor(secs);
                policy.kick_enabled = true;
                format!("{}: interval set to {}s", self.name, policy.interval_secs)
            }
            None => Error::Configuration("set interval requires a number of seconds".into())
                .diagnostic(&self.name, "set interval"),
        }
    }

    fn cmd_set_follow_alarms(&self, rest: &[&str]) -> String {
        match rest.first() {
            Some(&"on") => {
                let mut policy = self.policy.lock().unwrap();
                policy.follow_alarms = true;
                policy.kick_enabled = true;
                format!("{}: followAlarms on", self.name)
            }
            Some(&"off") => {
                let mut policy = self.policy.lock().unwrap();
                policy.follow_alarms = false;
                policy.kick_enabled = true;
                format!("{}: followAlarms off", self.name)
            }
            _ => Error::Configuration("set followAlarms requires on|off".into())
                .diagnostic(&self.name, "set followAlarms"),
        }
    }
}

fn parse_hex_bytes(hex: &str) -> Result<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return Err(Error::Configuration(format!("odd-length hex string {hex:?}")));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&hex[i..i + 2], 16)
                .map_err(|_| Error::Configuration(format!("invalid hex byte in {hex:?}")))
        })
        .collect()
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::{BackendKind, Level, ResetPresence};
    use crate::search::{SearchMode, SearchState};
    use crate::crc::crc8;

    /// A scriptable backend double standing in for `MockBackend` (spec.md
    /// §8): reset/search/block replies queued ahead of time.
    struct MockBackend {
        reset_replies: Vec<ResetPresence>,
        roms: Vec<RomId>,
    }

    impl Backend for MockBackend {
        fn kind(&self) -> BackendKind {
            BackendKind::Passive
        }
        fn reset(&mut self) -> Result<ResetPresence> {
            Ok(self.reset_replies.pop().unwrap_or_default())
        }
        fn block(&mut self, write: &[u8]) -> Result<Vec<u8>> {
            Ok(write.to_vec())
        }
        fn search_round(
            &mut self,
            _mode: SearchMode,
            state: &mut SearchState,
            _last_rom: Option<&RomId>,
        ) -> Result<Option<RomId>> {
            state.done = true;
            Ok(self.roms.pop())
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

    fn controller(backend: MockBackend) -> BusController {
        BusController {
            name: "bus0".into(),
            backend: Mutex::new(Box::new(backend)),
            roster: Mutex::new(DeviceRoster::new()),
            alarmed_flag: Mutex::new(false),
            policy: Mutex::new(Policy::default()),
            enumerator: Enumerator::new(),
        }
    }

    #[test]
    fn reset_sets_sticky_alarm_flag_on_r2_two() {
        let controller = controller(MockBackend {
            reset_replies: vec![ResetPresence { presence: true, alarm: true }],
            roms: vec![],
        });
        let alarm = controller.reset().unwrap();
        assert!(alarm);
        assert!(*controller.alarmed_flag.lock().unwrap());
    }

    #[test]
    fn reset_clears_sticky_alarm_flag_on_no_presence() {
        let controller = controller(MockBackend {
            reset_replies: vec![ResetPresence { presence: false, alarm: false }],
            roms: vec![],
        });
        *controller.alarmed_flag.lock().unwrap() = true;
        controller.reset().unwrap();
        assert!(!*controller.alarmed_flag.lock().unwrap());
    }

    #[test]
    fn kick_interval_floor_clamps_below_fifteen_seconds() {
        assert_eq!(kick_interval_floor(5), 15);
        assert_eq!(kick_interval_floor(30), 30);
    }

    #[test]
    fn handle_command_formats_unknown_command() {
        let controller = controller(MockBackend { reset_replies: vec![], roms: vec![] });
        let response = controller.handle_command("frobnicate everything");
        assert!(response.contains("unrecognized command"));
    }

    #[test]
    fn handle_command_set_interval_reports_clamped_value() {
        let controller = controller(MockBackend { reset_replies: vec![], roms: vec![] });
        let response = controller.handle_command("set interval 3");
        assert_eq!(response, "bus0: interval set to 15s");
    }

    #[test]
    fn follow_alarms_on_triggers_alarm_scan_after_kick() {
        let controller = controller(MockBackend {
            reset_replies: vec![ResetPresence { presence: true, alarm: true }],
            roms: vec![rom(0x99)],
        });

        let response = controller.handle_command("set followAlarms on");
        assert_eq!(response, "bus0: followAlarms on");

        let alarm = controller.reset().unwrap();
        assert!(alarm);

        controller.kick().unwrap();

        let alarmed: Vec<RomId> = controller.roster.lock().unwrap().alarmed().iter().copied().collect();
        assert_eq!(alarmed, vec![rom(0x99)]);
    }

    #[test]
    fn handle_command_get_devices_lists_discovered_rom() {
        let controller = controller(MockBackend {
            reset_replies: vec![],
            roms: vec![rom(0x42)],
        });
        let response = controller.handle_command("get devices");
        assert!(response.contains("DS18B20"));
    }
}
