//! FRM firmware-offload backend: transactions are packaged into a single
//! command and handed to a coprocessor, which does the actual bit-banging
//! and reports the outcome asynchronously. Unlike the active and passive
//! backends, selection (`reset?`, `skip?`, `select:romid?`) is a structured
//! field in the command rather than a raw byte on the wire.
//!
//! [`FirmwareMaster`] still implements [`Backend`] (each call blocks for its
//! own matching reply) so the façade can use it uniformly, but its natural
//! home is the asynchronous executor (§4.8), which calls [`submit`] and
//! [`recv_completion`] directly without waiting in between.

use super::{Backend, BackendKind, ResetPresence};
use crate::error::{Error, Result};
use crate::rom::RomId;
use crate::search::{SearchMode, SearchState};
use crate::transaction::{Transaction, TransactionOutcome};
use crate::transport::ByteTransport;
use std::thread;
use std::time::{Duration, Instant};

const REQUEST_TAG: u8 = 0x5A;
const READ_REPLY_TAG: u8 = 0xA5;
const MAX_ATTEMPTS: usize = 100;
const READ_BACKOFF: Duration = Duration::from_millis(15);
const READ_WINDOW: Duration = Duration::from_millis(200);

/// One packaged firmware command: `reset?`, `skip?`/`select:romid?`,
/// `write:bytes?`, `read:n?`, `delay:ms?`.
#[derive(Clone, Debug, Default)]
pub struct FirmwareRequest {
    pub reset: bool,
    /// `None` packages a skip-ROM selection.
    pub target: Option<RomId>,
    pub write: Vec<u8>,
    pub read_len: usize,
    pub delay_ms: u64,
}

/// The coprocessor's asynchronous reply to a [`FirmwareRequest`].
#[derive(Clone, Debug)]
pub struct FirmwareCompletion {
    /// Placeholder all-zero ROM id (skip-ROM requests) decodes to `None`,
    /// letting clients demultiplex replies by target.
    pub target: Option<RomId>,
    pub presence: bool,
    pub alarm: bool,
    pub read: Vec<u8>,
}

fn encode_request(pin: u8, request: &FirmwareRequest) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16 + request.write.len());
    buf.push(REQUEST_TAG);
    buf.push(pin);
    let mut flags = 0u8;
    if request.reset {
        flags |= 0b01;
    }
    if request.target.is_some() {
        flags |= 0b10;
    }
    buf.push(flags);
    buf.extend_from_slice(&request.target.map(|rom| rom.as_bytes()).unwrap_or([0u8; 8]));
    buf.extend_from_slice(&(request.write.len() as u16).to_le_bytes());
    buf.extend_from_slice(&request.write);
    buf.extend_from_slice(&(request.read_len as u16).to_le_bytes());
    buf.extend_from_slice(&(request.delay_ms as u32).to_le_bytes());
    buf
}

pub struct FirmwareMaster {
    transport: Box<dyn ByteTransport>,
    pin: u8,
}

impl FirmwareMaster {
    pub fn new(transport: Box<dyn ByteTransport>, pin: u8) -> Self {
        Self { transport, pin }
    }

    fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut collected = Vec::with_capacity(n);
        for _ in 0..MAX_ATTEMPTS {
            if collected.len() >= n {
                break;
            }
            let deadline = Instant::now() + READ_WINDOW;
            let chunk = self.transport.read(n - collected.len(), deadline)?;
            if chunk.is_empty() {
                thread::sleep(READ_BACKOFF);
                continue;
            }
            collected.extend(chunk);
        }
        if collected.len() < n {
            return Err(Error::Timeout("firmware backend read"));
        }
        collected.truncate(n);
        Ok(collected)
    }

    /// Hands one packaged command to the coprocessor. Does not wait for a
    /// reply — pair with [`recv_completion`], or let the asynchronous
    /// executor's worker poll for it.
    pub fn submit(&mut self, request: &FirmwareRequest) -> Result<()> {
        let bytes = encode_request(self.pin, request);
        let n = self.transport.write(&bytes)?;
        if n != bytes.len() {
            return Err(Error::TransportLost(format!(
                "short write to firmware coprocessor: {n}/{}",
                bytes.len()
            )));
        }
        Ok(())
    }

    /// Blocks until one `READ_REPLY` frame arrives and decodes it.
    pub fn recv_completion(&mut self) -> Result<FirmwareCompletion> {
        let tag = self.read_exact(1)?[0];
        if tag != READ_REPLY_TAG {
            return Err(Error::ProtocolFraming(format!(
                "unexpected firmware reply tag {tag:#04x}"
            )));
        }
        let rom_bytes: [u8; 8] = self
            .read_exact(8)?
            .try_into()
            .expect("read_exact(8) always returns 8 bytes");
        let status = self.read_exact(1)?[0];
        let len_bytes = self.read_exact(2)?;
        let read_len = u16::from_le_bytes([len_bytes[0], len_bytes[1]]) as usize;
        let data = self.read_exact(read_len)?;
        let target = if rom_bytes == [0u8; 8] {
            None
        } else {
            Some(RomId::from_bytes(rom_bytes)?)
        };
        Ok(FirmwareCompletion {
            target,
            presence: status & 0b01 != 0,
            alarm: status & 0b10 != 0,
            read: data,
        })
    }
}

impl Backend for FirmwareMaster {
    fn kind(&self) -> BackendKind {
        BackendKind::Firmware
    }

    fn reset(&mut self) -> Result<ResetPresence> {
        self.submit(&FirmwareRequest {
            reset: true,
            ..Default::default()
        })?;
        let completion = self.recv_completion()?;
        Ok(ResetPresence {
            presence: completion.presence,
            alarm: completion.alarm,
        })
    }

    fn block(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        // Diagnostic-only passthrough: the packaged protocol has no notion
        // of a raw selection byte, so `write` is sent as-is with no reset
        // and no selection. The generic transaction composer never calls
        // this directly for the firmware backend (see the executor).
        self.submit(&FirmwareRequest {
            write: write.to_vec(),
            read_len: write.len(),
            ..Default::default()
        })?;
        let completion = self.recv_completion()?;
        Ok(completion.read)
    }

    fn search_round(
        &mut self,
        _mode: SearchMode,
        _state: &mut SearchState,
        _last_rom: Option<&RomId>,
    ) -> Result<Option<RomId>> {
        Err(Error::Unsupported("rom search over the firmware backend"))
    }

    /// Packages the whole transaction into one coprocessor command, per
    /// spec.md §4.6's firmware-backend paragraph, instead of composing it
    /// over `block` the way the active/passive backends do.
    fn execute_packaged(&mut self, tx: &Transaction) -> Option<Result<TransactionOutcome>> {
        Some((|| {
            self.submit(&FirmwareRequest {
                reset: tx.reset,
                target: tx.target,
                write: tx.write.clone(),
                read_len: tx.read_len,
                delay_ms: tx.delay_ms,
            })?;
            let completion = self.recv_completion()?;
            if tx.reset && !completion.presence && !tx.allow_absent {
                return Err(Error::NoPresence);
            }
            Ok(TransactionOutcome {
                read: completion.read,
                alarm: completion.alarm,
            })
        })())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::mock::MockTransport;

    #[test]
    fn reset_round_trips_through_packaged_command() {
        let mut transport = MockTransport::new();
        transport.push_reply([READ_REPLY_TAG]);
        transport.push_reply([0u8; 8]); // placeholder rom
        transport.push_reply([0b11]); // presence + alarm
        transport.push_reply([0x00, 0x00]); // read_len = 0
        let mut firmware = FirmwareMaster::new(Box::new(transport), 4);
        let presence = firmware.reset().unwrap();
        assert!(presence.presence);
        assert!(presence.alarm);
    }

    #[test]
    fn encode_request_marks_reset_and_target_flags() {
        let rom = RomId::from_bytes({
            let mut bytes = [0x28, 1, 2, 3, 4, 5, 6, 0];
            bytes[7] = crate::crc::crc8(&bytes[..7]);
            bytes
        })
        .unwrap();
        let encoded = encode_request(
            7,
            &FirmwareRequest {
                reset: true,
                target: Some(rom),
                write: vec![0x44],
                read_len: 1,
                delay_ms: 750,
            },
        );
        assert_eq!(encoded[0], REQUEST_TAG);
        assert_eq!(encoded[1], 7);
        assert_eq!(encoded[2], 0b11);
        assert_eq!(&encoded[3..11], &rom.as_bytes());
    }

    #[test]
    fn execute_packaged_routes_through_single_coprocessor_command() {
        let mut transport = MockTransport::new();
        transport.push_reply([READ_REPLY_TAG]);
        transport.push_reply([0u8; 8]);
        transport.push_reply([0b01]);
        transport.push_reply([0x02, 0x00]);
        transport.push_reply([0xAA, 0xBB]);
        let mut firmware = FirmwareMaster::new(Box::new(transport), 0);
        let tx = Transaction {
            reset: true,
            write: vec![0xBE],
            read_len: 2,
            ..Default::default()
        };
        let outcome = firmware.execute_packaged(&tx).unwrap().unwrap();
        assert_eq!(outcome.read, vec![0xAA, 0xBB]);
        assert!(!outcome.alarm);
    }

    #[test]
    fn submit_then_recv_completion_demultiplexes_by_rom() {
        let mut transport = MockTransport::new();
        transport.push_reply([READ_REPLY_TAG]);
        transport.push_reply([0u8; 8]);
        transport.push_reply([0b01]);
        transport.push_reply([0x02, 0x00]);
        transport.push_reply([0xAA, 0xBB]);
        let mut firmware = FirmwareMaster::new(Box::new(transport), 0);
        firmware
            .submit(&FirmwareRequest {
                write: vec![0xBE],
                read_len: 2,
                ..Default::default()
            })
            .unwrap();
        let completion = firmware.recv_completion().unwrap();
        assert_eq!(completion.target, None);
        assert_eq!(completion.read, vec![0xAA, 0xBB]);
    }
}
