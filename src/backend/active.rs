//! DS2480-class active serial master: a UART-attached chip that frames two
//! sub-channels — command mode and data mode — over one byte stream and
//! does the 1-Wire bit-banging itself, including a hardware search
//! accelerator that resolves an entire 64-bit search round in one burst.

use super::{Backend, BackendKind, Level, ResetPresence};
use crate::error::{Error, Result};
use crate::rom::RomId;
use crate::search::{self, SearchMode, SearchState};
use crate::transport::ByteTransport;
use log::{debug, warn};
use std::thread;
use std::time::{Duration, Instant};

const MODE_SWITCH_COMMAND: u8 = 0xE3;
const MODE_SWITCH_DATA: u8 = 0xE1;
const CMD_RESET: u8 = 0xC5;
const CMD_LEVEL_STRONG: u8 = 0x3F;
const CMD_LEVEL_NORMAL: u8 = 0xF1;
const CMD_SEARCH_SETUP: u8 = 0xB5;
const CMD_SEARCH_RUN: u8 = 0xA5;
const LEVEL_ACK_MASK: u8 = 0xEC;
const BAUD: u32 = 9600;

const READ_CHUNK_CAP: usize = 48;
const MAX_READ_ATTEMPTS: usize = 100;
const POST_WRITE_BACKOFF: Duration = Duration::from_millis(40);
const READ_LOOP_BACKOFF: Duration = Duration::from_millis(15);
const READ_ATTEMPT_WINDOW: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Mode {
    Command,
    Data,
}

pub struct ActiveMaster {
    transport: Box<dyn ByteTransport>,
    mode: Mode,
    alarm_flag: bool,
}

impl ActiveMaster {
    pub fn new(mut transport: Box<dyn ByteTransport>) -> Result<Self> {
        transport.set_baud(BAUD)?;
        Ok(Self {
            transport,
            mode: Mode::Command,
            alarm_flag: false,
        })
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let n = self.transport.write(bytes)?;
        if n != bytes.len() {
            return Err(Error::TransportLost(format!(
                "short write: {n}/{} bytes",
                bytes.len()
            )));
        }
        thread::sleep(POST_WRITE_BACKOFF);
        Ok(())
    }

    fn read_exact_with_backoff(&mut self, n: usize) -> Result<Vec<u8>> {
        let mut collected = Vec::with_capacity(n);
        for _ in 0..MAX_READ_ATTEMPTS {
            if collected.len() >= n {
                break;
            }
            let chunk_cap = READ_CHUNK_CAP.min(n - collected.len());
            let deadline = Instant::now() + READ_ATTEMPT_WINDOW;
            let chunk = self.transport.read(chunk_cap, deadline)?;
            if chunk.is_empty() {
                thread::sleep(READ_LOOP_BACKOFF);
                continue;
            }
            collected.extend(chunk);
        }
        if collected.len() < n {
            return Err(Error::Timeout("active backend read"));
        }
        collected.truncate(n);
        Ok(collected)
    }

    fn enter_command_mode(&mut self) -> Result<()> {
        if self.mode != Mode::Command {
            self.write_raw(&[MODE_SWITCH_COMMAND])?;
            self.mode = Mode::Command;
        }
        Ok(())
    }

    fn enter_data_mode(&mut self) -> Result<()> {
        if self.mode != Mode::Data {
            self.write_raw(&[MODE_SWITCH_DATA])?;
            self.mode = Mode::Data;
        }
        Ok(())
    }

    fn raw_reset(&mut self) -> Result<u8> {
        self.write_raw(&[MODE_SWITCH_COMMAND, CMD_RESET])?;
        self.mode = Mode::Command;
        let reply = self.read_exact_with_backoff(1)?;
        Ok(reply[0])
    }
}

fn classify_reset_reply(byte: u8) -> Result<ResetPresence> {
    if byte & 0b1100_0000 != 0b1100_0000 {
        return Err(Error::ProtocolFraming(format!(
            "reset ack mismatch: {byte:#04x}"
        )));
    }
    let r2 = byte & 0b11;
    Ok(ResetPresence {
        presence: r2 != 0b11,
        alarm: r2 == 0b10,
    })
}

/// Doubles every literal `0xE3` byte so it can't be misread as a
/// data-to-command mode switch once it's on the wire.
pub(crate) fn escape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    for &byte in data {
        out.push(byte);
        if byte == MODE_SWITCH_COMMAND {
            out.push(byte);
        }
    }
    out
}

/// Inverse of [`escape`]: collapses every doubled `0xE3` back to a single
/// logical data byte.
pub(crate) fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut skip_next = false;
    for &byte in data {
        if skip_next {
            skip_next = false;
            continue;
        }
        out.push(byte);
        if byte == MODE_SWITCH_COMMAND {
            skip_next = true;
        }
    }
    out
}

/// Packs 64 branch-direction guesses into the 16-byte search accelerator
/// request: 4 two-bit pairs per byte, direction guess in the high bit of
/// each pair, low bit left clear.
fn pack_search_bits(guesses: &[bool; 64]) -> [u8; 16] {
    let mut packed = [0u8; 16];
    for (p, &guess) in guesses.iter().enumerate() {
        if guess {
            let byte_index = p / 4;
            let shift = (p % 4) * 2;
            packed[byte_index] |= 1 << (shift + 1);
        }
    }
    packed
}

/// Unpacks the accelerator's 16-byte reply into 64 `(id_bit, disc_bit)`
/// pairs, the same `(id_bit, cmp_id_bit)` shape the bit-by-bit search
/// decision rule consumes.
fn unpack_search_bits(bytes: &[u8; 16]) -> [(bool, bool); 64] {
    let mut pairs = [(false, false); 64];
    for (p, pair) in pairs.iter_mut().enumerate() {
        let byte_index = p / 4;
        let shift = (p % 4) * 2;
        let id_bit = (bytes[byte_index] >> (shift + 1)) & 1 != 0;
        let disc_bit = (bytes[byte_index] >> shift) & 1 != 0;
        *pair = (id_bit, disc_bit);
    }
    pairs
}

impl Backend for ActiveMaster {
    fn kind(&self) -> BackendKind {
        BackendKind::Active
    }

    fn reset(&mut self) -> Result<ResetPresence> {
        let first = self.raw_reset().and_then(classify_reset_reply);
        let presence = match first {
            Ok(presence) => presence,
            Err(e) => {
                warn!("active master reset ack failed, retrying once: {e}");
                let retry = self.raw_reset().and_then(classify_reset_reply)?;
                retry
            }
        };
        self.alarm_flag = presence.alarm;
        debug!("active master reset: {presence:?}");
        Ok(presence)
    }

    fn block(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        self.enter_data_mode()?;
        let escaped = escape(write);
        self.write_raw(&escaped)?;
        // The echo is framed exactly like the outbound payload: a literal
        // 0xE3 byte comes back doubled. Read one raw byte at a time so a
        // doubled pair can never straddle an unrelated chunk boundary.
        let mut logical = Vec::with_capacity(write.len());
        let mut pending_escape = false;
        while logical.len() < write.len() {
            let byte = self.read_exact_with_backoff(1)?[0];
            if pending_escape {
                pending_escape = false;
                continue;
            }
            logical.push(byte);
            if byte == MODE_SWITCH_COMMAND {
                pending_escape = true;
            }
        }
        Ok(logical)
    }

    fn search_round(
        &mut self,
        mode: SearchMode,
        state: &mut SearchState,
        last_rom: Option<&RomId>,
    ) -> Result<Option<RomId>> {
        if state.done {
            return Ok(None);
        }
        let presence = self.reset()?;
        if !presence.presence {
            *state = SearchState::default();
            return Err(Error::NoPresence);
        }
        let guesses = search::guess_directions(state, last_rom);
        let packed = pack_search_bits(&guesses);

        self.enter_data_mode()?;
        self.write_raw(&[mode.command()])?;
        self.enter_command_mode()?;
        self.write_raw(&[CMD_SEARCH_SETUP])?;

        self.enter_data_mode()?;
        self.write_raw(&packed)?;
        self.enter_command_mode()?;
        self.write_raw(&[CMD_SEARCH_RUN])?;

        let reply = self.read_exact_with_backoff(16)?;
        let reply: [u8; 16] = reply
            .try_into()
            .map_err(|_| Error::ProtocolFraming("search accelerator short reply".into()))?;
        let pairs = unpack_search_bits(&reply);

        let mut index = 0usize;
        search::search_round(
            |_b| {
                let pair = pairs[index];
                index += 1;
                Ok(pair)
            },
            |_b, _direction| Ok(()),
            state,
            last_rom,
        )
    }

    fn level(&mut self, level: Level) -> Result<()> {
        let sequence: &[u8] = match level {
            Level::StrongPullup => &[MODE_SWITCH_COMMAND, CMD_LEVEL_STRONG, 0xED],
            Level::Normal => &[MODE_SWITCH_COMMAND, CMD_LEVEL_NORMAL, 0xED, CMD_LEVEL_NORMAL],
        };
        self.write_raw(sequence)?;
        self.mode = Mode::Command;
        let reply = self.read_exact_with_backoff(1)?;
        if reply[0] & LEVEL_ACK_MASK != LEVEL_ACK_MASK {
            return Err(Error::ProtocolFraming(
                "level change not acknowledged".into(),
            ));
        }
        Ok(())
    }
}
