//! DS9097-class passive bit-banging adapter: the serial port's UART itself
//! does the line timing. Every 1-Wire bit rides one UART byte at 115200
//! baud (`0xFF` samples a 1, `0x00` drives a 0, the readback byte echoes
//! the line state); a reset is one UART byte at 9600 baud.

use super::{Backend, BackendKind, ResetPresence};
use crate::error::Result;
use crate::rom::RomId;
use crate::search::{self, SearchMode, SearchState};
use crate::transport::ByteTransport;
use log::debug;
use std::cell::RefCell;
use std::time::{Duration, Instant};

const BIT_BAUD: u32 = 115_200;
const RESET_BAUD: u32 = 9600;
const BIT_ONE: u8 = 0xFF;
const BIT_ZERO: u8 = 0x00;
const RESET_PROBE: u8 = 0xF0;
const IO_DEADLINE: Duration = Duration::from_millis(100);

pub struct PassiveMaster {
    transport: RefCell<Box<dyn ByteTransport>>,
}

impl PassiveMaster {
    pub fn new(transport: Box<dyn ByteTransport>) -> Self {
        Self {
            transport: RefCell::new(transport),
        }
    }

    /// Switches to `baud` for the duration of one UART byte, then restores
    /// the idle (reset-detection) rate — every bit operation pays this
    /// round trip so a reset can be issued at any time without a stale
    /// 115200 baud setting left behind.
    fn io_byte(&self, baud: u32, out: u8) -> Result<u8> {
        let mut transport = self.transport.borrow_mut();
        transport.set_baud(baud)?;
        let n = transport.write(&[out])?;
        if n != 1 {
            return Err(crate::error::Error::TransportLost(
                "short write on bit-banged byte".into(),
            ));
        }
        let deadline = Instant::now() + IO_DEADLINE;
        let reply = transport.read(1, deadline)?;
        let echo = reply
            .first()
            .copied()
            .ok_or(crate::error::Error::Timeout("passive backend bit echo"))?;
        transport.set_baud(RESET_BAUD)?;
        Ok(echo)
    }

    fn read_bit(&self) -> Result<bool> {
        let echo = self.io_byte(BIT_BAUD, BIT_ONE)?;
        Ok(echo == BIT_ONE)
    }

    fn write_bit(&self, bit: bool) -> Result<bool> {
        let out = if bit { BIT_ONE } else { BIT_ZERO };
        let echo = self.io_byte(BIT_BAUD, out)?;
        Ok(echo == BIT_ONE)
    }

    fn read_byte(&self) -> Result<u8> {
        let mut byte = 0u8;
        for bit_index in 0..u8::BITS {
            if self.read_bit()? {
                byte |= 1 << bit_index;
            }
        }
        Ok(byte)
    }

    fn write_byte(&self, mut value: u8) -> Result<u8> {
        let mut echo = 0u8;
        for bit_index in 0..u8::BITS {
            let bit = value & 1 != 0;
            if self.write_bit(bit)? {
                echo |= 1 << bit_index;
            }
            value >>= 1;
        }
        Ok(echo)
    }
}

impl Backend for PassiveMaster {
    fn kind(&self) -> BackendKind {
        BackendKind::Passive
    }

    fn reset(&mut self) -> Result<ResetPresence> {
        let reply = self.io_byte(RESET_BAUD, RESET_PROBE)?;
        // TODO: the reply value (commonly 0x10/0x90/0xE0) is accepted
        // regardless of its exact encoding; decide whether to expose a
        // finer presence/short-circuit diagnostic here.
        debug!("passive master reset reply: {reply:#04x}");
        Ok(ResetPresence {
            presence: reply != RESET_PROBE,
            alarm: false,
        })
    }

    fn block(&mut self, write: &[u8]) -> Result<Vec<u8>> {
        write.iter().map(|&byte| self.write_byte(byte)).collect()
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
            return Err(crate::error::Error::NoPresence);
        }
        self.write_byte(mode.command())?;
        let this = &*self;
        search::search_round(
            |_b| {
                let id_bit = this.read_bit()?;
                let cmp_id_bit = this.read_bit()?;
                Ok((id_bit, cmp_id_bit))
            },
            |_b, direction| {
                this.write_bit(direction)?;
                Ok(())
            },
            state,
            last_rom,
        )
    }
}
