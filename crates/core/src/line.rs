//! Single-wire joybus transceiver.
//!
//! The console and the device share one open-drain line, idle high. Every bit
//! starts with a falling edge and lasts 4 µs; the value is where the line
//! returns high:
//!
//! ```text
//!        ┌─┐     ┌───────┐     ┌─────┐
//!  ──────┘ └─────┘       └─────┘     └────────  idle
//!         0 (3 µs low)  1 (1 µs low)  stop (1 µs low, 2 µs high)
//! ```
//!
//! Receive samples 2 µs after each falling edge, then busy-waits for the line
//! to go high and fall again, each phase bounded by [`LineTiming::edge_timeout`]
//! polls. Commands are MSB first:
//!
//! | Opcode | Bits after opcode         | Total |
//! |--------|---------------------------|-------|
//! | 0x02   | 16-bit address (+CRC5)    | 24    |
//! | 0x03   | 16-bit address + 32 bytes | 24+256|
//! | 0x13   | 8-bit LED byte            | 16    |
//! | others | none (9th bit is stop)    | 8     |
//!
//! Transmit hands a [`ProtocolFrame`] to the hardware serializer as a list of
//! words and spins until the serializer parks on its stop instruction.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::BLOCK_SIZE;

pub const OP_INFO: u8 = 0x00;
pub const OP_POLL: u8 = 0x01;
pub const OP_READ_BLOCK: u8 = 0x02;
pub const OP_WRITE_BLOCK: u8 = 0x03;
pub const OP_KEYBOARD: u8 = 0x13;
pub const OP_RESET: u8 = 0xFF;

/// Sample point after a falling edge.
const SAMPLE_DELAY_US: u32 = 2;
/// Wait after a single-byte command's sample before replying.
const SHORT_TURNAROUND_US: u32 = 4;
/// Wait after the console stop bit of a long command before replying.
const STOP_BIT_US: u32 = 3;

/// Opcodes that carry payload after the first byte.
pub fn is_extended(opcode: u8) -> bool {
    matches!(opcode, OP_READ_BLOCK | OP_WRITE_BLOCK | OP_KEYBOARD)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTiming {
    /// Tick-source counts per microsecond (calibrated for the system clock)
    pub ticks_per_us: u32,
    /// Poll budget for each half of the edge wait
    pub edge_timeout: u32,
}

impl Default for LineTiming {
    fn default() -> Self {
        // 200 MHz system clock, measured
        LineTiming { ticks_per_us: 197, edge_timeout: 300 }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum LineError {
    #[error("receive timeout after {bits} bits")]
    ReceiveTimeout { bits: u32 },
}

/// Free-running precise counter.
pub trait TickSource {
    /// Restart the measurement.
    fn start(&mut self);
    /// Ticks since the last `start`.
    fn elapsed(&mut self) -> u32;
}

/// The data pin, read as input.
pub trait LinePin {
    fn is_high(&mut self) -> bool;
}

/// Hardware bit serializer fed with frame words.
pub trait Serializer {
    /// Queue `words` (terminated by a stop word) and start shifting.
    fn start(&mut self, words: &[u32]);
    /// True once the serializer sits on its stop instruction.
    fn is_stopped(&mut self) -> bool;
}

/// A decoded console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// 0x00 or 0xFF
    Info { opcode: u8 },
    Poll,
    ReadBlock { address: u16 },
    WriteBlock { address: u16, data: [u8; BLOCK_SIZE] },
    KeyboardStatus { leds: u8 },
    Unknown { opcode: u8 },
}

impl Command {
    /// Decode a command that has no payload.
    fn single(opcode: u8) -> Self {
        match opcode {
            OP_INFO | OP_RESET => Command::Info { opcode },
            OP_POLL => Command::Poll,
            _ => Command::Unknown { opcode },
        }
    }

    pub fn opcode(&self) -> u8 {
        match *self {
            Command::Info { opcode } | Command::Unknown { opcode } => opcode,
            Command::Poll => OP_POLL,
            Command::ReadBlock { .. } => OP_READ_BLOCK,
            Command::WriteBlock { .. } => OP_WRITE_BLOCK,
            Command::KeyboardStatus { .. } => OP_KEYBOARD,
        }
    }
}

// ─── Frames ─────────────────────────────────────────────────────────────────

/// One run of 8 or 16 bits, MSB first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Segment {
    pub value: u16,
    pub bits: u8,
}

/// Longest reply: a block as 16 two-byte segments plus its CRC.
pub const MAX_SEGMENTS: usize = BLOCK_SIZE / 2 + 1;
/// Frame words plus the stop word.
pub const MAX_WORDS: usize = MAX_SEGMENTS + 1;
/// Serializer word that parks the state machine.
pub const STOP_WORD: u32 = 0;

/// Serializer word: bit count minus one in the top half, payload
/// left-aligned in the low 16 bits.
pub fn encode_word(seg: Segment) -> u32 {
    ((seg.bits as u32 - 1) << 16) | ((seg.value as u32) << (16 - seg.bits as u32))
}

/// Inverse of [`encode_word`]; `None` for the stop word.
pub fn decode_word(word: u32) -> Option<Segment> {
    if word == STOP_WORD {
        return None;
    }
    let bits = ((word >> 16) & 0x1F) as u8 + 1;
    let value = ((word & 0xFFFF) >> (16 - bits as u32)) as u16;
    Some(Segment { value, bits })
}

/// Everything one reply clocks onto the wire, in order. The device stop bit
/// is appended by the serializer program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolFrame {
    segments: [Segment; MAX_SEGMENTS],
    len: usize,
}

impl ProtocolFrame {
    pub fn new() -> Self {
        ProtocolFrame { segments: [Segment::default(); MAX_SEGMENTS], len: 0 }
    }

    fn push(&mut self, seg: Segment) {
        debug_assert!(self.len < MAX_SEGMENTS, "frame overflow");
        if self.len < MAX_SEGMENTS {
            self.segments[self.len] = seg;
            self.len += 1;
        }
    }

    pub fn push8(&mut self, value: u8) {
        self.push(Segment { value: value as u16, bits: 8 });
    }

    pub fn push16(&mut self, value: u16) {
        self.push(Segment { value, bits: 16 });
    }

    /// Bytes packed two per segment; an odd tail goes out as 8 bits.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            self.push16(u16::from_be_bytes([pair[0], pair[1]]));
        }
        if let [last] = pairs.remainder() {
            self.push8(*last);
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments[..self.len]
    }

    pub fn bit_len(&self) -> u32 {
        self.segments().iter().map(|s| s.bits as u32).sum()
    }

    /// Fill `out` with serializer words and the stop word; returns the count.
    pub fn encode(&self, out: &mut [u32; MAX_WORDS]) -> usize {
        for (slot, seg) in out.iter_mut().zip(self.segments()) {
            *slot = encode_word(*seg);
        }
        out[self.len] = STOP_WORD;
        self.len + 1
    }
}

impl Default for ProtocolFrame {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Transceiver ────────────────────────────────────────────────────────────

/// What the rest of the receive still expects after the opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxPhase {
    Opcode,
    Address { opcode: u8 },
    Leds,
}

pub struct Transceiver<P, T, S> {
    pin: P,
    ticks: T,
    serializer: S,
    timing: LineTiming,
    words: [u32; MAX_WORDS],
}

impl<P: LinePin, T: TickSource, S: Serializer> Transceiver<P, T, S> {
    pub fn new(pin: P, ticks: T, serializer: S, timing: LineTiming) -> Self {
        Transceiver { pin, ticks, serializer, timing, words: [STOP_WORD; MAX_WORDS] }
    }

    pub fn timing(&self) -> LineTiming {
        self.timing
    }

    pub fn line_high(&mut self) -> bool {
        self.pin.is_high()
    }

    #[inline(always)]
    fn wait_us(&mut self, us: u32) {
        let count = us.saturating_mul(self.timing.ticks_per_us);
        self.ticks.start();
        while self.ticks.elapsed() < count {}
    }

    #[inline(always)]
    fn sample_bit(&mut self) -> u32 {
        self.wait_us(SAMPLE_DELAY_US);
        self.pin.is_high() as u32
    }

    /// Wait for the current bit to release the line, then for the next
    /// falling edge.
    fn await_next_edge(&mut self, bits: u32) -> Result<(), LineError> {
        let mut budget = self.timing.edge_timeout;
        while !self.pin.is_high() {
            if budget == 0 {
                return Err(LineError::ReceiveTimeout { bits });
            }
            budget -= 1;
        }
        budget = self.timing.edge_timeout;
        while self.pin.is_high() {
            if budget == 0 {
                return Err(LineError::ReceiveTimeout { bits });
            }
            budget -= 1;
        }
        Ok(())
    }

    /// Decode one command. Call right after the falling edge of its first bit.
    pub fn receive_command(&mut self) -> Result<Command, LineError> {
        let mut word = 0u32;
        let mut bits = 0u32;
        let mut phase = RxPhase::Opcode;

        loop {
            word = (word << 1) | self.sample_bit();
            bits += 1;

            if phase == RxPhase::Opcode && bits == 9 {
                // The 9th bit is either the stop bit or the first payload bit
                let opcode = (word >> 1) as u8;
                phase = match opcode {
                    OP_READ_BLOCK | OP_WRITE_BLOCK => RxPhase::Address { opcode },
                    OP_KEYBOARD => RxPhase::Leds,
                    _ => {
                        self.wait_us(SHORT_TURNAROUND_US);
                        return Ok(Command::single(opcode));
                    }
                };
            }

            self.await_next_edge(bits)?;

            match phase {
                RxPhase::Address { opcode } if bits == 24 => {
                    let address = word as u16;
                    if opcode == OP_WRITE_BLOCK {
                        let data = self.receive_block(bits)?;
                        return Ok(Command::WriteBlock { address, data });
                    }
                    // Edge just seen is the console stop bit
                    self.wait_us(STOP_BIT_US);
                    return Ok(Command::ReadBlock { address });
                }
                RxPhase::Leds if bits == 16 => {
                    self.wait_us(STOP_BIT_US);
                    return Ok(Command::KeyboardStatus { leds: word as u8 });
                }
                _ => {}
            }
        }
    }

    /// Read a 32-byte payload; the first edge has already been seen.
    fn receive_block(&mut self, header_bits: u32) -> Result<[u8; BLOCK_SIZE], LineError> {
        let mut data = [0u8; BLOCK_SIZE];
        let total = BLOCK_SIZE * 8;
        for i in 0..total {
            let bit = self.sample_bit() as u8;
            data[i / 8] = (data[i / 8] << 1) | bit;
            if i + 1 < total {
                self.await_next_edge(header_bits + i as u32 + 1)?;
            }
        }
        Ok(data)
    }

    /// Clock `frame` out and block until the serializer reaches its stop
    /// instruction.
    pub fn transmit(&mut self, frame: &ProtocolFrame) {
        let n = frame.encode(&mut self.words);
        self.serializer.start(&self.words[..n]);
        while !self.serializer.is_stopped() {}
    }
}
