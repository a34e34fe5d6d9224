//! Deterministic virtual hardware.
//!
//! Stand-ins for the three timing-critical capabilities so the transceiver and
//! dispatcher run unchanged off-target:
//!
//! - [`VirtualClock`]: shared tick counter; nothing else advances time
//! - [`VirtualTicks`]: [`TickSource`] on that clock
//! - [`VirtualLine`] / [`VirtualPin`]: the console's side of the wire, as a
//!   queue of scheduled low pulses
//! - [`CaptureSerializer`]: records each transmitted frame instead of
//!   driving the line
//!
//! Every read of the pin or the tick source costs `poll_cost` ticks, the way a
//! real busy-wait loop spends cycles, so bounded waits time out in bounded
//! virtual time.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use crate::line::{decode_word, LinePin, Segment, Serializer, TickSource};

/// Nominal bit cell.
const BIT_US: u64 = 4;

#[derive(Clone, Default)]
pub struct VirtualClock(Rc<Cell<u64>>);

impl VirtualClock {
    pub fn new() -> Self {
        VirtualClock(Rc::new(Cell::new(0)))
    }

    pub fn now(&self) -> u64 {
        self.0.get()
    }

    pub fn advance(&self, ticks: u64) {
        self.0.set(self.0.get() + ticks);
    }

    fn set(&self, t: u64) {
        self.0.set(t);
    }
}

/// Ticks charged per busy-wait iteration at a given tick rate.
fn poll_cost(ticks_per_us: u32) -> u64 {
    (ticks_per_us as u64 / 25).max(1)
}

pub struct VirtualTicks {
    clock: VirtualClock,
    cost: u64,
    started: u64,
}

impl TickSource for VirtualTicks {
    fn start(&mut self) {
        self.started = self.clock.now();
    }

    fn elapsed(&mut self) -> u32 {
        self.clock.advance(self.cost);
        (self.clock.now() - self.started) as u32
    }
}

// ─── Line ───────────────────────────────────────────────────────────────────

/// Half-open interval `[start, end)` during which the console pulls low.
#[derive(Debug, Clone, Copy)]
struct LowPulse {
    start: u64,
    end: u64,
}

/// The console end of the wire.
#[derive(Clone)]
pub struct VirtualLine {
    clock: VirtualClock,
    ticks_per_us: u64,
    cost: u64,
    pulses: Rc<RefCell<VecDeque<LowPulse>>>,
}

impl VirtualLine {
    pub fn new(clock: VirtualClock, ticks_per_us: u32) -> Self {
        VirtualLine {
            clock,
            ticks_per_us: ticks_per_us as u64,
            cost: poll_cost(ticks_per_us),
            pulses: Rc::new(RefCell::new(VecDeque::new())),
        }
    }

    pub fn clock(&self) -> &VirtualClock {
        &self.clock
    }

    /// Device-side view of the pin.
    pub fn pin(&self) -> VirtualPin {
        VirtualPin { line: self.clone() }
    }

    /// Tick source sharing this line's clock and cost.
    pub fn ticks(&self) -> VirtualTicks {
        VirtualTicks { clock: self.clock.clone(), cost: self.cost, started: 0 }
    }

    fn level_at(&self, t: u64) -> bool {
        let mut pulses = self.pulses.borrow_mut();
        while let Some(p) = pulses.front() {
            if p.end <= t {
                pulses.pop_front();
            } else {
                break;
            }
        }
        match pulses.front() {
            Some(p) => !(p.start <= t && t < p.end),
            None => true,
        }
    }

    /// End of the last scheduled pulse, or now.
    fn horizon(&self) -> u64 {
        let last = self.pulses.borrow().back().map(|p| p.end).unwrap_or(0);
        last.max(self.clock.now())
    }

    fn push_pulse(&self, start: u64, low_us: u64) {
        let end = start + low_us * self.ticks_per_us;
        self.pulses.borrow_mut().push_back(LowPulse { start, end });
    }

    /// Schedule a console message `delay` ticks after the line is next free:
    /// each bit MSB first, then the console stop bit. Returns the tick at which
    /// the message ends.
    pub fn console_send(&self, bytes: &[u8], delay: u64) -> u64 {
        let mut t = self.horizon() + delay;
        let cell = BIT_US * self.ticks_per_us;
        for &byte in bytes {
            for bit in (0..8).rev() {
                let low_us = if (byte >> bit) & 1 != 0 { 1 } else { 3 };
                self.push_pulse(t, low_us);
                t += cell;
            }
        }
        // Stop bit: 1 µs low, 2 µs high
        self.push_pulse(t, 1);
        t + 3 * self.ticks_per_us
    }

    /// Schedule the line held low for `us` microseconds.
    pub fn hold_low(&self, delay: u64, us: u64) {
        let t = self.horizon() + delay;
        self.push_pulse(t, us);
    }

    /// Jump the clock to the next falling edge. False when none is scheduled.
    pub fn advance_to_next_edge(&self) -> bool {
        let next = self.pulses.borrow().iter().find(|p| p.start >= self.clock.now()).map(|p| p.start);
        match next {
            Some(t) => {
                self.clock.set(t);
                true
            }
            None => false,
        }
    }

    /// Drop anything still scheduled; the line idles high.
    pub fn clear(&self) {
        self.pulses.borrow_mut().clear();
    }
}

pub struct VirtualPin {
    line: VirtualLine,
}

impl LinePin for VirtualPin {
    fn is_high(&mut self) -> bool {
        self.line.clock.advance(self.line.cost);
        self.line.level_at(self.line.clock.now())
    }
}

// ─── Serializer ─────────────────────────────────────────────────────────────

/// One transmitted reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapturedFrame {
    pub segments: Vec<Segment>,
    /// Clock value when transmission started
    pub at: u64,
}

impl CapturedFrame {
    /// Payload bytes in wire order.
    pub fn bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for seg in &self.segments {
            if seg.bits == 16 {
                out.extend_from_slice(&seg.value.to_be_bytes());
            } else {
                out.push(seg.value as u8);
            }
        }
        out
    }
}

pub type CaptureLog = Rc<RefCell<Vec<CapturedFrame>>>;

/// Serializer double: decodes the word list, records it, and advances the
/// clock by the time the reply would occupy the wire.
pub struct CaptureSerializer {
    clock: VirtualClock,
    ticks_per_us: u64,
    log: CaptureLog,
}

impl CaptureSerializer {
    pub fn new(clock: VirtualClock, ticks_per_us: u32) -> Self {
        CaptureSerializer { clock, ticks_per_us: ticks_per_us as u64, log: Rc::new(RefCell::new(Vec::new())) }
    }

    /// Shared handle to the recorded frames.
    pub fn log(&self) -> CaptureLog {
        self.log.clone()
    }
}

impl Serializer for CaptureSerializer {
    fn start(&mut self, words: &[u32]) {
        let at = self.clock.now();
        let segments: Vec<Segment> = words.iter().map_while(|&w| decode_word(w)).collect();
        let bits: u64 = segments.iter().map(|s| s.bits as u64).sum();
        // payload bits plus the device stop bit
        self.clock.advance((bits + 1) * BIT_US * self.ticks_per_us);
        self.log.borrow_mut().push(CapturedFrame { segments, at });
    }

    fn is_stopped(&mut self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_console_bit_shapes() {
        let clock = VirtualClock::new();
        let line = VirtualLine::new(clock.clone(), 4);
        // 0x80: one '1' bit then seven '0' bits
        let end = line.console_send(&[0x80], 0);
        assert_eq!(end, 8 * 16 + 12);
        assert!(!line.level_at(0));
        assert!(!line.level_at(3));
        assert!(line.level_at(4));
        assert!(!line.level_at(16));
        assert!(!line.level_at(27));
        assert!(line.level_at(28));
    }

    #[test]
    fn test_idle_line_is_high() {
        let clock = VirtualClock::new();
        let line = VirtualLine::new(clock.clone(), 4);
        let mut pin = line.pin();
        assert!(pin.is_high());
        assert!(!line.advance_to_next_edge());
    }

    #[test]
    fn test_advance_to_next_edge() {
        let clock = VirtualClock::new();
        let line = VirtualLine::new(clock.clone(), 4);
        line.console_send(&[0x01], 50);
        assert!(line.advance_to_next_edge());
        assert_eq!(clock.now(), 50);
        let mut pin = line.pin();
        assert!(!pin.is_high());
    }

    #[test]
    fn test_ticks_charge_per_poll() {
        let clock = VirtualClock::new();
        let line = VirtualLine::new(clock.clone(), 197);
        let mut ticks = line.ticks();
        ticks.start();
        assert_eq!(ticks.elapsed(), 7);
        assert_eq!(clock.now(), 7);
    }

    #[test]
    fn test_capture_serializer_advances_clock() {
        let clock = VirtualClock::new();
        let mut ser = CaptureSerializer::new(clock.clone(), 4);
        ser.start(&[0x000F_0500, 0x0007_0100, 0]);
        assert!(ser.is_stopped());
        assert_eq!(clock.now(), 25 * 16);
        assert_eq!(ser.log().borrow()[0].bytes(), vec![0x05, 0x00, 0x01]);
    }
}
