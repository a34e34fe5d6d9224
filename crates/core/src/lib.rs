//! # joybus-core
//!
//! N64 controller-port peripheral emulation: a USB input device (mouse,
//! keyboard, HID gamepad, Xbox-style pad) presented to the console as a native
//! controller with a controller pak or rumble pak inserted.
//!
//! ## Architecture
//!
//! Two execution contexts share one [`SharedState`]:
//!
//! - **Protocol context**: woken by each falling edge on the data line
//!   ([`Device::poll`]); between transactions it runs the idle loop
//!   ([`Device::tick`]) that flushes the pak image to flash.
//! - **Adapter context**: the USB host loop. Device adapters
//!   ([`adapter`]) translate reports into controller registers; the loop
//!   passes through [`sync::CompanionEnd::checkpoint`] so a flush can park it.
//!
//! Modules, leaf first:
//!
//! - [`crc`]: address CRC5 and data CRC8
//! - [`state`]: lock-free controller, keyboard, rumble and link registers
//! - [`pak`]: 32 KiB block store with dirty tracking
//! - [`flash`]: durable region, flash backends, synchronized flush
//! - [`sync`]: pause/resume rendezvous between the contexts
//! - [`line`]: bit-exact receive and frame transmit on the wire
//! - [`dispatch`]: per-transaction command state machine
//! - [`adapter`]: device adapter contract and reference adapters
//! - [`hid`]: consumed HID report-parser interface and field extraction
//! - [`savestate`]: portable export/import of the device image
//! - [`sim`]: virtual clock, line and serializer for off-target runs

pub mod crc;
pub mod state;
pub mod pak;
pub mod flash;
pub mod sync;
pub mod line;
pub mod dispatch;
pub mod adapter;
pub mod hid;
pub mod savestate;
pub mod sim;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use dispatch::{DispatchState, Dispatcher, JoybusLink, Outcome};
pub use flash::{FlashError, FlashLayout, FlashRegion, FlushError, Persistence};
pub use line::{Command, LineTiming, ProtocolFrame, Transceiver};
pub use pak::AccessoryStore;
pub use state::{Buttons, DeviceKind, Report, SharedState};

/// Controller pak capacity: 32 KiB
pub const PAK_SIZE: usize = 32 * 1024;
/// Accessory transfer unit: 32 bytes
pub const BLOCK_SIZE: usize = 32;

/// Board-level settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Config {
    pub timing: LineTiming,
    pub layout: FlashLayout,
}

/// Line access the protocol context needs besides the transaction itself.
pub trait LineMonitor {
    /// True when nobody drives the line low.
    fn line_idle(&mut self) -> bool;
}

impl<P, T, S> LineMonitor for Transceiver<P, T, S>
where
    P: line::LinePin,
    T: line::TickSource,
    S: line::Serializer,
{
    fn line_idle(&mut self) -> bool {
        self.line_high()
    }
}

/// The protocol context: dispatcher, pak store and persistence around one
/// line.
pub struct Device<L, F, I, X> {
    pub shared: Arc<SharedState>,
    pub store: AccessoryStore,
    pub dispatcher: Dispatcher,
    pub link: L,
    pub persistence: Persistence<F, I, X>,
}

impl<L, F, I, X> Device<L, F, I, X>
where
    L: JoybusLink + LineMonitor,
    F: FlashRegion,
    I: sync::InterruptControl,
    X: sync::Fifo,
{
    /// Load the pak image from flash and come up idle.
    pub fn boot(shared: Arc<SharedState>, link: L, mut persistence: Persistence<F, I, X>) -> Result<Self, FlashError> {
        let store = persistence.load()?;
        Ok(Device { shared, store, dispatcher: Dispatcher::new(), link, persistence })
    }

    /// Edge entry point. Services one transaction if the line is low.
    pub fn poll(&mut self) -> Option<Outcome> {
        if self.link.line_idle() {
            return None;
        }
        Some(self.dispatcher.service(&mut self.link, &self.shared, &mut self.store))
    }

    /// Idle-loop entry point. Flushes the pak image when it is dirty and the
    /// line is quiet; returns whether a flush ran.
    pub fn tick(&mut self) -> Result<bool, FlushError> {
        if !self.store.is_dirty() || !self.quiescent() {
            return Ok(false);
        }
        self.persistence.flush(&mut self.store)?;
        Ok(true)
    }

    fn quiescent(&mut self) -> bool {
        self.dispatcher.state() == DispatchState::Idle
            && !self.shared.link.transaction_active.load(Ordering::SeqCst)
            && self.link.line_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flash::RamFlash;
    use crate::sim::{CaptureSerializer, VirtualClock, VirtualLine, VirtualPin, VirtualTicks};
    use crate::sync::test_support::LoopbackFifo;
    use crate::sync::{CountingIrq, ProtocolEnd};

    type SimDevice = Device<Transceiver<VirtualPin, VirtualTicks, CaptureSerializer>, RamFlash, CountingIrq, LoopbackFifo>;

    const TIMING: LineTiming = LineTiming { ticks_per_us: 4, edge_timeout: 300 };

    fn device(flash: RamFlash) -> (VirtualLine, sim::CaptureLog, SimDevice) {
        let clock = VirtualClock::new();
        let line = VirtualLine::new(clock.clone(), TIMING.ticks_per_us);
        let ser = CaptureSerializer::new(clock, TIMING.ticks_per_us);
        let log = ser.log();
        let xcvr = Transceiver::new(line.pin(), line.ticks(), ser, TIMING);
        let shared = Arc::new(SharedState::new());
        let link = ProtocolEnd::new(shared.clone(), LoopbackFifo::default());
        let persistence = Persistence::new(flash, FlashLayout::default(), CountingIrq::default(), link);
        let dev = Device::boot(shared, xcvr, persistence).unwrap();
        (line, log, dev)
    }

    #[test]
    fn test_poll_without_edge() {
        let (_line, log, mut dev) = device(RamFlash::default());
        assert_eq!(dev.poll(), None);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn test_boot_loads_flash_image() {
        let mut flash = RamFlash::default();
        let base = FlashLayout::default().offset as usize;
        flash.data[base..base + PAK_SIZE].fill(0x00);
        flash.data[base + 0x7FE0] = 0x99;
        let (_line, _log, dev) = device(flash);
        assert_eq!(dev.store.read_block(0x7FE0)[0], 0x99);
        assert!(!dev.store.is_dirty());
    }

    #[test]
    fn test_identify_over_the_wire() {
        let (line, log, mut dev) = device(RamFlash::default());
        line.console_send(&[0x00], 20);
        assert!(line.advance_to_next_edge());
        assert_eq!(dev.poll(), Some(Outcome::Responded { opcode: 0x00 }));
        assert_eq!(log.borrow()[0].bytes(), vec![0x05, 0x00, 0x01]);
    }

    #[test]
    fn test_tick_flushes_only_when_dirty() {
        let (line, _log, mut dev) = device(RamFlash::default());
        assert_eq!(dev.tick().unwrap(), false);

        let mut msg = vec![0x03, 0x00, 0x00];
        msg.extend_from_slice(&[0x42; BLOCK_SIZE]);
        line.console_send(&msg, 20);
        assert!(line.advance_to_next_edge());
        assert_eq!(dev.poll(), Some(Outcome::Responded { opcode: 0x03 }));
        assert!(dev.store.is_dirty());

        // Let the console stop bit pass
        line.clear();
        assert_eq!(dev.tick().unwrap(), true);
        assert!(!dev.store.is_dirty());
        let base = FlashLayout::default().offset as usize;
        assert_eq!(&dev.persistence.flash().data[base..base + PAK_SIZE], dev.store.image());
        assert_eq!(dev.tick().unwrap(), false);
    }

    #[test]
    fn test_tick_waits_for_idle_line() {
        let (line, _log, mut dev) = device(RamFlash::default());
        dev.store.write_block(0, &[1; BLOCK_SIZE]);
        line.hold_low(0, 50);
        assert!(line.advance_to_next_edge());
        assert_eq!(dev.tick().unwrap(), false);
        assert!(dev.store.is_dirty());
        assert_eq!(dev.persistence.flush_count, 0);
    }
}
