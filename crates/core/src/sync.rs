//! Cross-context rendezvous for the pak flush.
//!
//! The protocol context is the only one allowed to touch flash, and while it
//! erases and programs, the companion (USB/adapter) context must be stopped at
//! a known point. The handshake is a pair of blocking one-word FIFOs:
//!
//! ```text
//!   protocol                                companion
//!   ────────                                ─────────
//!   mask interrupts
//!   pause_requested = true
//!   pop ◄──────────── TOKEN_PARKED ──────── push   (checkpoint saw the flag,
//!   erase + program                         pop    masked its interrupts)
//!   pause_requested = false                  │
//!   push ───────────── TOKEN_RESUME ───────► ┘
//!   unmask interrupts                       unmask, carry on
//! ```
//!
//! This is the only multi-field synchronization between the two contexts.

use std::sync::atomic::Ordering;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::sync::Arc;

use thiserror::Error;

use crate::state::SharedState;

/// Companion → protocol: parked at a safe point.
pub const TOKEN_PARKED: u32 = 0x4321;
/// Protocol → companion: flash done, carry on.
pub const TOKEN_RESUME: u32 = 0x1234;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("rendezvous peer disconnected")]
    Disconnected,
    #[error("unexpected rendezvous token {0:#06x}")]
    UnexpectedToken(u32),
}

/// Blocking one-word channel to the other context (the inter-core FIFO on
/// hardware).
pub trait Fifo {
    fn push_blocking(&mut self, word: u32) -> Result<(), SyncError>;
    fn pop_blocking(&mut self) -> Result<u32, SyncError>;
}

/// Saved interrupt mask, handed back to [`InterruptControl::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqState(pub u32);

/// Interrupt masking on the current context.
pub trait InterruptControl {
    fn disable(&mut self) -> IrqState;
    fn restore(&mut self, state: IrqState);
}

/// Host interrupt control: there are no real interrupts, so it only keeps
/// count, which is what the tests look at.
#[derive(Debug, Default)]
pub struct CountingIrq {
    pub disabled: u32,
    pub restored: u32,
    masked: bool,
}

impl CountingIrq {
    pub fn is_masked(&self) -> bool {
        self.masked
    }
}

impl InterruptControl for CountingIrq {
    fn disable(&mut self) -> IrqState {
        let prev = self.masked;
        self.masked = true;
        self.disabled += 1;
        IrqState(prev as u32)
    }

    fn restore(&mut self, state: IrqState) {
        self.masked = state.0 != 0;
        self.restored += 1;
    }
}

// ─── Channel FIFO ───────────────────────────────────────────────────────────

/// One end of a pair of zero-capacity channels: every push blocks until the
/// other side pops, like the hardware FIFO in blocking mode.
pub struct ChannelFifo {
    tx: SyncSender<u32>,
    rx: Receiver<u32>,
}

impl Fifo for ChannelFifo {
    fn push_blocking(&mut self, word: u32) -> Result<(), SyncError> {
        self.tx.send(word).map_err(|_| SyncError::Disconnected)
    }

    fn pop_blocking(&mut self) -> Result<u32, SyncError> {
        self.rx.recv().map_err(|_| SyncError::Disconnected)
    }
}

/// Two connected FIFO ends.
pub fn channel_pair() -> (ChannelFifo, ChannelFifo) {
    let (tx_a, rx_b) = sync_channel(0);
    let (tx_b, rx_a) = sync_channel(0);
    (ChannelFifo { tx: tx_a, rx: rx_a }, ChannelFifo { tx: tx_b, rx: rx_b })
}

/// Connected protocol/companion ends over [`ChannelFifo`].
pub fn rendezvous<I: InterruptControl>(
    shared: Arc<SharedState>,
    companion_irq: I,
) -> (ProtocolEnd<ChannelFifo>, CompanionEnd<ChannelFifo, I>) {
    let (a, b) = channel_pair();
    (ProtocolEnd::new(shared.clone(), a), CompanionEnd::new(shared, b, companion_irq))
}

// ─── Protocol side ──────────────────────────────────────────────────────────

pub struct ProtocolEnd<X> {
    shared: Arc<SharedState>,
    fifo: X,
}

impl<X: Fifo> ProtocolEnd<X> {
    pub fn new(shared: Arc<SharedState>, fifo: X) -> Self {
        ProtocolEnd { shared, fifo }
    }

    /// Ask the companion to park and block until it has.
    pub fn pause(&mut self) -> Result<(), SyncError> {
        self.shared.link.pause_requested.store(true, Ordering::SeqCst);
        let token = match self.fifo.pop_blocking() {
            Ok(token) => token,
            Err(e) => {
                self.shared.link.pause_requested.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        if token != TOKEN_PARKED {
            self.shared.link.pause_requested.store(false, Ordering::SeqCst);
            return Err(SyncError::UnexpectedToken(token));
        }
        Ok(())
    }

    /// Release a parked companion.
    pub fn resume(&mut self) -> Result<(), SyncError> {
        self.shared.link.pause_requested.store(false, Ordering::SeqCst);
        self.fifo.push_blocking(TOKEN_RESUME)
    }
}

// ─── Companion side ─────────────────────────────────────────────────────────

pub struct CompanionEnd<X, I> {
    shared: Arc<SharedState>,
    fifo: X,
    irq: I,
    /// Times this end has parked
    pub parks: u32,
}

impl<X: Fifo, I: InterruptControl> CompanionEnd<X, I> {
    pub fn new(shared: Arc<SharedState>, fifo: X, irq: I) -> Self {
        CompanionEnd { shared, fifo, irq, parks: 0 }
    }

    /// Call once per companion loop iteration, at a point where nothing is
    /// half-written. Parks here while a flush runs. Returns whether it parked.
    pub fn checkpoint(&mut self) -> Result<bool, SyncError> {
        if !self.shared.link.pause_requested.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let saved = self.irq.disable();
        self.shared.link.companion_parked.store(true, Ordering::SeqCst);
        let result = self.park();
        self.shared.link.companion_parked.store(false, Ordering::SeqCst);
        self.irq.restore(saved);
        self.parks += 1;
        result.map(|()| true)
    }

    fn park(&mut self) -> Result<(), SyncError> {
        self.fifo.push_blocking(TOKEN_PARKED)?;
        match self.fifo.pop_blocking()? {
            TOKEN_RESUME => Ok(()),
            other => Err(SyncError::UnexpectedToken(other)),
        }
    }
}

/// Single-context stand-ins used by unit tests.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Answers every pop with `TOKEN_PARKED`, as if a companion were always
    /// waiting at its checkpoint.
    #[derive(Default)]
    pub struct LoopbackFifo {
        pub pushed: Vec<u32>,
    }

    impl Fifo for LoopbackFifo {
        fn push_blocking(&mut self, word: u32) -> Result<(), SyncError> {
            self.pushed.push(word);
            Ok(())
        }

        fn pop_blocking(&mut self) -> Result<u32, SyncError> {
            Ok(TOKEN_PARKED)
        }
    }
}
