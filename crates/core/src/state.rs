//! Shared controller registers.
//!
//! Everything the adapter context writes and the protocol context reads lives
//! in one [`SharedState`], handed to both sides by reference. There is no lock:
//! every field is its own atomic, so a reader never sees a torn byte, but a
//! reader may see the buttons of one report next to the stick of the next.
//! The console polls often enough that this is invisible.
//!
//! | Register                | Writer                      | Reader                 |
//! |-------------------------|-----------------------------|------------------------|
//! | [`ControllerRegs`]      | active device adapter       | dispatcher (0x00/0x01) |
//! | [`KeyboardRegs`] keys   | keyboard adapter            | dispatcher (0x13)      |
//! | [`KeyboardRegs`] LEDs   | dispatcher (0x13)           | indicator logic        |
//! | [`RumbleState`]         | dispatcher + adapter chord  | dispatcher + motor     |
//! | [`LinkFlags`]           | protocol context            | companion + flush gate |

use core::sync::atomic::{AtomicBool, AtomicI8, AtomicU16, AtomicU8, Ordering};

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

/// Stick axes are clamped to this magnitude, the travel of a stock N64 stick.
pub const STICK_LIMIT: i8 = 80;

bitflags! {
    /// N64 button word. The high byte goes out first on the wire.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u16 {
        const A       = 0x8000;
        const B       = 0x4000;
        const Z       = 0x2000;
        const START   = 0x1000;
        const D_UP    = 0x0800;
        const D_DOWN  = 0x0400;
        const D_LEFT  = 0x0200;
        const D_RIGHT = 0x0100;
        const RESET   = 0x0080;
        const L       = 0x0020;
        const R       = 0x0010;
        const C_UP    = 0x0008;
        const C_DOWN  = 0x0004;
        const C_LEFT  = 0x0002;
        const C_RIGHT = 0x0001;
    }
}

impl Buttons {
    /// Split into the two bytes in transmission order.
    pub fn to_bytes(self) -> [u8; 2] {
        self.bits().to_be_bytes()
    }

    pub fn from_bytes(bytes: [u8; 2]) -> Self {
        Buttons::from_bits_retain(u16::from_be_bytes(bytes))
    }
}

/// Which USB device is currently feeding the registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum DeviceKind {
    #[default]
    None = 0,
    Xpad = 1,
    HidGamepad = 2,
    Mouse = 3,
    Keyboard = 4,
}

impl DeviceKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => DeviceKind::Xpad,
            2 => DeviceKind::HidGamepad,
            3 => DeviceKind::Mouse,
            4 => DeviceKind::Keyboard,
            _ => DeviceKind::None,
        }
    }
}

/// One adapter-computed controller sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Report {
    pub buttons: Buttons,
    pub stick_x: i8,
    pub stick_y: i8,
}

/// Clamp an axis into `[-STICK_LIMIT, STICK_LIMIT]`.
pub fn clamp_axis(v: i32) -> i8 {
    v.clamp(-(STICK_LIMIT as i32), STICK_LIMIT as i32) as i8
}

// ─── Controller ─────────────────────────────────────────────────────────────

pub struct ControllerRegs {
    buttons: [AtomicU8; 2],
    stick: [AtomicI8; 2],
    device: AtomicU8,
}

impl ControllerRegs {
    pub const fn new() -> Self {
        ControllerRegs {
            buttons: [AtomicU8::new(0), AtomicU8::new(0)],
            stick: [AtomicI8::new(0), AtomicI8::new(0)],
            device: AtomicU8::new(DeviceKind::None as u8),
        }
    }

    /// Publish a fresh sample. Axes are clamped on the way in.
    pub fn store(&self, report: Report) {
        let [hi, lo] = report.buttons.to_bytes();
        self.buttons[0].store(hi, Ordering::Relaxed);
        self.buttons[1].store(lo, Ordering::Relaxed);
        self.stick[0].store(clamp_axis(report.stick_x as i32), Ordering::Relaxed);
        self.stick[1].store(clamp_axis(report.stick_y as i32), Ordering::Relaxed);
    }

    /// Field-by-field read; not a consistent snapshot.
    pub fn load(&self) -> Report {
        Report {
            buttons: Buttons::from_bytes([
                self.buttons[0].load(Ordering::Relaxed),
                self.buttons[1].load(Ordering::Relaxed),
            ]),
            stick_x: self.stick[0].load(Ordering::Relaxed),
            stick_y: self.stick[1].load(Ordering::Relaxed),
        }
    }

    /// Zero the axes. Used after a mouse poll: the console consumed the delta.
    pub fn reset_stick(&self) {
        self.stick[0].store(0, Ordering::Relaxed);
        self.stick[1].store(0, Ordering::Relaxed);
    }

    pub fn device(&self) -> DeviceKind {
        DeviceKind::from_u8(self.device.load(Ordering::Relaxed))
    }

    pub fn set_device(&self, kind: DeviceKind) {
        self.device.store(kind as u8, Ordering::Relaxed);
    }
}

impl Default for ControllerRegs {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Keyboard ───────────────────────────────────────────────────────────────

/// Status byte bits of the keyboard exchange.
pub const KB_STATUS_HOME: u8 = 0x01;
pub const KB_STATUS_ERROR: u8 = 0x10;

pub struct KeyboardRegs {
    keys: [AtomicU16; 3],
    error: AtomicBool,
    home: AtomicBool,
    /// Last LED byte sent by the console
    led_status: AtomicU8,
}

impl KeyboardRegs {
    pub const fn new() -> Self {
        KeyboardRegs {
            keys: [AtomicU16::new(0), AtomicU16::new(0), AtomicU16::new(0)],
            error: AtomicBool::new(false),
            home: AtomicBool::new(false),
            led_status: AtomicU8::new(0),
        }
    }

    pub fn reset(&self) {
        self.update([0; 3], false, false);
    }

    pub fn update(&self, keys: [u16; 3], error: bool, home: bool) {
        for (slot, key) in self.keys.iter().zip(keys) {
            slot.store(key, Ordering::Relaxed);
        }
        self.error.store(error, Ordering::Relaxed);
        self.home.store(home, Ordering::Relaxed);
    }

    pub fn keys(&self) -> [u16; 3] {
        [
            self.keys[0].load(Ordering::Relaxed),
            self.keys[1].load(Ordering::Relaxed),
            self.keys[2].load(Ordering::Relaxed),
        ]
    }

    pub fn status_byte(&self) -> u8 {
        let mut status = 0;
        if self.error.load(Ordering::Relaxed) {
            status |= KB_STATUS_ERROR;
        }
        if self.home.load(Ordering::Relaxed) {
            status |= KB_STATUS_HOME;
        }
        status
    }

    pub fn led_status(&self) -> u8 {
        self.led_status.load(Ordering::Relaxed)
    }

    pub fn set_led_status(&self, leds: u8) {
        self.led_status.store(leds, Ordering::Relaxed);
    }
}

impl Default for KeyboardRegs {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Rumble ─────────────────────────────────────────────────────────────────

/// Accessory mode plus motor state.
///
/// `rumble_pak` decides what the console finds when it probes 0x8000; `motor`
/// is what the last write to 0xC000 asked for.
pub struct RumbleState {
    rumble_pak: AtomicBool,
    motor: AtomicBool,
}

impl RumbleState {
    pub const fn new() -> Self {
        RumbleState { rumble_pak: AtomicBool::new(false), motor: AtomicBool::new(false) }
    }

    pub fn rumble_pak(&self) -> bool {
        self.rumble_pak.load(Ordering::Relaxed)
    }

    pub fn set_rumble_pak(&self, on: bool) {
        self.rumble_pak.store(on, Ordering::Relaxed);
    }

    /// Flip the accessory mode; returns the new mode.
    pub fn toggle_rumble_pak(&self) -> bool {
        !self.rumble_pak.fetch_xor(true, Ordering::Relaxed)
    }

    pub fn motor(&self) -> bool {
        self.motor.load(Ordering::Relaxed)
    }

    pub fn set_motor(&self, on: bool) {
        self.motor.store(on, Ordering::Relaxed);
    }
}

impl Default for RumbleState {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Link ───────────────────────────────────────────────────────────────────

/// Flags coordinating the two contexts around a flush.
pub struct LinkFlags {
    /// Set by the protocol context while it wants the companion parked
    pub pause_requested: AtomicBool,
    /// Set for the whole span of one console transaction
    pub transaction_active: AtomicBool,
    /// Set by the companion while it sits in the rendezvous
    pub companion_parked: AtomicBool,
}

impl LinkFlags {
    pub const fn new() -> Self {
        LinkFlags {
            pause_requested: AtomicBool::new(false),
            transaction_active: AtomicBool::new(false),
            companion_parked: AtomicBool::new(false),
        }
    }
}

impl Default for LinkFlags {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Aggregate ──────────────────────────────────────────────────────────────

/// All cross-context state. Lives for the whole process; both contexts hold a
/// reference (`&'static` on hardware, `Arc` on the host).
pub struct SharedState {
    pub controller: ControllerRegs,
    pub keyboard: KeyboardRegs,
    pub rumble: RumbleState,
    pub link: LinkFlags,
}

impl SharedState {
    pub const fn new() -> Self {
        SharedState {
            controller: ControllerRegs::new(),
            keyboard: KeyboardRegs::new(),
            rumble: RumbleState::new(),
            link: LinkFlags::new(),
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buttons_byte_order() {
        let b = Buttons::A | Buttons::C_RIGHT;
        assert_eq!(b.to_bytes(), [0x80, 0x01]);
        assert_eq!(Buttons::from_bytes([0x80, 0x01]), b);
    }

    #[test]
    fn test_store_clamps_axes() {
        let regs = ControllerRegs::new();
        regs.store(Report { buttons: Buttons::empty(), stick_x: 127, stick_y: -128 });
        let r = regs.load();
        assert_eq!(r.stick_x, 80);
        assert_eq!(r.stick_y, -80);
    }

    #[test]
    fn test_reset_stick_keeps_buttons() {
        let regs = ControllerRegs::new();
        regs.store(Report { buttons: Buttons::B, stick_x: 5, stick_y: -5 });
        regs.reset_stick();
        assert_eq!(regs.load(), Report { buttons: Buttons::B, stick_x: 0, stick_y: 0 });
    }

    #[test]
    fn test_device_kind_roundtrip() {
        let regs = ControllerRegs::new();
        assert_eq!(regs.device(), DeviceKind::None);
        regs.set_device(DeviceKind::Keyboard);
        assert_eq!(regs.device(), DeviceKind::Keyboard);
        assert_eq!(DeviceKind::from_u8(0x7F), DeviceKind::None);
    }

    #[test]
    fn test_keyboard_status_byte() {
        let kb = KeyboardRegs::new();
        assert_eq!(kb.status_byte(), 0);
        kb.update([1, 2, 3], true, false);
        assert_eq!(kb.status_byte(), 0x10);
        kb.update([1, 2, 3], true, true);
        assert_eq!(kb.status_byte(), 0x11);
        kb.reset();
        assert_eq!(kb.keys(), [0; 3]);
        assert_eq!(kb.status_byte(), 0);
    }

    #[test]
    fn test_toggle_rumble_pak() {
        let r = RumbleState::new();
        assert!(r.toggle_rumble_pak());
        assert!(r.rumble_pak());
        assert!(!r.toggle_rumble_pak());
        assert!(!r.rumble_pak());
    }
}
