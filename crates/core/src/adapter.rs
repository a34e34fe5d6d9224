//! Device adapters: USB reports in, controller registers out.
//!
//! One adapter is active at a time. It owns every device-specific choice
//! (button mapping, dead zones, which stick wins) and writes the result into
//! [`SharedState`]; the dispatcher only ever looks at the registers and the
//! active [`DeviceKind`].
//!
//! | Adapter               | Device                    | Console sees |
//! |-----------------------|---------------------------|--------------|
//! | [`XpadAdapter`]       | Xbox 360 wired pad        | controller   |
//! | [`HidGamepadAdapter`] | generic HID gamepad       | controller   |
//! | [`MouseAdapter`]      | boot-protocol mouse       | mouse        |
//! | [`KeyboardAdapter`]   | boot-protocol keyboard    | keyboard     |
//!
//! Adapters run in the companion context and never block; the only blocking
//! point of that loop is [`crate::sync::CompanionEnd::checkpoint`].

use log::{debug, info};
use thiserror::Error;

use crate::hid::{self, field_value, HidError, ReportLayout, ReportParser};
use crate::state::{clamp_axis, Buttons, DeviceKind, Report, SharedState};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AdapterError {
    #[error("report too short: {got} bytes, need {need}")]
    ShortReport { got: usize, need: usize },
    #[error(transparent)]
    Hid(#[from] HidError),
}

fn require(raw: &[u8], need: usize) -> Result<(), AdapterError> {
    if raw.len() < need {
        return Err(AdapterError::ShortReport { got: raw.len(), need });
    }
    Ok(())
}

/// Contract between the USB host loop and the controller registers.
pub trait DeviceAdapter {
    fn kind(&self) -> DeviceKind;

    /// A device this adapter handles was enumerated at USB address `id`.
    fn on_device_mounted(&mut self, id: u8, shared: &SharedState) {
        mount(self.kind(), id, shared);
    }

    /// Translate one input report and publish it. Returns what was
    /// published.
    fn on_report(&mut self, raw: &[u8], shared: &SharedState) -> Result<Report, AdapterError>;
}

/// Make `kind` the active device with a neutral sample.
pub fn mount(kind: DeviceKind, id: u8, shared: &SharedState) {
    info!("{:?} mounted at address {}", kind, id);
    shared.controller.store(Report::default());
    shared.controller.set_device(kind);
}

/// The active device went away.
pub fn unmount(id: u8, shared: &SharedState) {
    info!("device at address {} unmounted", id);
    shared.controller.set_device(DeviceKind::None);
    shared.controller.store(Report::default());
    shared.keyboard.reset();
}

// ─── Mouse ──────────────────────────────────────────────────────────────────

pub const MOUSE_BUTTON_LEFT: u8 = 0x01;
pub const MOUSE_BUTTON_RIGHT: u8 = 0x02;
pub const MOUSE_BUTTON_MIDDLE: u8 = 0x04;

/// Boot-protocol mouse: `[buttons, x, y, wheel?, pan?]`.
///
/// Motion accumulates into the stick registers until the console polls and
/// the dispatcher zeroes them. Screen Y grows downward, stick Y upward.
#[derive(Debug, Default)]
pub struct MouseAdapter;

impl MouseAdapter {
    pub fn new() -> Self {
        MouseAdapter
    }
}

impl DeviceAdapter for MouseAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Mouse
    }

    fn on_report(&mut self, raw: &[u8], shared: &SharedState) -> Result<Report, AdapterError> {
        require(raw, 3)?;
        let pressed = raw[0];
        let dx = raw[1] as i8 as i32;
        let dy = raw[2] as i8 as i32;
        let wheel = raw.get(3).map_or(0, |&b| b as i8);
        let pan = raw.get(4).map_or(0, |&b| b as i8);

        let mut buttons = Buttons::empty();
        buttons.set(Buttons::A, pressed & MOUSE_BUTTON_LEFT != 0);
        buttons.set(Buttons::B, pressed & MOUSE_BUTTON_RIGHT != 0);
        buttons.set(Buttons::START, pressed & MOUSE_BUTTON_MIDDLE != 0);
        buttons.set(Buttons::C_UP, wheel > 0);
        buttons.set(Buttons::C_DOWN, wheel < 0);
        buttons.set(Buttons::C_LEFT, pan > 0);
        buttons.set(Buttons::C_RIGHT, pan < 0);

        let prev = shared.controller.load();
        let report = Report {
            buttons,
            stick_x: clamp_axis(prev.stick_x as i32 + dx),
            stick_y: clamp_axis(prev.stick_y as i32 - dy),
        };
        shared.controller.store(report);
        Ok(report)
    }
}

// ─── Xbox 360 pad ───────────────────────────────────────────────────────────

/// Input report layout of a wired Xbox 360 pad:
///
/// | Bytes  | Field                         |
/// |--------|-------------------------------|
/// | 0      | message type (0x00 = input)   |
/// | 1      | length (0x14)                 |
/// | 2..4   | button word, little-endian    |
/// | 4, 5   | left / right trigger, 0..255  |
/// | 6..14  | LX, LY, RX, RY as i16 LE      |
pub const XPAD_REPORT_LEN: usize = 14;
const XPAD_MSG_INPUT: u8 = 0x00;

pub const XPAD_DPAD_UP: u16 = 0x0001;
pub const XPAD_DPAD_DOWN: u16 = 0x0002;
pub const XPAD_DPAD_LEFT: u16 = 0x0004;
pub const XPAD_DPAD_RIGHT: u16 = 0x0008;
pub const XPAD_START: u16 = 0x0010;
pub const XPAD_BACK: u16 = 0x0020;
pub const XPAD_LB: u16 = 0x0100;
pub const XPAD_RB: u16 = 0x0200;
pub const XPAD_GUIDE: u16 = 0x0400;
pub const XPAD_A: u16 = 0x1000;
pub const XPAD_B: u16 = 0x2000;
pub const XPAD_X: u16 = 0x4000;
pub const XPAD_Y: u16 = 0x8000;

/// Trigger reading above which the trigger counts as a button.
pub const TRIGGER_THRESHOLD: u8 = 128;
/// Raw axis units per stick unit.
const AXIS_DIVISOR: i32 = 400;
/// Scaled readings inside ±DEAD_ZONE read as centred.
const DEAD_ZONE: i32 = 10;

/// Scale a 16-bit pad axis to stick units: divide, dead zone, clamp.
pub fn scale_axis(raw: i16) -> i8 {
    let v = raw as i32 / AXIS_DIVISOR;
    if v.abs() < DEAD_ZONE {
        return 0;
    }
    clamp_axis(v)
}

/// Fields of one pad input report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XpadInput {
    pub buttons: u16,
    pub lt: u8,
    pub rt: u8,
    pub lx: i16,
    pub ly: i16,
    pub rx: i16,
    pub ry: i16,
}

impl XpadInput {
    /// Parse an input message. `None` for other message types (LED, rumble
    /// status, link).
    pub fn parse(raw: &[u8]) -> Result<Option<Self>, AdapterError> {
        require(raw, 2)?;
        if raw[0] != XPAD_MSG_INPUT {
            return Ok(None);
        }
        require(raw, XPAD_REPORT_LEN)?;
        let word = |i: usize| i16::from_le_bytes([raw[i], raw[i + 1]]);
        Ok(Some(XpadInput {
            buttons: u16::from_le_bytes([raw[2], raw[3]]),
            lt: raw[4],
            rt: raw[5],
            lx: word(6),
            ly: word(8),
            rx: word(10),
            ry: word(12),
        }))
    }

    /// Inverse of [`XpadInput::parse`].
    pub fn to_bytes(&self) -> [u8; XPAD_REPORT_LEN] {
        let mut out = [0u8; XPAD_REPORT_LEN];
        out[1] = 0x14;
        out[2..4].copy_from_slice(&self.buttons.to_le_bytes());
        out[4] = self.lt;
        out[5] = self.rt;
        out[6..8].copy_from_slice(&self.lx.to_le_bytes());
        out[8..10].copy_from_slice(&self.ly.to_le_bytes());
        out[10..12].copy_from_slice(&self.rx.to_le_bytes());
        out[12..14].copy_from_slice(&self.ry.to_le_bytes());
        out
    }

    pub fn to_report(&self) -> Report {
        let held = |mask: u16| self.buttons & mask != 0;
        let mut b = Buttons::empty();
        b.set(Buttons::D_UP, held(XPAD_DPAD_UP));
        b.set(Buttons::D_DOWN, held(XPAD_DPAD_DOWN));
        b.set(Buttons::D_LEFT, held(XPAD_DPAD_LEFT));
        b.set(Buttons::D_RIGHT, held(XPAD_DPAD_RIGHT));

        b.set(Buttons::C_UP, held(XPAD_LB));
        b.set(Buttons::C_DOWN, held(XPAD_RB));
        b.set(Buttons::C_LEFT, self.lt > TRIGGER_THRESHOLD);
        b.set(Buttons::C_RIGHT, self.rt > TRIGGER_THRESHOLD);

        b.set(Buttons::A, held(XPAD_A));
        b.set(Buttons::B, held(XPAD_B));
        b.set(Buttons::Z, held(XPAD_X));
        b.set(Buttons::R, held(XPAD_Y));
        b.set(Buttons::START, held(XPAD_START));

        // Left stick unless it is centred
        let (lx, ly) = (scale_axis(self.lx), scale_axis(self.ly));
        let (stick_x, stick_y) = if lx != 0 || ly != 0 { (lx, ly) } else { (scale_axis(self.rx), scale_axis(self.ry)) };
        Report { buttons: b, stick_x, stick_y }
    }
}

/// Xbox 360 pad. The guide button toggles between memory pak and rumble pak.
#[derive(Debug, Default)]
pub struct XpadAdapter {
    guide_held: bool,
    /// Motor level last handed to the pad
    motor_sent: bool,
}

impl XpadAdapter {
    pub fn new() -> Self {
        XpadAdapter::default()
    }

    /// Motor level to send to the pad, when it changed since the last call.
    pub fn motor_command(&mut self, shared: &SharedState) -> Option<bool> {
        let motor = shared.rumble.motor();
        if motor == self.motor_sent {
            return None;
        }
        self.motor_sent = motor;
        debug!("pad vibration {}", if motor { "on" } else { "off" });
        Some(motor)
    }
}

impl DeviceAdapter for XpadAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Xpad
    }

    fn on_device_mounted(&mut self, id: u8, shared: &SharedState) {
        self.guide_held = false;
        self.motor_sent = false;
        mount(self.kind(), id, shared);
    }

    fn on_report(&mut self, raw: &[u8], shared: &SharedState) -> Result<Report, AdapterError> {
        let input = match XpadInput::parse(raw)? {
            Some(input) => input,
            None => return Ok(shared.controller.load()),
        };

        let guide = input.buttons & XPAD_GUIDE != 0;
        if guide && !self.guide_held {
            let on = shared.rumble.toggle_rumble_pak();
            debug!("accessory: {}", if on { "rumble pak" } else { "controller pak" });
        }
        self.guide_held = guide;

        let report = input.to_report();
        shared.controller.store(report);
        Ok(report)
    }
}

// ─── Generic HID gamepad ────────────────────────────────────────────────────

/// Button-page usages 1.. in order, as N64 buttons.
pub const HID_BUTTON_MAP: [Buttons; 10] = [
    Buttons::A,
    Buttons::B,
    Buttons::C_DOWN,
    Buttons::C_LEFT,
    Buttons::L,
    Buttons::R,
    Buttons::Z,
    Buttons::C_RIGHT,
    Buttons::C_UP,
    Buttons::START,
];

/// Button-page indices (0-based) that toggle the accessory when held
/// together: select + start.
const HID_ACCESSORY_CHORD: (usize, usize) = (8, 9);

/// Hat switch positions 0..7, clockwise from north.
const HAT_DIRECTIONS: [Buttons; 8] = [
    Buttons::D_UP,
    Buttons::D_UP.union(Buttons::D_RIGHT),
    Buttons::D_RIGHT,
    Buttons::D_DOWN.union(Buttons::D_RIGHT),
    Buttons::D_DOWN,
    Buttons::D_DOWN.union(Buttons::D_LEFT),
    Buttons::D_LEFT,
    Buttons::D_UP.union(Buttons::D_LEFT),
];

/// Map a logical-range reading onto ±80, with the same dead zone as the pad.
fn rescale(value: i32, field: &hid::FieldDescriptor) -> i8 {
    let span = field.logical_span();
    let centred = 2 * (value as i64 - field.logical_min as i64) - span;
    let v = (centred * crate::state::STICK_LIMIT as i64 / span) as i32;
    if v.abs() < DEAD_ZONE {
        return 0;
    }
    clamp_axis(v)
}

/// Any HID gamepad, through a [`ReportLayout`] from the host's descriptor
/// parser.
#[derive(Debug)]
pub struct HidGamepadAdapter {
    layout: ReportLayout,
    chord_held: bool,
}

impl HidGamepadAdapter {
    pub fn new(layout: ReportLayout) -> Self {
        HidGamepadAdapter { layout, chord_held: false }
    }

    pub fn from_descriptor<P: ReportParser>(parser: &P, descriptor: &[u8]) -> Result<Self, AdapterError> {
        let layout = ReportLayout::parse(parser, descriptor)?;
        if layout.find_by_usage(hid::PAGE_GENERIC_DESKTOP, hid::USAGE_X).is_none() {
            return Err(HidError::Missing("X axis").into());
        }
        Ok(HidGamepadAdapter::new(layout))
    }

    fn axis(&self, usage: u16, raw: &[u8]) -> Result<i8, AdapterError> {
        match self.layout.find_by_usage(hid::PAGE_GENERIC_DESKTOP, usage) {
            Some(field) => Ok(rescale(field_value(field, raw)?, field)),
            None => Ok(0),
        }
    }

    fn button(&self, index: usize, raw: &[u8]) -> Result<bool, AdapterError> {
        match self.layout.find_bit_by_page(hid::PAGE_BUTTON, index) {
            Some(field) => Ok(field_value(field, raw)? != 0),
            None => Ok(false),
        }
    }

    fn hat(&self, raw: &[u8]) -> Result<Buttons, AdapterError> {
        let Some(field) = self.layout.find_by_usage(hid::PAGE_GENERIC_DESKTOP, hid::USAGE_HAT_SWITCH) else {
            return Ok(Buttons::empty());
        };
        // Out-of-range is the null state: centred
        let pos = field_value(field, raw)? as i64 - field.logical_min as i64;
        Ok(usize::try_from(pos).ok().and_then(|i| HAT_DIRECTIONS.get(i).copied()).unwrap_or(Buttons::empty()))
    }
}

impl DeviceAdapter for HidGamepadAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::HidGamepad
    }

    fn on_device_mounted(&mut self, id: u8, shared: &SharedState) {
        self.chord_held = false;
        mount(self.kind(), id, shared);
    }

    fn on_report(&mut self, raw: &[u8], shared: &SharedState) -> Result<Report, AdapterError> {
        let mut buttons = self.hat(raw)?;
        for (i, mapped) in HID_BUTTON_MAP.iter().enumerate() {
            if self.button(i, raw)? {
                buttons |= *mapped;
            }
        }

        let (a, b) = HID_ACCESSORY_CHORD;
        let chord = self.button(a, raw)? && self.button(b, raw)?;
        if chord && !self.chord_held {
            let on = shared.rumble.toggle_rumble_pak();
            debug!("accessory: {}", if on { "rumble pak" } else { "controller pak" });
        }
        self.chord_held = chord;

        // Left stick unless it is centred, then Z/Rz. HID Y grows downward.
        let (mut stick_x, mut stick_y) = (self.axis(hid::USAGE_X, raw)?, self.axis(hid::USAGE_Y, raw)?);
        if stick_x == 0 && stick_y == 0 {
            stick_x = self.axis(hid::USAGE_Z, raw)?;
            stick_y = self.axis(hid::USAGE_RZ, raw)?;
        }
        let report = Report { buttons, stick_x, stick_y: stick_y.saturating_neg() };
        shared.controller.store(report);
        Ok(report)
    }
}

// ─── Keyboard ───────────────────────────────────────────────────────────────

/// Boot keyboard report: `[modifiers, reserved, key0..key5]`.
pub const KEYBOARD_REPORT_LEN: usize = 8;
/// Keycode a keyboard reports in every slot when too many keys are down.
pub const HID_KEY_ERROR_ROLLOVER: u8 = 0x01;
pub const HID_KEY_HOME: u8 = 0x4A;

/// Boot keyboard. HID usages are translated through a caller-supplied table
/// of `(usage, scan code)` pairs; unmapped keys are dropped.
#[derive(Debug)]
pub struct KeyboardAdapter {
    keymap: &'static [(u8, u16)],
}

impl KeyboardAdapter {
    pub fn new(keymap: &'static [(u8, u16)]) -> Self {
        KeyboardAdapter { keymap }
    }

    fn scan_code(&self, usage: u8) -> Option<u16> {
        self.keymap.iter().find(|&&(u, _)| u == usage).map(|&(_, code)| code)
    }
}

impl DeviceAdapter for KeyboardAdapter {
    fn kind(&self) -> DeviceKind {
        DeviceKind::Keyboard
    }

    fn on_device_mounted(&mut self, id: u8, shared: &SharedState) {
        shared.keyboard.reset();
        mount(self.kind(), id, shared);
    }

    fn on_report(&mut self, raw: &[u8], shared: &SharedState) -> Result<Report, AdapterError> {
        require(raw, KEYBOARD_REPORT_LEN)?;
        let mut keys = [0u16; 3];
        let mut count = 0;
        let mut error = false;
        let mut home = false;
        for &usage in &raw[2..KEYBOARD_REPORT_LEN] {
            match usage {
                0 => {}
                HID_KEY_ERROR_ROLLOVER => error = true,
                _ => {
                    home |= usage == HID_KEY_HOME;
                    if let Some(code) = self.scan_code(usage) {
                        if count < keys.len() {
                            keys[count] = code;
                        } else {
                            error = true;
                        }
                        count += 1;
                    }
                }
            }
        }
        shared.keyboard.update(keys, error, home);
        Ok(Report::default())
    }
}

// ─── Status indicator ───────────────────────────────────────────────────────

/// Blink period in rumble-pak mode.
pub const BLINK_RUMBLE_MS: u64 = 500;
/// Blink period in controller-pak mode.
pub const BLINK_PAK_MS: u64 = 1000;

/// Companion-loop LED task. The blink rate shows which accessory is
/// inserted.
#[derive(Debug, Default)]
pub struct StatusIndicator {
    start_ms: u64,
    led: bool,
}

impl StatusIndicator {
    pub fn new(now_ms: u64) -> Self {
        StatusIndicator { start_ms: now_ms, led: false }
    }

    pub fn interval_ms(shared: &SharedState) -> u64 {
        if shared.rumble.rumble_pak() {
            BLINK_RUMBLE_MS
        } else {
            BLINK_PAK_MS
        }
    }

    /// Call every loop iteration. Returns the level to drive the LED to when
    /// a period has elapsed.
    pub fn tick(&mut self, now_ms: u64, shared: &SharedState) -> Option<bool> {
        let interval = Self::interval_ms(shared);
        if now_ms.saturating_sub(self.start_ms) < interval {
            return None;
        }
        self.start_ms += interval;
        self.led = !self.led;
        Some(self.led)
    }

    pub fn led(&self) -> bool {
        self.led
    }
}
