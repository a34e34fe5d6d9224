//! Joybus command dispatcher.
//!
//! One call to [`Dispatcher::service`] handles one console transaction, from
//! the falling edge that started it to the end of the reply:
//!
//! ```text
//!  Idle ──edge──► ReceivingCommand ──┬─► Responding ──────┐
//!                                    ├─► AbortedTimeout ──┼──► Idle
//!                                    └─► Ignored ─────────┘
//! ```
//!
//! | Opcode    | Reply                                                        |
//! |-----------|--------------------------------------------------------------|
//! | 0x00/0xFF | device type (2 bytes, big-endian) + status 0x01              |
//! | 0x01      | buttons hi, buttons lo, stick x, stick y (none for keyboard) |
//! | 0x02      | 32-byte block + data CRC                                     |
//! | 0x03      | data CRC of the received block                               |
//! | 0x13      | three 16-bit scan codes + status byte                        |
//! | other     | nothing                                                      |
//!
//! A timed-out receive is abandoned silently; the console retries.

use std::sync::atomic::Ordering;

use crate::crc::{address_crc_ok, data_crc};
use crate::line::{Command, LineError, LinePin, ProtocolFrame, Serializer, TickSource, Transceiver};
use crate::pak::AccessoryStore;
use crate::state::{DeviceKind, Report, SharedState};
use crate::BLOCK_SIZE;

/// Reserved address answered with the accessory identity pattern.
pub const PROBE_ADDRESS: u16 = 0x8000;
/// Reserved address whose first payload byte drives the rumble motor.
pub const MOTOR_ADDRESS: u16 = 0xC000;
/// Identity pattern byte of a rumble pak.
pub const RUMBLE_PATTERN: u8 = 0x80;

pub const TYPE_CONTROLLER: u16 = 0x0500;
pub const TYPE_MOUSE: u16 = 0x0200;
pub const TYPE_KEYBOARD: u16 = 0x0002;
/// Status byte: accessory slot occupied.
pub const STATUS_ACCESSORY_PRESENT: u8 = 0x01;

/// The wire half of the dispatcher: receive a command, send a reply.
pub trait JoybusLink {
    fn receive_command(&mut self) -> Result<Command, LineError>;
    fn transmit(&mut self, frame: &ProtocolFrame);
}

impl<P: LinePin, T: TickSource, S: Serializer> JoybusLink for Transceiver<P, T, S> {
    fn receive_command(&mut self) -> Result<Command, LineError> {
        Transceiver::receive_command(self)
    }

    fn transmit(&mut self, frame: &ProtocolFrame) {
        Transceiver::transmit(self, frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    ReceivingCommand,
    Responding,
    AbortedTimeout,
    Ignored,
}

/// How a transaction ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Responded { opcode: u8 },
    AbortedTimeout { bits: u32 },
    Ignored { opcode: u8 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub responded: u64,
    pub timeouts: u64,
    pub ignored: u64,
}

pub struct Dispatcher {
    state: DispatchState,
    pub stats: DispatchStats,
}

impl Dispatcher {
    pub fn new() -> Self {
        Dispatcher { state: DispatchState::Idle, stats: DispatchStats::default() }
    }

    pub fn state(&self) -> DispatchState {
        self.state
    }

    /// Run one transaction. Call on the falling edge that starts it.
    pub fn service<L: JoybusLink>(
        &mut self,
        link: &mut L,
        shared: &SharedState,
        store: &mut AccessoryStore,
    ) -> Outcome {
        shared.link.transaction_active.store(true, Ordering::SeqCst);
        self.state = DispatchState::ReceivingCommand;

        let outcome = match link.receive_command() {
            Err(LineError::ReceiveTimeout { bits }) => {
                self.state = DispatchState::AbortedTimeout;
                self.stats.timeouts += 1;
                log::warn!("receive timeout after {} bits, transaction dropped", bits);
                Outcome::AbortedTimeout { bits }
            }
            Ok(cmd) => match respond(&cmd, shared, store) {
                Some(frame) => {
                    self.state = DispatchState::Responding;
                    link.transmit(&frame);
                    after_reply(&cmd, shared);
                    self.stats.responded += 1;
                    log::trace!("cmd {:02X}: {} bits out", cmd.opcode(), frame.bit_len());
                    Outcome::Responded { opcode: cmd.opcode() }
                }
                None => {
                    self.state = DispatchState::Ignored;
                    self.stats.ignored += 1;
                    if let Command::Unknown { opcode } = cmd {
                        log::warn!("unknown command {:02X}", opcode);
                    }
                    Outcome::Ignored { opcode: cmd.opcode() }
                }
            },
        };

        self.state = DispatchState::Idle;
        shared.link.transaction_active.store(false, Ordering::SeqCst);
        outcome
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Apply a command's side effects and build its reply, if it has one.
fn respond(cmd: &Command, shared: &SharedState, store: &mut AccessoryStore) -> Option<ProtocolFrame> {
    let device = shared.controller.device();
    match *cmd {
        Command::Info { .. } => Some(identify_frame(device)),
        Command::Poll => {
            if device == DeviceKind::Keyboard {
                return None;
            }
            Some(poll_frame(shared.controller.load()))
        }
        Command::ReadBlock { address } => {
            check_address(address);
            let block = read_accessory(address, shared, store);
            Some(block_frame(&block))
        }
        Command::WriteBlock { address, ref data } => {
            check_address(address);
            write_accessory(address, data, shared, store);
            Some(crc_frame(data_crc(data)))
        }
        Command::KeyboardStatus { leds } => {
            shared.keyboard.set_led_status(leds);
            Some(keyboard_frame(shared.keyboard.keys(), shared.keyboard.status_byte()))
        }
        Command::Unknown { .. } => None,
    }
}

/// Work that must wait until the reply is on the wire.
fn after_reply(cmd: &Command, shared: &SharedState) {
    if *cmd == Command::Poll && shared.controller.device() == DeviceKind::Mouse {
        shared.controller.reset_stick();
    }
}

fn check_address(address: u16) {
    if !address_crc_ok(address) {
        log::warn!("address {:04X} fails CRC5, serving anyway", address);
    }
}

fn read_accessory(address: u16, shared: &SharedState, store: &AccessoryStore) -> [u8; BLOCK_SIZE] {
    let block = AccessoryStore::align(address);
    if AccessoryStore::is_storage(block) {
        store.read_block(block)
    } else if block == PROBE_ADDRESS && shared.rumble.rumble_pak() {
        [RUMBLE_PATTERN; BLOCK_SIZE]
    } else {
        [0u8; BLOCK_SIZE]
    }
}

fn write_accessory(address: u16, data: &[u8; BLOCK_SIZE], shared: &SharedState, store: &mut AccessoryStore) {
    let block = AccessoryStore::align(address);
    if AccessoryStore::is_storage(block) {
        store.write_block(block, data);
    } else if block == MOTOR_ADDRESS && shared.rumble.rumble_pak() {
        let on = data[0] != 0;
        if on != shared.rumble.motor() {
            log::debug!("rumble motor {}", if on { "on" } else { "off" });
        }
        shared.rumble.set_motor(on);
    }
}

// ─── Reply frames ───────────────────────────────────────────────────────────

pub fn identify_frame(device: DeviceKind) -> ProtocolFrame {
    let kind = match device {
        DeviceKind::Mouse => TYPE_MOUSE,
        DeviceKind::Keyboard => TYPE_KEYBOARD,
        _ => TYPE_CONTROLLER,
    };
    let mut frame = ProtocolFrame::new();
    frame.push16(kind);
    frame.push8(STATUS_ACCESSORY_PRESENT);
    frame
}

pub fn poll_frame(report: Report) -> ProtocolFrame {
    let [hi, lo] = report.buttons.to_bytes();
    let mut frame = ProtocolFrame::new();
    frame.push_bytes(&[hi, lo, report.stick_x as u8, report.stick_y as u8]);
    frame
}

pub fn block_frame(block: &[u8; BLOCK_SIZE]) -> ProtocolFrame {
    let mut frame = ProtocolFrame::new();
    frame.push_bytes(block);
    frame.push8(data_crc(block));
    frame
}

pub fn crc_frame(crc: u8) -> ProtocolFrame {
    let mut frame = ProtocolFrame::new();
    frame.push8(crc);
    frame
}

pub fn keyboard_frame(keys: [u16; 3], status: u8) -> ProtocolFrame {
    let mut frame = ProtocolFrame::new();
    for key in keys {
        frame.push16(key);
    }
    frame.push8(status);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::address_crc;
    use crate::state::Buttons;

    /// Link double: hands out scripted commands, keeps what was sent.
    struct ScriptLink {
        commands: Vec<Result<Command, LineError>>,
        sent: Vec<Vec<u8>>,
    }

    impl ScriptLink {
        fn new(commands: Vec<Result<Command, LineError>>) -> Self {
            let mut commands = commands;
            commands.reverse();
            ScriptLink { commands, sent: Vec::new() }
        }
    }

    impl JoybusLink for ScriptLink {
        fn receive_command(&mut self) -> Result<Command, LineError> {
            self.commands.pop().unwrap_or(Err(LineError::ReceiveTimeout { bits: 0 }))
        }

        fn transmit(&mut self, frame: &ProtocolFrame) {
            let mut bytes = Vec::new();
            for seg in frame.segments() {
                if seg.bits == 16 {
                    bytes.extend_from_slice(&seg.value.to_be_bytes());
                } else {
                    bytes.push(seg.value as u8);
                }
            }
            self.sent.push(bytes);
        }
    }

    fn run(shared: &SharedState, store: &mut AccessoryStore, cmd: Command) -> (Outcome, Vec<Vec<u8>>) {
        let mut link = ScriptLink::new(vec![Ok(cmd)]);
        let mut d = Dispatcher::new();
        let outcome = d.service(&mut link, shared, store);
        assert_eq!(d.state(), DispatchState::Idle);
        (outcome, link.sent)
    }

    #[test]
    fn test_identify_per_device() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        for (kind, expect) in [
            (DeviceKind::None, [0x05, 0x00, 0x01]),
            (DeviceKind::Xpad, [0x05, 0x00, 0x01]),
            (DeviceKind::Mouse, [0x02, 0x00, 0x01]),
            (DeviceKind::Keyboard, [0x00, 0x02, 0x01]),
        ] {
            shared.controller.set_device(kind);
            for opcode in [0x00, 0xFF] {
                let (outcome, sent) = run(&shared, &mut store, Command::Info { opcode });
                assert_eq!(outcome, Outcome::Responded { opcode });
                assert_eq!(sent, vec![expect.to_vec()]);
            }
        }
    }

    #[test]
    fn test_poll_frame_bytes() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        shared.controller.set_device(DeviceKind::Xpad);
        shared.controller.store(Report { buttons: Buttons::A, stick_x: 5, stick_y: -5 });
        let (_, sent) = run(&shared, &mut store, Command::Poll);
        assert_eq!(sent, vec![vec![0x80, 0x00, 0x05, 0xFB]]);
        // Not a mouse: stick survives the poll
        assert_eq!(shared.controller.load().stick_x, 5);
    }

    #[test]
    fn test_mouse_poll_consumes_delta() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        shared.controller.set_device(DeviceKind::Mouse);
        shared.controller.store(Report { buttons: Buttons::B, stick_x: 12, stick_y: -3 });
        let (_, sent) = run(&shared, &mut store, Command::Poll);
        assert_eq!(sent, vec![vec![0x40, 0x00, 12, 0xFD]]);
        assert_eq!(shared.controller.load(), Report { buttons: Buttons::B, stick_x: 0, stick_y: 0 });
    }

    #[test]
    fn test_keyboard_ignores_poll() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        shared.controller.set_device(DeviceKind::Keyboard);
        let (outcome, sent) = run(&shared, &mut store, Command::Poll);
        assert_eq!(outcome, Outcome::Ignored { opcode: 0x01 });
        assert!(sent.is_empty());
    }

    #[test]
    fn test_keyboard_status_exchange() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        shared.controller.set_device(DeviceKind::Keyboard);
        shared.keyboard.update([0x0102, 0x0304, 0x0506], true, true);
        let (_, sent) = run(&shared, &mut store, Command::KeyboardStatus { leds: 0x03 });
        assert_eq!(sent, vec![vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x11]]);
        assert_eq!(shared.keyboard.led_status(), 0x03);
    }

    #[test]
    fn test_block_write_then_read() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        let data = [0x3C; BLOCK_SIZE];
        let address = address_crc(0x0240);
        let (_, sent) = run(&shared, &mut store, Command::WriteBlock { address, data });
        assert_eq!(sent, vec![vec![data_crc(&data)]]);
        assert!(store.is_dirty());

        let (_, sent) = run(&shared, &mut store, Command::ReadBlock { address });
        let mut expect = data.to_vec();
        expect.push(data_crc(&data));
        assert_eq!(sent, vec![expect]);
    }

    #[test]
    fn test_probe_pattern_follows_accessory_mode() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        let (_, sent) = run(&shared, &mut store, Command::ReadBlock { address: 0x8001 });
        assert_eq!(&sent[0][..BLOCK_SIZE], &[0u8; BLOCK_SIZE]);
        assert_eq!(sent[0][BLOCK_SIZE], 0x00);

        shared.rumble.set_rumble_pak(true);
        let (_, sent) = run(&shared, &mut store, Command::ReadBlock { address: 0x8001 });
        assert_eq!(&sent[0][..BLOCK_SIZE], &[0x80u8; BLOCK_SIZE]);
        assert_eq!(sent[0][BLOCK_SIZE], 0xB8);
    }

    #[test]
    fn test_motor_write_sets_not_toggles() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        shared.rumble.set_rumble_pak(true);
        for (first, expect) in [(0x01, true), (0x01, true), (0x00, false), (0x00, false), (0xFF, true)] {
            let mut data = [0u8; BLOCK_SIZE];
            data[0] = first;
            run(&shared, &mut store, Command::WriteBlock { address: 0xC01B, data });
            assert_eq!(shared.rumble.motor(), expect);
        }
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_motor_write_ignored_without_rumble_pak() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        let data = [0x01; BLOCK_SIZE];
        let (outcome, sent) = run(&shared, &mut store, Command::WriteBlock { address: 0xC01B, data });
        assert_eq!(outcome, Outcome::Responded { opcode: 0x03 });
        assert_eq!(sent, vec![vec![data_crc(&data)]]);
        assert!(!shared.rumble.motor());
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_unknown_and_timeout() {
        let shared = SharedState::new();
        let mut store = AccessoryStore::new();
        let mut link = ScriptLink::new(vec![
            Ok(Command::Unknown { opcode: 0x42 }),
            Err(LineError::ReceiveTimeout { bits: 12 }),
        ]);
        let mut d = Dispatcher::new();
        assert_eq!(d.service(&mut link, &shared, &mut store), Outcome::Ignored { opcode: 0x42 });
        assert_eq!(d.service(&mut link, &shared, &mut store), Outcome::AbortedTimeout { bits: 12 });
        assert!(link.sent.is_empty());
        assert_eq!(d.stats, DispatchStats { responded: 0, timeouts: 1, ignored: 1 });
        assert_eq!(d.state(), DispatchState::Idle);
        assert!(!shared.link.transaction_active.load(Ordering::SeqCst));
    }
}
