//! joybus-sim: runs the device off-target.
//!
//! Two threads, the same split as on the board:
//!
//! - **Companion**: reads a real gamepad through gilrs (or synthesizes one
//!   with `--headless`), feeds Xbox-style reports through the pad adapter,
//!   blinks the status "LED" into the log, and passes the flush checkpoint.
//! - **Protocol** (main thread): a scripted console on a virtual line:
//!   identify, probe the accessory, poll every frame, and now and then save
//!   a block to the controller pak. Between frames the idle loop flushes the
//!   pak to a file-backed flash region.
//!
//! `RUST_LOG=debug` shows adapter and flush activity, `trace` every
//! transaction.

use std::env;
use std::error::Error;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use gilrs::{Axis, Button as GilrsButton, Event as GilrsEvent, EventType, Gilrs};
use log::{debug, error, info, warn};

use joybus_core::adapter::{self, DeviceAdapter, StatusIndicator, XpadAdapter, XpadInput};
use joybus_core::crc::{address_crc, data_crc};
use joybus_core::flash::FileFlash;
use joybus_core::savestate::{self, DeviceState};
use joybus_core::sim::{CaptureLog, CaptureSerializer, VirtualClock, VirtualLine, VirtualPin, VirtualTicks};
use joybus_core::sync::{rendezvous, ChannelFifo, CompanionEnd, CountingIrq};
use joybus_core::{Config, Device, LineTiming, Outcome, Persistence, SharedState, Transceiver, BLOCK_SIZE, PAK_SIZE};

type SimDevice = Device<Transceiver<VirtualPin, VirtualTicks, CaptureSerializer>, FileFlash, CountingIrq, ChannelFifo>;

/// Console frame period when pacing to real time.
const FRAME: Duration = Duration::from_micros(16_667);
/// Frames between pak saves in the console script.
const SAVE_EVERY: u64 = 120;
/// Frames between motor toggles while a rumble pak is inserted.
const RUMBLE_EVERY: u64 = 30;
/// Upper bound for `--ticks-per-us`: a 1 GHz tick.
const MAX_TICKS_PER_US: u32 = 1000;

struct Options {
    config: Config,
    flash: PathBuf,
    state: Option<PathBuf>,
    frames: u64,
    rumble: bool,
    headless: bool,
}

fn usage(program: &str) {
    eprintln!("joybus-sim - N64 controller-port device on a virtual line");
    eprintln!("Usage: {} [options]", program);
    eprintln!();
    eprintln!("Options:");
    eprintln!("  --flash <file>       Pak flash region file (default joybus-pak.bin)");
    eprintln!("  --state <file>       Import save state at start, export at exit");
    eprintln!("  --frames N           Console frames to run (default 600)");
    eprintln!("  --ticks-per-us N     Line timing calibration, 1..={} (default 197)", MAX_TICKS_PER_US);
    eprintln!("  --rumble             Start with the rumble pak inserted");
    eprintln!("  --headless           Synthetic pad input, no real-time pacing");
    eprintln!();
    eprintln!("Pad: guide button swaps controller pak / rumble pak");
}

fn parse_args(args: &[String]) -> Option<Options> {
    if args.iter().any(|a| a == "--help" || a == "-h") {
        return None;
    }
    let value = |flag: &str| args.iter().position(|a| a == flag).and_then(|i| args.get(i + 1));

    let mut config = Config::default();
    if let Some(arg) = value("--ticks-per-us") {
        match arg.parse::<u32>() {
            Ok(tpu) if (1..=MAX_TICKS_PER_US).contains(&tpu) => {
                config.timing = LineTiming { ticks_per_us: tpu, ..config.timing };
            }
            _ => {
                eprintln!("--ticks-per-us must be 1..={}, got {}", MAX_TICKS_PER_US, arg);
                return None;
            }
        }
    }
    Some(Options {
        config,
        flash: value("--flash").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("joybus-pak.bin")),
        state: value("--state").map(PathBuf::from),
        frames: value("--frames").and_then(|s| s.parse().ok()).unwrap_or(600),
        rumble: args.iter().any(|a| a == "--rumble"),
        headless: args.iter().any(|a| a == "--headless"),
    })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = env::args().collect();
    let Some(opts) = parse_args(&args) else {
        usage(&args[0]);
        return;
    };
    if let Err(e) = run(opts) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run(opts: Options) -> Result<(), Box<dyn Error>> {
    let shared = Arc::new(SharedState::new());
    shared.rumble.set_rumble_pak(opts.rumble);

    let (protocol_end, companion_end) = rendezvous(shared.clone(), CountingIrq::default());
    let flash = FileFlash::open(&opts.flash, opts.config.layout)?;
    let persistence = Persistence::new(flash, opts.config.layout, CountingIrq::default(), protocol_end);

    let clock = VirtualClock::new();
    let tpu = opts.config.timing.ticks_per_us;
    let line = VirtualLine::new(clock.clone(), tpu);
    let serializer = CaptureSerializer::new(clock, tpu);
    let log = serializer.log();
    let xcvr = Transceiver::new(line.pin(), line.ticks(), serializer, opts.config.timing);
    let mut device = Device::boot(shared.clone(), xcvr, persistence)?;

    if let Some(path) = opts.state.as_deref().filter(|p| p.exists()) {
        let state = savestate::load_from_file(path)?;
        if state.config != opts.config {
            warn!("save state was taken with {:?}", state.config);
        }
        state.restore(&shared, &mut device.store)?;
    }

    let stop = Arc::new(AtomicBool::new(false));
    let companion = {
        let shared = shared.clone();
        let stop = stop.clone();
        let headless = opts.headless;
        thread::Builder::new()
            .name("companion".into())
            .spawn(move || companion_loop(companion_end, &shared, &stop, headless))?
    };

    let mut console = Console { line, log, device: &mut device };
    console.play(opts.frames, !opts.headless);

    // Last flush needs the companion alive to park it
    let flushed = device.tick();
    stop.store(true, Ordering::SeqCst);
    if companion.join().is_err() {
        error!("companion thread panicked");
    }
    flushed?;

    if let Some(path) = &opts.state {
        let state = DeviceState::capture(&shared, &device.store, opts.config);
        savestate::save_to_file(&state, path)?;
    }
    info!(
        "done: {} transactions, {} timeouts, {} flushes",
        device.dispatcher.stats.responded,
        device.dispatcher.stats.timeouts,
        device.persistence.flush_count
    );
    Ok(())
}

// ─── Console script ─────────────────────────────────────────────────────────

struct Console<'a> {
    line: VirtualLine,
    log: CaptureLog,
    device: &'a mut SimDevice,
}

impl Console<'_> {
    fn exchange(&mut self, msg: &[u8]) -> Option<Vec<u8>> {
        let before = self.log.borrow().len();
        self.line.console_send(msg, 20);
        self.line.advance_to_next_edge();
        let outcome = self.device.poll();
        self.line.clear();
        match outcome {
            Some(Outcome::Responded { .. }) => self.log.borrow().get(before).map(|f| f.bytes()),
            _ => None,
        }
    }

    fn read_block(&mut self, addr: u16) -> Option<Vec<u8>> {
        let a = address_crc(addr).to_be_bytes();
        let reply = self.exchange(&[0x02, a[0], a[1]])?;
        if reply.len() != BLOCK_SIZE + 1 {
            return None;
        }
        let (data, crc) = reply.split_at(BLOCK_SIZE);
        let block: &[u8; BLOCK_SIZE] = data.try_into().ok()?;
        if crc != [data_crc(block)] {
            warn!("console: bad data CRC on read of {:04X}", addr);
            return None;
        }
        Some(data.to_vec())
    }

    fn write_block(&mut self, addr: u16, data: &[u8; BLOCK_SIZE]) -> bool {
        let a = address_crc(addr).to_be_bytes();
        let mut msg = vec![0x03, a[0], a[1]];
        msg.extend_from_slice(data);
        self.exchange(&msg) == Some(vec![data_crc(data)])
    }

    fn play(&mut self, frames: u64, realtime: bool) {
        match self.exchange(&[0xFF]) {
            Some(id) => info!("console: device identifies as {:02X?}", id),
            None => warn!("console: no answer to identify"),
        }
        let mut rumble_seen = self.probe_rumble();
        let mut motor = false;
        let start = Instant::now();

        for frame in 0..frames {
            if let Some(report) = self.exchange(&[0x01]) {
                debug!("frame {}: {:02X?}", frame, report);
            }

            // Console re-probes now and then; the user may have swapped paks
            if frame % 60 == 59 {
                rumble_seen = self.probe_rumble();
            }

            if rumble_seen && frame % RUMBLE_EVERY == 0 {
                motor = !motor;
                let fill = if motor { 0x01 } else { 0x00 };
                self.write_block(0xC000, &[fill; BLOCK_SIZE]);
            } else if !rumble_seen && frame % SAVE_EVERY == SAVE_EVERY - 1 {
                self.save_slot(frame);
            }

            if let Err(e) = self.device.tick() {
                error!("flush failed: {}", e);
            }

            if realtime {
                let due = FRAME * (frame as u32 + 1);
                if let Some(wait) = due.checked_sub(start.elapsed()) {
                    thread::sleep(wait);
                }
            }
        }
    }

    fn probe_rumble(&mut self) -> bool {
        let seen = self.read_block(0x8000).map_or(false, |b| b.iter().all(|&x| x == 0x80));
        debug!("console: accessory probe says {}", if seen { "rumble pak" } else { "controller pak" });
        seen
    }

    /// Game save: one block, read back to check.
    fn save_slot(&mut self, frame: u64) {
        let slot = (frame / SAVE_EVERY) as usize % (PAK_SIZE / BLOCK_SIZE);
        let addr = (slot * BLOCK_SIZE) as u16;
        let data: [u8; BLOCK_SIZE] = std::array::from_fn(|i| (frame as u8).wrapping_add(i as u8));
        if !self.write_block(addr, &data) {
            warn!("console: write to {:04X} not acknowledged", addr);
            return;
        }
        match self.read_block(addr) {
            Some(back) if back[..] == data[..] => info!("console: saved slot {} at {:04X}", slot, addr),
            _ => warn!("console: slot {} read back wrong", slot),
        }
    }
}

// ─── Companion ──────────────────────────────────────────────────────────────

const PAD_ADDRESS: u8 = 1;

fn companion_loop(mut end: CompanionEnd<ChannelFifo, CountingIrq>, shared: &SharedState, stop: &AtomicBool, headless: bool) {
    let mut gilrs = if headless { None } else { init_gamepad() };
    let mut pad = XpadAdapter::new();
    let mut input = XpadInput::default();
    let mut mounted = false;
    let mut led = StatusIndicator::new(0);
    let start = Instant::now();

    if headless {
        pad.on_device_mounted(PAD_ADDRESS, shared);
        mounted = true;
    }

    while !stop.load(Ordering::SeqCst) {
        let now_ms = start.elapsed().as_millis() as u64;

        let changed = match gilrs.as_mut() {
            Some(g) => poll_gamepad(g, &mut input, &mut mounted, &mut pad, shared),
            None if headless => {
                input = synthetic_input(now_ms);
                true
            }
            None => false,
        };
        if mounted && changed {
            if let Err(e) = pad.on_report(&input.to_bytes(), shared) {
                warn!("pad report: {}", e);
            }
        }
        if let Some(on) = pad.motor_command(shared) {
            info!("vibration {}", if on { "on" } else { "off" });
        }
        if let Some(level) = led.tick(now_ms, shared) {
            debug!("status LED {}", if level { "on" } else { "off" });
        }

        if let Err(e) = end.checkpoint() {
            error!("rendezvous: {}", e);
            return;
        }
        thread::sleep(Duration::from_millis(1));
    }
}

/// Slow stick circle with A pressed every other second.
fn synthetic_input(now_ms: u64) -> XpadInput {
    let t = now_ms as f32 / 1000.0;
    XpadInput {
        buttons: if (now_ms / 1000) % 2 == 1 { adapter::XPAD_A } else { 0 },
        lx: (t.cos() * 20000.0) as i16,
        ly: (t.sin() * 20000.0) as i16,
        ..Default::default()
    }
}

fn init_gamepad() -> Option<Gilrs> {
    match Gilrs::new() {
        Ok(gilrs) => {
            let mut found = false;
            for (id, gp) in gilrs.gamepads() {
                info!("gamepad [{}] \"{}\" ({})", id, gp.name(), gp.os_name());
                found = true;
            }
            if !found {
                info!("no gamepad yet (hot-plug supported)");
            }
            Some(gilrs)
        }
        Err(e) => {
            warn!("gamepad: {}", e);
            None
        }
    }
}

/// Drain gilrs events into `input`. Returns whether anything changed.
fn poll_gamepad(
    gilrs: &mut Gilrs,
    input: &mut XpadInput,
    mounted: &mut bool,
    pad: &mut XpadAdapter,
    shared: &SharedState,
) -> bool {
    let mut changed = false;
    while let Some(GilrsEvent { id, event, .. }) = gilrs.next_event() {
        let address = usize::from(id) as u8 + PAD_ADDRESS;
        match event {
            EventType::Connected => {
                *input = XpadInput::default();
                pad.on_device_mounted(address, shared);
                *mounted = true;
            }
            EventType::Disconnected => {
                adapter::unmount(address, shared);
                *mounted = false;
            }
            EventType::ButtonPressed(b, _) => changed |= apply_button(input, b, true),
            EventType::ButtonReleased(b, _) => changed |= apply_button(input, b, false),
            EventType::ButtonChanged(GilrsButton::LeftTrigger2, v, _) => {
                input.lt = (v * 255.0) as u8;
                changed = true;
            }
            EventType::ButtonChanged(GilrsButton::RightTrigger2, v, _) => {
                input.rt = (v * 255.0) as u8;
                changed = true;
            }
            EventType::AxisChanged(a, v, _) => changed |= apply_axis(input, a, v),
            _ => {}
        }
    }
    // A pad present at startup never sends Connected
    if !*mounted && gilrs.gamepads().next().is_some() {
        pad.on_device_mounted(PAD_ADDRESS, shared);
        *mounted = true;
    }
    changed
}

fn apply_button(input: &mut XpadInput, btn: GilrsButton, pressed: bool) -> bool {
    let mask = match btn {
        GilrsButton::DPadUp => adapter::XPAD_DPAD_UP,
        GilrsButton::DPadDown => adapter::XPAD_DPAD_DOWN,
        GilrsButton::DPadLeft => adapter::XPAD_DPAD_LEFT,
        GilrsButton::DPadRight => adapter::XPAD_DPAD_RIGHT,
        GilrsButton::Start => adapter::XPAD_START,
        GilrsButton::Select => adapter::XPAD_BACK,
        GilrsButton::LeftTrigger => adapter::XPAD_LB,
        GilrsButton::RightTrigger => adapter::XPAD_RB,
        GilrsButton::Mode => adapter::XPAD_GUIDE,
        GilrsButton::South => adapter::XPAD_A,
        GilrsButton::East => adapter::XPAD_B,
        GilrsButton::West => adapter::XPAD_X,
        GilrsButton::North => adapter::XPAD_Y,
        _ => return false,
    };
    if pressed {
        input.buttons |= mask;
    } else {
        input.buttons &= !mask;
    }
    true
}

fn apply_axis(input: &mut XpadInput, axis: Axis, value: f32) -> bool {
    let raw = (value.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
    match axis {
        Axis::LeftStickX => input.lx = raw,
        Axis::LeftStickY => input.ly = raw,
        Axis::RightStickX => input.rx = raw,
        Axis::RightStickY => input.ry = raw,
        _ => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("joybus-sim").chain(list.iter().copied()).map(String::from).collect()
    }

    #[test]
    fn test_parse_defaults() {
        let opts = parse_args(&args(&[])).unwrap();
        assert_eq!(opts.config, Config::default());
        assert_eq!(opts.frames, 600);
        assert_eq!(opts.flash, PathBuf::from("joybus-pak.bin"));
        assert!(opts.state.is_none());
        assert!(!opts.rumble && !opts.headless);
    }

    #[test]
    fn test_parse_flags() {
        let opts = parse_args(&args(&[
            "--ticks-per-us", "125", "--frames", "10", "--flash", "p.bin", "--state", "s.n64a", "--rumble", "--headless",
        ]))
        .unwrap();
        assert_eq!(opts.config.timing.ticks_per_us, 125);
        assert_eq!(opts.config.timing.edge_timeout, LineTiming::default().edge_timeout);
        assert_eq!(opts.frames, 10);
        assert_eq!(opts.flash, PathBuf::from("p.bin"));
        assert_eq!(opts.state, Some(PathBuf::from("s.n64a")));
        assert!(opts.rumble && opts.headless);
        assert!(parse_args(&args(&["--help"])).is_none());
    }

    #[test]
    fn test_parse_rejects_bad_tick_rate() {
        assert!(parse_args(&args(&["--ticks-per-us", "0"])).is_none());
        assert!(parse_args(&args(&["--ticks-per-us", "1001"])).is_none());
        assert!(parse_args(&args(&["--ticks-per-us", "4294967295"])).is_none());
        assert!(parse_args(&args(&["--ticks-per-us", "fast"])).is_none());
        let opts = parse_args(&args(&["--ticks-per-us", "1000"])).unwrap();
        assert_eq!(opts.config.timing.ticks_per_us, MAX_TICKS_PER_US);
    }

    #[test]
    fn test_gilrs_mapping() {
        let mut input = XpadInput::default();
        assert!(apply_button(&mut input, GilrsButton::Mode, true));
        assert!(apply_button(&mut input, GilrsButton::South, true));
        assert_eq!(input.buttons, adapter::XPAD_GUIDE | adapter::XPAD_A);
        apply_button(&mut input, GilrsButton::Mode, false);
        assert_eq!(input.buttons, adapter::XPAD_A);
        assert!(!apply_button(&mut input, GilrsButton::C, true));

        assert!(apply_axis(&mut input, Axis::LeftStickX, 1.0));
        assert_eq!(input.lx, i16::MAX);
        assert!(!apply_axis(&mut input, Axis::LeftZ, 1.0));
    }
}
