//! Save states: a portable copy of the device image.
//!
//! Carries a memory pak (plus accessory mode and a few registers) between
//! runs or hosts. This is separate from the durable flash region, which stays
//! a raw headerless 32 KiB image.
//!
//! ## File format
//!
//! ```text
//! +------------------+
//! | Magic "N64A"     |  4 bytes
//! +------------------+
//! | Format version   |  u32 little-endian (currently 1)
//! +------------------+
//! | Compressed data  |  deflate-compressed bincode payload
//! +------------------+
//! ```

use std::path::Path;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pak::AccessoryStore;
use crate::state::{DeviceKind, SharedState};
use crate::{Config, PAK_SIZE};

/// Magic bytes identifying a save state file.
const MAGIC: &[u8; 4] = b"N64A";
/// Current save state format version.
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("file too small")]
    TooSmall,
    #[error("not a save state (bad magic)")]
    BadMagic,
    #[error("unsupported save state version {found} (expected {expected})", expected = FORMAT_VERSION)]
    Version { found: u32 },
    #[error("pak image is {0} bytes, expected {expected}", expected = PAK_SIZE)]
    ImageSize(usize),
    #[error("decompress error: {0}")]
    Inflate(String),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything a save state holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceState {
    pub pak: Vec<u8>,
    pub rumble_pak: bool,
    pub device: DeviceKind,
    pub led_status: u8,
    pub config: Config,
}

impl DeviceState {
    pub fn capture(shared: &SharedState, store: &AccessoryStore, config: Config) -> Self {
        DeviceState {
            pak: store.image().to_vec(),
            rumble_pak: shared.rumble.rumble_pak(),
            device: shared.controller.device(),
            led_status: shared.keyboard.led_status(),
            config,
        }
    }

    /// Apply to a running device. The pak image replaces the store contents
    /// and leaves it dirty. The active device is not touched: that belongs to
    /// whatever is plugged in now.
    pub fn restore(&self, shared: &SharedState, store: &mut AccessoryStore) -> Result<(), StateError> {
        let image: &[u8; PAK_SIZE] = self.pak.as_slice().try_into().map_err(|_| StateError::ImageSize(self.pak.len()))?;
        store.replace_image(image);
        shared.rumble.set_rumble_pak(self.rumble_pak);
        shared.keyboard.set_led_status(self.led_status);
        Ok(())
    }
}

// ─── Encoding ───────────────────────────────────────────────────────────────

pub fn encode(state: &DeviceState) -> Result<Vec<u8>, StateError> {
    let payload = bincode::serialize(state)?;
    let compressed = miniz_oxide::deflate::compress_to_vec(&payload, 6);

    let mut out = Vec::with_capacity(HEADER_LEN + compressed.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(out)
}

pub fn decode(data: &[u8]) -> Result<DeviceState, StateError> {
    if data.len() < HEADER_LEN {
        return Err(StateError::TooSmall);
    }
    if &data[0..4] != MAGIC {
        return Err(StateError::BadMagic);
    }
    let version = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if version != FORMAT_VERSION {
        return Err(StateError::Version { found: version });
    }

    let decompressed = miniz_oxide::inflate::decompress_to_vec(&data[HEADER_LEN..])
        .map_err(|e| StateError::Inflate(format!("{:?}", e)))?;
    let state: DeviceState = bincode::deserialize(&decompressed)?;
    if state.pak.len() != PAK_SIZE {
        return Err(StateError::ImageSize(state.pak.len()));
    }
    Ok(state)
}

// ─── File I/O ───────────────────────────────────────────────────────────────

pub fn save_to_file(state: &DeviceState, path: &Path) -> Result<(), StateError> {
    std::fs::write(path, encode(state)?)?;
    info!("saved state to {}", path.display());
    Ok(())
}

pub fn load_from_file(path: &Path) -> Result<DeviceState, StateError> {
    let state = decode(&std::fs::read(path)?)?;
    info!("loaded state from {}", path.display());
    Ok(state)
}
