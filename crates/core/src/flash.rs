//! Durable mirror of the controller pak.
//!
//! The pak image lives in one raw, headerless region at a fixed offset near
//! the end of the program flash:
//!
//! ```text
//! 0x000000 ┌──────────────────────────┐
//!          │ firmware                 │
//! 0x1F8000 ├──────────────────────────┤  FlashLayout::offset
//!          │ pak image (32 KiB, raw)  │  FlashLayout::size
//! 0x200000 └──────────────────────────┘
//! ```
//!
//! Writing it takes milliseconds, far longer than the console will wait for a
//! reply, so a flush only runs from the idle loop and only after the companion
//! context has been parked (see [`crate::sync`]). The image is loaded at boot
//! with no integrity check.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pak::AccessoryStore;
use crate::sync::{Fifo, InterruptControl, ProtocolEnd, SyncError};
use crate::PAK_SIZE;

/// Total size of the program flash chip.
pub const FLASH_CHIP_SIZE: u32 = 2 * 1024 * 1024;
/// Erase granularity.
pub const SECTOR_SIZE: u32 = 4096;
/// Program granularity.
pub const PAGE_SIZE: u32 = 256;

#[derive(Debug, Error)]
pub enum FlashError {
    #[error("flash access {offset:#x}+{len:#x} outside region")]
    OutOfRange { offset: u32, len: u32 },
    #[error("flash offset {offset:#x} not aligned to {align:#x}")]
    Misaligned { offset: u32, align: u32 },
    #[error("pak region is {size:#x} bytes, expected {expected:#x}", expected = PAK_SIZE)]
    RegionSize { size: u32 },
    #[error("flash backing file")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum FlushError {
    #[error("flush aborted: flash")]
    Flash(#[from] FlashError),
    #[error("flush aborted: rendezvous")]
    Sync(#[from] SyncError),
}

/// Where the pak image sits in flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashLayout {
    pub offset: u32,
    pub size: u32,
}

impl Default for FlashLayout {
    fn default() -> Self {
        FlashLayout { offset: FLASH_CHIP_SIZE - PAK_SIZE as u32, size: PAK_SIZE as u32 }
    }
}

impl FlashLayout {
    /// The region must hold exactly one pak image.
    pub fn validate(&self) -> Result<(), FlashError> {
        if self.size as usize != PAK_SIZE {
            return Err(FlashError::RegionSize { size: self.size });
        }
        Ok(())
    }

    fn check(&self, offset: u32, len: u32) -> Result<(), FlashError> {
        let end = offset as u64 + len as u64;
        if offset < self.offset || end > self.offset as u64 + self.size as u64 {
            return Err(FlashError::OutOfRange { offset, len });
        }
        Ok(())
    }
}

/// NOR flash as seen by the persistence layer. Offsets are absolute.
pub trait FlashRegion {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError>;
    /// Erase whole sectors to 0xFF. `offset` and `len` must be sector aligned.
    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError>;
    /// Program bytes. Programming can only clear bits; erase first.
    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError>;
}

fn check_sector_aligned(offset: u32, len: u32) -> Result<(), FlashError> {
    if offset % SECTOR_SIZE != 0 || len % SECTOR_SIZE != 0 {
        return Err(FlashError::Misaligned { offset, align: SECTOR_SIZE });
    }
    Ok(())
}

// ─── RAM-backed chip ────────────────────────────────────────────────────────

/// Whole flash chip held in memory.
pub struct RamFlash {
    pub data: Vec<u8>,
    pub erase_count: u32,
    pub program_count: u32,
}

impl RamFlash {
    /// Erased chip of `size` bytes.
    pub fn new(size: u32) -> Self {
        RamFlash { data: vec![0xFF; size as usize], erase_count: 0, program_count: 0 }
    }

    fn range(&self, offset: u32, len: usize) -> Result<std::ops::Range<usize>, FlashError> {
        let start = offset as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(FlashError::OutOfRange { offset, len: len as u32 });
        }
        Ok(start..end)
    }
}

impl Default for RamFlash {
    fn default() -> Self {
        Self::new(FLASH_CHIP_SIZE)
    }
}

impl FlashRegion for RamFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        let r = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        check_sector_aligned(offset, len)?;
        let r = self.range(offset, len as usize)?;
        for b in &mut self.data[r] {
            *b = 0xFF;
        }
        self.erase_count += 1;
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        if offset % PAGE_SIZE != 0 {
            return Err(FlashError::Misaligned { offset, align: PAGE_SIZE });
        }
        let r = self.range(offset, data.len())?;
        for (cell, &v) in self.data[r].iter_mut().zip(data) {
            *cell &= v;
        }
        self.program_count += 1;
        Ok(())
    }
}

// ─── File-backed region ─────────────────────────────────────────────────────

/// The pak region of a flash chip, kept in a host file. The file holds only
/// the region, so file offset = flash offset - `layout.offset`.
pub struct FileFlash {
    file: File,
    layout: FlashLayout,
}

impl FileFlash {
    /// Open (or create erased) the backing file for `layout`.
    pub fn open(path: &Path, layout: FlashLayout) -> Result<Self, FlashError> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).truncate(false).open(path)?;
        let len = file.metadata()?.len();
        if len < layout.size as u64 {
            file.seek(SeekFrom::Start(len))?;
            file.write_all(&vec![0xFF; (layout.size as u64 - len) as usize])?;
            file.flush()?;
        }
        Ok(FileFlash { file, layout })
    }

    fn seek_to(&mut self, offset: u32) -> Result<(), FlashError> {
        self.file.seek(SeekFrom::Start((offset - self.layout.offset) as u64))?;
        Ok(())
    }
}

impl FlashRegion for FileFlash {
    fn read(&mut self, offset: u32, buf: &mut [u8]) -> Result<(), FlashError> {
        self.layout.check(offset, buf.len() as u32)?;
        self.seek_to(offset)?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn erase(&mut self, offset: u32, len: u32) -> Result<(), FlashError> {
        check_sector_aligned(offset, len)?;
        self.layout.check(offset, len)?;
        self.seek_to(offset)?;
        self.file.write_all(&vec![0xFF; len as usize])?;
        self.file.flush()?;
        Ok(())
    }

    fn program(&mut self, offset: u32, data: &[u8]) -> Result<(), FlashError> {
        self.layout.check(offset, data.len() as u32)?;
        let mut cells = vec![0u8; data.len()];
        self.seek_to(offset)?;
        self.file.read_exact(&mut cells)?;
        for (cell, &v) in cells.iter_mut().zip(data) {
            *cell &= v;
        }
        self.seek_to(offset)?;
        self.file.write_all(&cells)?;
        self.file.flush()?;
        Ok(())
    }
}

// ─── Persistence ────────────────────────────────────────────────────────────

/// Boot load and synchronized flush of the pak image.
pub struct Persistence<F, I, X> {
    flash: F,
    layout: FlashLayout,
    irq: I,
    link: ProtocolEnd<X>,
    /// Completed flushes since boot
    pub flush_count: u32,
}

impl<F: FlashRegion, I: InterruptControl, X: Fifo> Persistence<F, I, X> {
    pub fn new(flash: F, layout: FlashLayout, irq: I, link: ProtocolEnd<X>) -> Self {
        Persistence { flash, layout, irq, link, flush_count: 0 }
    }

    /// Copy the durable image verbatim into a fresh store.
    pub fn load(&mut self) -> Result<AccessoryStore, FlashError> {
        self.layout.validate()?;
        let mut image = vec![0u8; PAK_SIZE];
        self.flash.read(self.layout.offset, &mut image)?;
        log::info!("pak image loaded from flash at {:#x}", self.layout.offset);
        Ok(AccessoryStore::from_image(&image))
    }

    /// Rewrite the durable region from `store` and clear its dirty flag.
    ///
    /// Interrupts stay masked and the companion stays parked for the whole
    /// erase/program. On error the companion is still released (when it was
    /// parked) and `store` stays dirty.
    pub fn flush(&mut self, store: &mut AccessoryStore) -> Result<(), FlushError> {
        let saved = self.irq.disable();
        let result = self.flush_parked(store);
        self.irq.restore(saved);
        if result.is_ok() {
            self.flush_count += 1;
            log::info!("pak image flushed ({} since boot)", self.flush_count);
        }
        result
    }

    fn flush_parked(&mut self, store: &mut AccessoryStore) -> Result<(), FlushError> {
        self.link.pause()?;
        log::debug!("companion parked, erasing {:#x} bytes", self.layout.size);
        let written = self.write_image(store.image());
        if written.is_ok() {
            store.mark_clean();
        }
        self.link.resume()?;
        Ok(written?)
    }

    fn write_image(&mut self, image: &[u8]) -> Result<(), FlashError> {
        self.layout.validate()?;
        self.flash.erase(self.layout.offset, self.layout.size)?;
        self.flash.program(self.layout.offset, image)
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;
    use crate::sync::{test_support::LoopbackFifo, CountingIrq};
    use std::sync::Arc;

    fn persistence(flash: RamFlash) -> Persistence<RamFlash, CountingIrq, LoopbackFifo> {
        with_layout(flash, FlashLayout::default())
    }

    fn with_layout(flash: RamFlash, layout: FlashLayout) -> Persistence<RamFlash, CountingIrq, LoopbackFifo> {
        let shared = Arc::new(SharedState::new());
        let link = ProtocolEnd::new(shared, LoopbackFifo::default());
        Persistence::new(flash, layout, CountingIrq::default(), link)
    }

    #[test]
    fn test_ram_flash_program_clears_bits_only() {
        let mut flash = RamFlash::new(2 * SECTOR_SIZE);
        flash.program(0, &[0x0F]).unwrap();
        flash.program(0, &[0xF1]).unwrap();
        let mut b = [0u8; 1];
        flash.read(0, &mut b).unwrap();
        assert_eq!(b[0], 0x01);
        flash.erase(0, SECTOR_SIZE).unwrap();
        flash.read(0, &mut b).unwrap();
        assert_eq!(b[0], 0xFF);
    }

    #[test]
    fn test_ram_flash_alignment_and_range() {
        let mut flash = RamFlash::new(SECTOR_SIZE);
        assert!(matches!(flash.erase(1, SECTOR_SIZE), Err(FlashError::Misaligned { .. })));
        assert!(matches!(flash.program(3, &[0]), Err(FlashError::Misaligned { .. })));
        assert!(matches!(flash.erase(0, 2 * SECTOR_SIZE), Err(FlashError::OutOfRange { .. })));
    }

    #[test]
    fn test_default_layout() {
        let layout = FlashLayout::default();
        assert_eq!(layout.offset, 0x1F_8000);
        assert_eq!(layout.size, 0x8000);
        assert_eq!(layout.offset % SECTOR_SIZE, 0);
    }

    #[test]
    fn test_load_is_verbatim() {
        let mut flash = RamFlash::default();
        let layout = FlashLayout::default();
        let base = layout.offset as usize;
        flash.data[base + 0x20] = 0xAB;
        let mut p = persistence(flash);
        let store = p.load().unwrap();
        assert!(!store.is_dirty());
        assert_eq!(store.read_block(0x0020)[0], 0xAB);
        // erased flash loads as 0xFF, no validation
        assert_eq!(store.read_block(0x0000)[0], 0xFF);
    }

    #[test]
    fn test_flush_mirrors_image_and_clears_dirty() {
        let mut p = persistence(RamFlash::default());
        let mut store = AccessoryStore::new();
        store.write_block(0x0100, &[0x5A; crate::BLOCK_SIZE]);
        assert!(store.is_dirty());
        p.flush(&mut store).unwrap();
        assert!(!store.is_dirty());
        let base = FlashLayout::default().offset as usize;
        assert_eq!(&p.flash().data[base..base + PAK_SIZE], store.image());
        assert_eq!(p.flush_count, 1);
        assert_eq!(p.irq.disabled, 1);
        assert_eq!(p.irq.restored, 1);
    }

    #[test]
    fn test_flush_failure_keeps_dirty() {
        // Chip too small for the default layout: erase fails
        let mut p = persistence(RamFlash::new(SECTOR_SIZE));
        let mut store = AccessoryStore::new();
        store.write_block(0, &[1; crate::BLOCK_SIZE]);
        assert!(matches!(p.flush(&mut store), Err(FlushError::Flash(_))));
        assert!(store.is_dirty());
        assert_eq!(p.flush_count, 0);
        assert_eq!(p.irq.restored, 1);
    }

    #[test]
    fn test_short_region_is_rejected() {
        let layout = FlashLayout { offset: 0x1F_0000, size: 0x4000 };
        let mut p = with_layout(RamFlash::default(), layout);
        assert!(matches!(p.load(), Err(FlashError::RegionSize { size: 0x4000 })));

        let mut store = AccessoryStore::new();
        store.write_block(0x7FE0, &[0xAA; crate::BLOCK_SIZE]);
        assert!(matches!(p.flush(&mut store), Err(FlushError::Flash(FlashError::RegionSize { .. }))));
        assert!(store.is_dirty());
        // nothing erased or programmed, in or past the region
        assert_eq!(p.flash().erase_count, 0);
        assert_eq!(p.flash().program_count, 0);
        assert!(p.flash().data.iter().all(|&b| b == 0xFF));
        assert_eq!(p.irq.restored, 1);
    }

    #[test]
    fn test_file_flash_roundtrip() {
        let path = std::env::temp_dir().join(format!("joybus-fileflash-{}.bin", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let layout = FlashLayout::default();
        {
            let mut f = FileFlash::open(&path, layout).unwrap();
            let mut b = [0u8; 4];
            f.read(layout.offset, &mut b).unwrap();
            assert_eq!(b, [0xFF; 4]);
            f.erase(layout.offset, layout.size).unwrap();
            f.program(layout.offset, &[1, 2, 3, 4]).unwrap();
            assert!(matches!(f.read(0, &mut b), Err(FlashError::OutOfRange { .. })));
        }
        let mut f = FileFlash::open(&path, layout).unwrap();
        let mut b = [0u8; 4];
        f.read(layout.offset, &mut b).unwrap();
        assert_eq!(b, [1, 2, 3, 4]);
        std::fs::remove_file(&path).unwrap();
    }
}
