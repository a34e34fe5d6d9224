//! Controller pak backing store.
//!
//! 32 KiB addressed in 32-byte blocks. The low five bits of an address carry
//! the CRC5 on the wire and are dropped here, so every address inside a block
//! lands on the same block. Addresses at or above [`PAK_SIZE`] belong to
//! accessory control registers (rumble probe, motor) and never reach the
//! backing array; the dispatcher handles them.

use crate::{BLOCK_SIZE, PAK_SIZE};

/// Address bits that select a block.
pub const BLOCK_MASK: u16 = !(BLOCK_SIZE as u16 - 1);

/// Number of 32-byte blocks in the store.
pub const BLOCK_COUNT: usize = PAK_SIZE / BLOCK_SIZE;

pub struct AccessoryStore {
    data: Vec<u8>,
    /// True whenever `data` differs from the last completed flush
    dirty: bool,
}

impl AccessoryStore {
    /// Blank store (all zero), not dirty.
    pub fn new() -> Self {
        AccessoryStore { data: vec![0u8; PAK_SIZE], dirty: false }
    }

    /// Store initialised from a durable image. Loaded as-is: the image has no
    /// header or checksum to validate. A short image leaves the tail zeroed.
    pub fn from_image(image: &[u8]) -> Self {
        let mut store = Self::new();
        let len = image.len().min(PAK_SIZE);
        store.data[..len].copy_from_slice(&image[..len]);
        store
    }

    /// Overwrite the whole image, e.g. from an imported save state. The
    /// store goes dirty so the next idle flush makes it durable.
    pub fn replace_image(&mut self, image: &[u8; PAK_SIZE]) {
        self.data.copy_from_slice(image);
        self.dirty = true;
    }

    /// Block-aligned address for `addr`.
    #[inline(always)]
    pub fn align(addr: u16) -> u16 {
        addr & BLOCK_MASK
    }

    /// True when `addr` falls inside the storage region.
    #[inline(always)]
    pub fn is_storage(addr: u16) -> bool {
        (addr as usize) < PAK_SIZE
    }

    /// Copy of the block containing `addr`. Addresses outside the storage
    /// region read as zeros.
    pub fn read_block(&self, addr: u16) -> [u8; BLOCK_SIZE] {
        let mut block = [0u8; BLOCK_SIZE];
        if Self::is_storage(addr) {
            let base = Self::align(addr) as usize;
            block.copy_from_slice(&self.data[base..base + BLOCK_SIZE]);
        }
        block
    }

    /// Overwrite the block containing `addr` and mark the store dirty.
    /// Returns false (and changes nothing) for addresses outside storage.
    pub fn write_block(&mut self, addr: u16, block: &[u8; BLOCK_SIZE]) -> bool {
        if !Self::is_storage(addr) {
            return false;
        }
        let base = Self::align(addr) as usize;
        self.data[base..base + BLOCK_SIZE].copy_from_slice(block);
        self.dirty = true;
        true
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Only a completed flush may call this.
    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// The full in-memory image, as it would be flushed.
    pub fn image(&self) -> &[u8] {
        &self.data
    }
}

impl Default for AccessoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(seed: u8) -> [u8; BLOCK_SIZE] {
        let mut b = [0u8; BLOCK_SIZE];
        for (i, v) in b.iter_mut().enumerate() {
            *v = seed.wrapping_mul(31).wrapping_add(i as u8);
        }
        b
    }

    #[test]
    fn test_new_store_is_clean() {
        let store = AccessoryStore::new();
        assert!(!store.is_dirty());
        assert_eq!(store.image().len(), PAK_SIZE);
        assert_eq!(BLOCK_COUNT, 1024);
    }

    #[test]
    fn test_write_then_read_storage_region() {
        let mut store = AccessoryStore::new();
        for addr in (0..0x8000u32).step_by(0x0420) {
            let addr = addr as u16;
            let data = pattern(addr as u8);
            assert!(store.write_block(addr, &data));
            assert!(store.is_dirty());
            assert_eq!(store.read_block(addr), data);
        }
    }

    #[test]
    fn test_low_bits_select_same_block() {
        let mut store = AccessoryStore::new();
        store.write_block(0x0123, &pattern(7));
        assert_eq!(store.read_block(0x0120), pattern(7));
        assert_eq!(store.read_block(0x013F), pattern(7));
        assert_eq!(store.read_block(0x0140), [0u8; BLOCK_SIZE]);
        for a in [0x0000u16, 0x7FE0, 0x8000, 0xC01B, 0xFFFF] {
            assert_eq!(store.read_block(a), store.read_block(a & 0xFFE0));
        }
    }

    #[test]
    fn test_reserved_region_not_stored() {
        let mut store = AccessoryStore::new();
        assert!(!store.write_block(0x8000, &pattern(1)));
        assert!(!store.write_block(0xC01B, &pattern(2)));
        assert!(!store.is_dirty());
        assert_eq!(store.read_block(0x8000), [0u8; BLOCK_SIZE]);
        assert!(store.image().iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_image_and_mark_clean() {
        let mut image = vec![0u8; PAK_SIZE];
        image[0x40..0x60].copy_from_slice(&pattern(3));
        let mut store = AccessoryStore::from_image(&image);
        assert!(!store.is_dirty());
        assert_eq!(store.read_block(0x0040), pattern(3));
        store.write_block(0, &pattern(4));
        store.mark_clean();
        assert!(!store.is_dirty());
    }

    #[test]
    fn test_replace_image_marks_dirty() {
        let mut store = AccessoryStore::new();
        let image = [0x5Au8; PAK_SIZE];
        store.replace_image(&image);
        assert!(store.is_dirty());
        assert_eq!(store.read_block(0x7FE0), [0x5A; BLOCK_SIZE]);
    }
}
