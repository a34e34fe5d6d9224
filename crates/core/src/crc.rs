//! Accessory-bus checksums.
//!
//! Two checks protect traffic to the controller-port accessory:
//!
//! | Check | Width | Covers                        | Placement                          |
//! |-------|-------|-------------------------------|------------------------------------|
//! | CRC5  | 5 bit | address bits 15..5            | low 5 bits of the 16-bit address   |
//! | CRC8  | 8 bit | one 32-byte block (poly 0x85) | trailing byte after the block      |
//!
//! Both are bit-exact with what real paks compute; the console rejects a
//! block whose trailing byte does not match.

use crate::BLOCK_SIZE;

/// Per-bit XOR contributions for the address CRC. Bits 0–4 carry the CRC
/// itself and never contribute.
const ADDRESS_XOR: [u16; 16] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x15, 0x1F, 0x0B,
    0x16, 0x19, 0x07, 0x0E, 0x1C, 0x0D, 0x1A, 0x01,
];

/// Data CRC generator polynomial (x^8 + x^7 + x^2 + 1, top bit implicit).
const DATA_POLY: u8 = 0x85;

/// Mask selecting the CRC5 field of an address word.
pub const ADDRESS_CRC_MASK: u16 = 0x001F;

/// Return `addr` with its low 5 bits replaced by the CRC5 of bits 15..5.
pub fn address_crc(addr: u16) -> u16 {
    let addr = addr & !ADDRESS_CRC_MASK;
    let mut crc = 0u16;
    for bit in (5..16).rev() {
        if (addr >> bit) & 1 != 0 {
            crc ^= ADDRESS_XOR[bit];
        }
    }
    addr | (crc & ADDRESS_CRC_MASK)
}

/// True when the CRC5 carried in the low bits of `addr` matches its address.
pub fn address_crc_ok(addr: u16) -> bool {
    address_crc(addr) == addr
}

/// CRC8 over one block, MSB first, followed by a flush pass of eight zero
/// bits so the whole message has left the shift register.
pub fn data_crc(block: &[u8; BLOCK_SIZE]) -> u8 {
    let mut crc = 0u8;
    // BLOCK_SIZE data bytes, then one virtual zero byte
    for i in 0..=BLOCK_SIZE {
        let byte = if i < BLOCK_SIZE { block[i] } else { 0 };
        for bit in (0..8).rev() {
            let carry = crc & 0x80 != 0;
            crc = (crc << 1) | ((byte >> bit) & 1);
            if carry {
                crc ^= DATA_POLY;
            }
        }
    }
    crc
}
