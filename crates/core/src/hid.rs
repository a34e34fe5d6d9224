//! HID report fields.
//!
//! Descriptor parsing is someone else's job: a [`ReportParser`] turns a report
//! descriptor into a flat list of input [`FieldDescriptor`]s, in report order.
//! This module only looks fields up and pulls their values out of raw
//! reports.
//!
//! Bits are numbered LSB first across the report, the way HID lays them out:
//!
//! ```text
//!   byte 0            byte 1
//!   7 6 5 4 3 2 1 0   7 6 5 4 3 2 1 0
//!   ─────────────────────────────────
//!   bit_offset 4, bit_size 8  →  byte0[7:4] | byte1[3:0] << 4
//! ```

use thiserror::Error;

/// Generic Desktop usage page.
pub const PAGE_GENERIC_DESKTOP: u16 = 0x01;
/// Button usage page.
pub const PAGE_BUTTON: u16 = 0x09;

pub const USAGE_X: u16 = 0x30;
pub const USAGE_Y: u16 = 0x31;
/// Right stick X on most pads.
pub const USAGE_Z: u16 = 0x32;
/// Right stick Y on most pads.
pub const USAGE_RZ: u16 = 0x35;
pub const USAGE_HAT_SWITCH: u16 = 0x39;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HidError {
    #[error("field at bit {bit_offset} (+{bit_size}) runs past a {report_bits}-bit report")]
    Truncated { bit_offset: u16, bit_size: u8, report_bits: usize },
    #[error("unsupported field width {0} bits")]
    FieldWidth(u8),
    #[error("descriptor has no {0}")]
    Missing(&'static str),
    #[error("malformed report descriptor: {0}")]
    Descriptor(String),
}

/// One input field of a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub page: u16,
    pub usage: u16,
    pub bit_offset: u16,
    pub bit_size: u8,
    pub logical_min: i32,
    pub logical_max: i32,
}

impl FieldDescriptor {
    /// Span of the logical range, at least 1. Widened so a full 32-bit
    /// range fits.
    pub fn logical_span(&self) -> i64 {
        (self.logical_max as i64 - self.logical_min as i64).max(1)
    }
}

/// Descriptor parser supplied by the USB host stack.
pub trait ReportParser {
    fn parse_descriptor(&self, descriptor: &[u8]) -> Result<Vec<FieldDescriptor>, HidError>;
}

/// The parsed fields of one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportLayout {
    fields: Vec<FieldDescriptor>,
}

impl ReportLayout {
    pub fn new(fields: Vec<FieldDescriptor>) -> Self {
        ReportLayout { fields }
    }

    pub fn parse<P: ReportParser>(parser: &P, descriptor: &[u8]) -> Result<Self, HidError> {
        Ok(ReportLayout::new(parser.parse_descriptor(descriptor)?))
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// First field on `page`.
    pub fn find_by_page(&self, page: u16) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.page == page)
    }

    /// First field with this page and usage.
    pub fn find_by_usage(&self, page: u16, usage: u16) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.page == page && f.usage == usage)
    }

    /// The `bit`-th field of the first contiguous run on `page`. Button
    /// arrays are described as one run of 1-bit fields, so this is "button
    /// number `bit`".
    pub fn find_bit_by_page(&self, page: u16, bit: usize) -> Option<&FieldDescriptor> {
        let start = self.fields.iter().position(|f| f.page == page)?;
        self.fields.get(start + bit).filter(|f| f.page == page)
    }
}

/// Extract one field from a raw report. Sign-extended when the logical
/// minimum is negative.
pub fn field_value(field: &FieldDescriptor, report: &[u8]) -> Result<i32, HidError> {
    let size = field.bit_size as usize;
    if size == 0 || size > 32 {
        return Err(HidError::FieldWidth(field.bit_size));
    }
    let start = field.bit_offset as usize;
    let end = start + size;
    if end > report.len() * 8 {
        return Err(HidError::Truncated {
            bit_offset: field.bit_offset,
            bit_size: field.bit_size,
            report_bits: report.len() * 8,
        });
    }

    // At most 5 bytes: 7 bits of skew plus 32 bits of payload
    let mut raw: u64 = 0;
    for (i, &b) in report[start / 8..=(end - 1) / 8].iter().enumerate() {
        raw |= (b as u64) << (8 * i);
    }
    raw >>= start % 8;
    let value = (raw & ((1u64 << size) - 1)) as u32;

    if field.logical_min < 0 && size < 32 && value & (1 << (size - 1)) != 0 {
        return Ok((value | (u32::MAX << size)) as i32);
    }
    Ok(value as i32)
}
