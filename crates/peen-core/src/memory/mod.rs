//! Memory management for the huge-page buffer.
//!
//! The `memory` module provides the following abstractions:
//! - [`Memory`]: an owned, mapped region addressed by byte offsets.
//! - [`BytePointer`]: a trait for accessing a region as a byte pointer.
//! - [`VictimBuffer`]: fill, entropy and flushed-read operations over a
//!   [`BytePointer`], provided as a blanket implementation.
//! - [`DramAddr`] / [`DramConfig`]: the DRAM geometry layer.
//! - [`BitFlip`]: a bit flip observed in a victim row.
//! - [`LinuxPageMap`]: virtual to physical address resolution for
//!   diagnostics.

mod dram_addr;
mod memblock;
mod virt_to_phys;

pub use self::dram_addr::{
    DramAddr, DramConfig, DramConfigError, RowNeighbor, adjacent_row, row_align,
};
pub use self::memblock::Memory;
pub use self::virt_to_phys::{LinuxPageMap, LinuxPageMapError, PhysAddr};

use std::arch::x86_64::{_mm_clflush, _mm_mfence};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::opcodes::FlipDirection;
use crate::util::{CL_SIZE, ENTROPY_PADDING_SIZE, PAGE_MASK, PAGE_SIZE, ROW_SIZE};
use log::debug;
use rand::Rng as _;
use serde::Serialize;

/// Pointer type for aggressor row addresses.
///
/// Used to identify memory rows that are hammered to induce bit flips
/// in adjacent victim rows.
pub type AggressorPtr = *const u8;

/// True for offsets that fall into the per-page entropy padding.
///
/// The first [`ENTROPY_PADDING_SIZE`] bytes of every 4KB page hold fresh
/// random bytes so that no page of the buffer matches any other page, or any
/// file page, until same-page merging is deliberately invited.
pub fn in_entropy_padding(offset: usize) -> bool {
    offset & PAGE_MASK < ENTROPY_PADDING_SIZE
}

/// Trait for accessing memory as a byte pointer.
///
/// Provides low-level access to memory regions with byte-level addressing.
#[allow(clippy::len_without_is_empty)]
pub trait BytePointer {
    /// Returns a mutable pointer to the byte at the given offset.
    ///
    /// # Safety
    ///
    /// The returned pointer is valid only while the memory region exists.
    /// Dereferencing requires unsafe code.
    fn addr(&self, offset: usize) -> *mut u8;

    /// Returns a mutable pointer to the start of the memory region.
    fn ptr(&self) -> *mut u8;

    /// Returns the total length of the memory region in bytes.
    fn len(&self) -> usize;
}

/// Buffer operations used by the scanners and the exploitation driver.
///
/// Reads go through a cache line flush and a fence so the values come from
/// DRAM rather than from a cache line the hammer loop never touched.
pub trait VictimBuffer: BytePointer {
    /// Fills the whole region with `value`.
    fn fill(&self, value: u8) {
        unsafe { std::ptr::write_bytes(self.ptr(), value, self.len()) };
    }

    /// Fills the row starting at `row_offset` with `value`, preserving the
    /// entropy padding of both pages of the row.
    fn fill_row_body(&self, row_offset: usize, value: u8) {
        for page in (row_offset..row_offset + ROW_SIZE).step_by(PAGE_SIZE) {
            unsafe {
                std::ptr::write_bytes(
                    self.addr(page + ENTROPY_PADDING_SIZE),
                    value,
                    PAGE_SIZE - ENTROPY_PADDING_SIZE,
                )
            };
        }
    }

    /// Writes fresh random bytes into the entropy padding of the page at
    /// `page_offset`.
    fn add_entropy_page(&self, page_offset: usize) {
        let mut rng = rand::rng();
        for i in 0..ENTROPY_PADDING_SIZE {
            unsafe { std::ptr::write_volatile(self.addr(page_offset + i), rng.random()) };
        }
    }

    /// Writes fresh random bytes into the entropy padding of every page.
    fn add_entropy(&self) {
        for page in (0..self.len()).step_by(PAGE_SIZE) {
            self.add_entropy_page(page);
        }
        debug!("entropy padding refreshed for {} pages", self.len() / PAGE_SIZE);
    }

    /// Copies a full page of `bytes` to `page_offset`.
    fn write_page(&self, page_offset: usize, bytes: &[u8]) {
        assert_eq!(bytes.len(), PAGE_SIZE);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.addr(page_offset), PAGE_SIZE) };
    }

    /// Copies a full row of `bytes` to `row_offset`.
    fn write_row(&self, row_offset: usize, bytes: &[u8]) {
        assert_eq!(bytes.len(), ROW_SIZE);
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.addr(row_offset), ROW_SIZE) };
    }

    /// Reads the row starting at `row_offset` from DRAM.
    fn read_row(&self, row_offset: usize) -> Vec<u8> {
        let mut out = vec![0u8; ROW_SIZE];
        unsafe {
            for line in (0..ROW_SIZE).step_by(CL_SIZE) {
                _mm_clflush(self.addr(row_offset + line));
            }
            _mm_mfence();
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = std::ptr::read_volatile(self.addr(row_offset + i));
            }
        }
        out
    }

    /// Reads one byte at `offset` from DRAM.
    fn read_byte(&self, offset: usize) -> u8 {
        unsafe {
            _mm_clflush(self.addr(offset));
            _mm_mfence();
            std::ptr::read_volatile(self.addr(offset))
        }
    }

    /// Dumps the page at `page_offset` to `path` as two-hex-digit bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if file creation or writing fails.
    fn dump_page(&self, page_offset: usize, path: &Path) -> std::io::Result<()> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        for i in 0..PAGE_SIZE {
            write!(writer, "{:02x}", unsafe {
                std::ptr::read_volatile(self.addr(page_offset + i))
            })?;
        }
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

impl<T: BytePointer> VictimBuffer for T {}

/// Represents a bit flip detected in a victim row.
///
/// A bit flip is a change in memory where one or more bits differ from their
/// expected value. This is the primary indicator of a successful hammering
/// round.
#[derive(Clone, Copy, Serialize, PartialEq, Eq, Hash)]
pub struct BitFlip {
    /// Buffer offset where the bit flip occurred
    pub offset: usize,
    /// Bitmask indicating which bits flipped (1 = bit flipped)
    pub bitmask: u8,
    /// The expected data value (before the flip)
    pub data: u8,
}

impl core::fmt::Debug for BitFlip {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BitFlip")
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("bitmask", &format_args!("{:#x}", self.bitmask))
            .field("data", &format_args!("{:#x}", self.data))
            .finish()
    }
}

impl BitFlip {
    /// Constructor for BitFlip
    pub fn new(offset: usize, bitmask: u8, data: u8) -> Self {
        BitFlip {
            offset,
            bitmask,
            data,
        }
    }

    /// The direction of a single-bit flip, or `None` when zero or several
    /// bits changed.
    pub fn direction(&self) -> Option<FlipDirection> {
        match self.bitmask.count_ones() {
            1 => Some(if self.bitmask & self.data != 0 {
                FlipDirection::OneToZero
            } else {
                FlipDirection::ZeroToOne
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::HUGE_PAGE_SIZE;
    use std::collections::HashSet;

    #[test]
    fn test_bitflip_direction() {
        let flip = BitFlip::new(0, 0b0000_0000, 0xFF);
        assert_eq!(flip.direction(), None);
        let flip = BitFlip::new(0, 0b0000_0001, 0b0000_0001);
        assert_eq!(flip.direction(), Some(FlipDirection::OneToZero));
        let flip = BitFlip::new(0, 0b0000_0001, 0b1111_1110);
        assert_eq!(flip.direction(), Some(FlipDirection::ZeroToOne));
        let flip = BitFlip::new(0, 0b0000_0011, 0b0000_0010);
        assert_eq!(flip.direction(), None);
    }

    #[test]
    fn test_entropy_padding_offsets() {
        assert!(in_entropy_padding(0));
        assert!(in_entropy_padding(ENTROPY_PADDING_SIZE - 1));
        assert!(!in_entropy_padding(ENTROPY_PADDING_SIZE));
        assert!(in_entropy_padding(PAGE_SIZE));
        assert!(!in_entropy_padding(PAGE_SIZE - 1));
    }

    #[test]
    fn test_entropy_makes_pages_unique() -> anyhow::Result<()> {
        let memory = Memory::mmap(HUGE_PAGE_SIZE)?;
        memory.fill(0xFF);
        memory.add_entropy();
        let mut paddings = HashSet::new();
        for page in (0..memory.len()).step_by(PAGE_SIZE) {
            let mut padding = [0u8; ENTROPY_PADDING_SIZE];
            for (i, byte) in padding.iter_mut().enumerate() {
                *byte = unsafe { *memory.addr(page + i) };
            }
            paddings.insert(padding);
        }
        assert_eq!(paddings.len(), HUGE_PAGE_SIZE / PAGE_SIZE);
        memory.dealloc();
        Ok(())
    }

    #[test]
    fn test_fill_row_body_keeps_padding() -> anyhow::Result<()> {
        let memory = Memory::mmap(HUGE_PAGE_SIZE)?;
        memory.fill(0xAA);
        memory.fill_row_body(0, 0x00);
        assert_eq!(unsafe { *memory.addr(0) }, 0xAA);
        assert_eq!(unsafe { *memory.addr(ENTROPY_PADDING_SIZE) }, 0x00);
        assert_eq!(unsafe { *memory.addr(PAGE_SIZE - 1) }, 0x00);
        assert_eq!(unsafe { *memory.addr(PAGE_SIZE) }, 0xAA);
        assert_eq!(unsafe { *memory.addr(PAGE_SIZE + ENTROPY_PADDING_SIZE) }, 0x00);
        assert_eq!(unsafe { *memory.addr(ROW_SIZE - 1) }, 0x00);
        assert_eq!(unsafe { *memory.addr(ROW_SIZE) }, 0xAA);
        memory.dealloc();
        Ok(())
    }
}
