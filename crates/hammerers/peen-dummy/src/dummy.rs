use log::debug;
use peen_core::hammerer::Hammering;
use peen_core::memory::{AggressorPtr, DramConfig, RowNeighbor, adjacent_row, row_align};
use peen_core::opcodes::FlipDirection;
use std::arch::x86_64::_mm_clflush;
use thiserror::Error;

/// Where and how a flip is injected into the victim row.
#[derive(Clone, Copy, Debug)]
pub struct FlipSpec {
    /// Byte offset within the victim row
    pub row_offset: usize,
    /// Bit position (0-7) to flip
    pub bit: u8,
    /// Direction the injected flip follows
    pub direction: FlipDirection,
}

/// Dummy hammerer that injects deterministic bit flips.
///
/// Simulates a vulnerable cell: every hammer call flips the configured bit
/// of the row between the aggressor pair, in the configured direction only.
/// Scanners, the mask builder and the exploitation pipeline run against it
/// unchanged, without a vulnerable DIMM.
pub struct Dummy {
    base: usize,
    dram: DramConfig,
    flip: FlipSpec,
}

impl Dummy {
    /// Creates a dummy hammerer over the buffer starting at `base`.
    pub fn new(base: *const u8, dram: DramConfig, flip: FlipSpec) -> Self {
        assert!(flip.bit < 8);
        Dummy {
            base: base as usize,
            dram,
            flip,
        }
    }
}

/// Error type that can never occur.
#[derive(Debug, Error)]
pub enum Never {}

impl Hammering for Dummy {
    type Error = Never;

    fn hammer(
        &self,
        agg1: AggressorPtr,
        agg2: AggressorPtr,
        _activations: u64,
    ) -> Result<(), Never> {
        let agg1 = agg1 as usize - self.base;
        let victim = adjacent_row(row_align(agg1, &self.dram), RowNeighbor::Next, &self.dram);
        debug_assert_eq!(
            adjacent_row(victim, RowNeighbor::Next, &self.dram),
            row_align(agg2 as usize - self.base, &self.dram),
            "aggressors do not flank one row"
        );
        let addr = (self.base + victim + self.flip.row_offset) as *mut u8;
        let mask = 1 << self.flip.bit;
        unsafe {
            let value = std::ptr::read_volatile(addr);
            let flipped = match self.flip.direction {
                FlipDirection::ZeroToOne if value & mask == 0 => value | mask,
                FlipDirection::OneToZero if value & mask != 0 => value & !mask,
                _ => value,
            };
            if flipped != value {
                debug!(
                    "flipping victim row byte {:#x} from {:#04x} to {:#04x}",
                    victim + self.flip.row_offset,
                    value,
                    flipped
                );
                std::ptr::write_volatile(addr, flipped);
                _mm_clflush(addr);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peen_core::memory::{BytePointer, DramAddr, Memory, VictimBuffer};
    use peen_core::util::HUGE_PAGE_SIZE;

    #[test]
    fn test_flip_respects_direction() {
        let memory = Memory::mmap(HUGE_PAGE_SIZE).expect("mmap failed");
        memory.fill(0x00);
        let dram = DramConfig::ddr3();
        let agg1 = DramAddr::for_bank(0, 0, &dram).to_offset(&dram);
        let vic = DramAddr::for_bank(0, 1, &dram).to_offset(&dram);
        let agg2 = DramAddr::for_bank(0, 2, &dram).to_offset(&dram);

        let dummy = Dummy::new(
            memory.ptr(),
            dram.clone(),
            FlipSpec {
                row_offset: 0x123,
                bit: 5,
                direction: FlipDirection::ZeroToOne,
            },
        );
        dummy
            .hammer(memory.addr(agg1), memory.addr(agg2), 1)
            .expect("hammering failed");
        assert_eq!(unsafe { *memory.addr(vic + 0x123) }, 0x20);

        // the bit is set now, a zero-to-one dummy leaves it alone
        dummy
            .hammer(memory.addr(agg1), memory.addr(agg2), 1)
            .expect("hammering failed");
        assert_eq!(unsafe { *memory.addr(vic + 0x123) }, 0x20);

        memory.dealloc();
    }
}
