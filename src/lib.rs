//! # Peen
//!
//! Peen is a double-sided Rowhammer engine for DDR3 systems. It maps
//! huge-page-backed buffers, resolves their DRAM geometry through a small set
//! of XOR address functions, hammers aggressor row pairs with a
//! cache-flushing access loop, and turns a discovered bit flip into a
//! corruption of the sudo authentication library via kernel same-page
//! merging.
//!
//! ## Quickstart guide
//!
//! ```sh
//! # Build the engine
//! cargo build --release
//!
//! # Survey the flip yield of random aggressor pairs
//! target/release/peen --random --pairs 200
//!
//! # Run the full sudoers attack
//! target/release/peen --flip-sudo
//! ```
//!
//! Use `target/release/peen --help` to see the available options. The DRAM
//! address functions default to the built-in DDR3 set and can be replaced
//! with a JSON file via `--dram-config`.
//!
//! ## Modules
//!
//! - `allocator`: region mapping strategies.
//! - `hammerer`: the hammering trait; concrete loops live in `peen-clflush`.
//! - `memory`: buffer management and the DRAM geometry layer.
//! - `scanner`: template discovery over banks and random pairs.
//! - `mask`: aggressor payload calibration.
//! - `exploit`: the page-corruption pipeline.
//! - `opcodes`: the table of exploitable library bytes.

pub use peen_core::{BuildError, Peen, PeenBuilder, RunOutcome, RunReport};
pub use peen_core::{allocator, config, exploit, hammerer, mask, memory, opcodes, scanner, util};

#[cfg(feature = "clflush")]
pub use peen_clflush;
#[cfg(feature = "dummy")]
pub use peen_dummy;
#[cfg(feature = "thp")]
pub use peen_thp;
