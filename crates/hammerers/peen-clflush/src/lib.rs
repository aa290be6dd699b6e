//! Flush-based hammerers.
//!
//! The hammer loops that do the actual row activations: a double-sided
//! DDR3 loop built on `clflush` and a multi-aggressor DDR4 variant built on
//! `clflushopt` with an eviction-boundary calibration pre-phase. The cycle
//! and cache-line primitives they rest on are exported for reuse.

#![warn(missing_docs)]

pub mod asm;
mod clflush;

pub use clflush::{ClflushHammer, Ddr4Hammer, Never};
