//! Constants used throughout the engine.
//!
//! Memory layout facts ([`PAGE_SIZE`], [`ROW_SIZE`], [`HUGE_PAGE_SIZE`], the
//! entropy padding width) together with the default values of the hammering
//! knobs ([`DEFAULT_ACTIVATIONS`], [`DEFAULT_HAMMERING_ROUNDS`],
//! [`DEFAULT_RANDOM_PAIRS`]).

mod constants;

pub use self::constants::*;
