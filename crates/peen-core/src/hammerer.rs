//! Rowhammer hammering traits.
//!
//! This module defines the [`Hammering`] trait that all hammering
//! implementations must implement to perform the memory access patterns that
//! induce bit flips through the Rowhammer effect.

use crate::memory::AggressorPtr;

/// Trait for implementing Rowhammer hammering techniques.
///
/// Implementors repeatedly activate the two aggressor rows flanking a victim
/// row. The contract is an access pattern, not a time bound: every activation
/// must reach DRAM instead of being served from the cache hierarchy. The
/// scanners, the mask builder and the exploitation driver are generic over
/// this trait so that a fault-injecting fake (see `peen-dummy`) can stand in
/// for real hardware flips.
pub trait Hammering {
    /// The error type returned by hammering operations.
    type Error: std::error::Error;

    /// Performs `activations` paired row activations on the bank shared by
    /// `agg1` and `agg2`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hammering operation fails; implementations
    /// whose loop cannot fail use an uninhabited error type.
    fn hammer(
        &self,
        agg1: AggressorPtr,
        agg2: AggressorPtr,
        activations: u64,
    ) -> Result<(), Self::Error>;
}
