//! Cycle and cache-line primitives.
//!
//! Tiny wrappers at the bottom of the dependency stack. Their contract
//! (serialization of the timestamp read, eviction of one cache line) is
//! architecture specific and deliberately not abstracted; everything here is
//! x86_64 only.

use std::arch::asm;
use std::arch::x86_64::{__rdtscp, _mm_clflush, _mm_lfence, _mm_mfence};

/// Serialized read of the invariant cycle counter.
///
/// `rdtscp` waits until all earlier loads are globally visible before
/// reading the counter, so a later load cannot be reordered above it.
#[inline(always)]
pub fn rdtscp() -> u64 {
    let mut aux = 0u32;
    unsafe { __rdtscp(&mut aux) }
}

/// Evicts the cache line containing `addr`.
///
/// # Safety
///
/// `addr` must point into mapped memory.
#[inline(always)]
pub unsafe fn clflush(addr: *const u8) {
    unsafe { _mm_clflush(addr) }
}

/// Weakly ordered cache line eviction; higher throughput than [`clflush`].
///
/// # Safety
///
/// `addr` must point into mapped memory.
#[inline(always)]
pub unsafe fn clflushopt(addr: *const u8) {
    unsafe { asm!("clflushopt [{}]", in(reg) addr) };
}

/// Load fence.
#[inline(always)]
pub fn lfence() {
    unsafe { _mm_lfence() }
}

/// Store/load fence.
#[inline(always)]
pub fn mfence() {
    unsafe { _mm_mfence() }
}
