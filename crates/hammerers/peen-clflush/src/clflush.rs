use crate::asm::{clflush, clflushopt, mfence, rdtscp};
use log::debug;
use peen_core::hammerer::Hammering;
use peen_core::memory::AggressorPtr;
use std::ptr::read_volatile;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Error type that can never occur.
#[derive(Debug, Error)]
pub enum Never {}

/// Double-sided hammerer for DDR3.
///
/// Every activation reads one byte from each aggressor and flushes both
/// cache lines. The loads are volatile and the flushes are ordered behind
/// the reads of their line, so each iteration opens both aggressor rows in
/// the shared bank twice. The loop yields to the scheduler once before
/// entering; preemption mid-loop only lowers the flip yield, it does not
/// affect correctness.
#[derive(Debug, Default, Copy, Clone)]
pub struct ClflushHammer {}

impl Hammering for ClflushHammer {
    type Error = Never;

    fn hammer(
        &self,
        agg1: AggressorPtr,
        agg2: AggressorPtr,
        activations: u64,
    ) -> Result<(), Never> {
        unsafe { libc::sched_yield() };
        for _ in 0..activations {
            unsafe {
                let _ = read_volatile(agg1);
                let _ = read_volatile(agg2);
                clflush(agg1);
                clflush(agg2);
            }
        }
        Ok(())
    }
}

/// Multi-aggressor hammerer for DDR4 row policies.
///
/// A calibration pre-phase load-flushes the first aggressor until two
/// successive timestamps differ by more than the threshold, approximating
/// the row policy's eviction boundary. The main loop then reads every
/// aggressor, fences, and flushes them all with the weakly ordered eviction.
#[derive(Debug, Copy, Clone)]
pub struct Ddr4Hammer {
    threshold: u64,
}

impl Ddr4Hammer {
    /// Creates a hammerer with the given calibration threshold in cycles.
    pub fn new(threshold: u64) -> Self {
        Ddr4Hammer { threshold }
    }

    /// Hammers all `aggressors` for `activations` iterations and returns the
    /// elapsed wall-clock time.
    pub fn hammer_aggressors(&self, aggressors: &[AggressorPtr], activations: u64) -> Duration {
        assert!(!aggressors.is_empty());
        unsafe { libc::sched_yield() };
        let mut t_start = 0u64;
        let mut t_end = 0u64;
        while t_end.abs_diff(t_start) < self.threshold {
            unsafe {
                t_start = rdtscp();
                let _ = read_volatile(aggressors[0]);
                clflushopt(aggressors[0]);
                t_end = rdtscp();
            }
        }
        let start = Instant::now();
        for _ in 0..activations {
            unsafe {
                for &aggressor in aggressors {
                    let _ = read_volatile(aggressor);
                }
                mfence();
                for &aggressor in aggressors {
                    clflushopt(aggressor);
                }
            }
        }
        let elapsed = start.elapsed();
        debug!(
            "hammered {} aggressors in {} ms",
            aggressors.len(),
            elapsed.as_millis()
        );
        elapsed
    }
}

impl Hammering for Ddr4Hammer {
    type Error = Never;

    fn hammer(
        &self,
        agg1: AggressorPtr,
        agg2: AggressorPtr,
        activations: u64,
    ) -> Result<(), Never> {
        self.hammer_aggressors(&[agg1, agg2], activations);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clflush_hammer_runs() {
        let buf = [0u8; 128];
        let hammerer = ClflushHammer::default();
        hammerer
            .hammer(&buf[0], &buf[64], 1000)
            .expect("hammering failed");
    }

    #[test]
    fn test_ddr4_hammer_reports_elapsed() {
        let buf = [0u8; 256];
        let hammerer = Ddr4Hammer::new(1);
        let aggressors: Vec<AggressorPtr> = vec![&buf[0], &buf[64], &buf[128], &buf[192]];
        let elapsed = hammerer.hammer_aggressors(&aggressors, 100);
        assert!(elapsed > Duration::ZERO);
    }
}
