//! Transparent huge page region allocator.
//!
//! Maps each 2MB region at the fixed virtual base `index * 2MB`, advises the
//! kernel to back it with one transparent huge page and pins it resident.
//! With the region both virtually and physically aligned to 2MB, the low 21
//! bits of every buffer offset equal the low 21 bits of its physical address,
//! which is what the DRAM geometry layer reasons about.
//!
//! Implements the [`peen_core::allocator::RegionAllocator`] trait.
//!
//! # Platform Requirements
//!
//! - x86_64 Linux with THP support enabled ("always" or "madvise" mode)
//! - Root privileges for the PFN diagnostics (optional)

#![warn(missing_docs)]

use lazy_static::lazy_static;
use libc::{MADV_HUGEPAGE, MAP_ANONYMOUS, MAP_FIXED_NOREPLACE, MAP_PRIVATE, PROT_READ, PROT_WRITE};
use log::{log_enabled, warn};
use peen_core::allocator::RegionAllocator;
use peen_core::memory::Memory;
use peen_core::util::{HUGE_PAGE_MASK, HUGE_PAGE_SHIFT, HUGE_PAGE_SIZE};
use std::fs::File;
use std::io::Read;
use thiserror::Error;

const THP_ENABLED_PATH: &str = "/sys/kernel/mm/transparent_hugepage/enabled";

lazy_static! {
    static ref THP_ENABLED: bool = {
        let buf = File::open(THP_ENABLED_PATH).map_or("".to_owned(), |mut f| {
            let mut s = String::new();
            let _ = f.read_to_string(&mut s);
            s
        });
        parse_thp_enabled(&buf)
    };
}

// The kernel brackets the active mode, e.g. "always [madvise] never".
fn parse_thp_enabled(s: &str) -> bool {
    s.contains("[always]") || s.contains("[madvise]")
}

/// Errors that can happen while mapping a THP region.
#[derive(Debug, Error)]
pub enum Error {
    /// mmap or madvise failed
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// THP is configured off in the kernel
    #[error("transparent huge pages are disabled in the kernel")]
    ThpDisabled,
}

/// Region allocator backed by transparent huge pages at fixed bases.
#[derive(Debug, Default, Copy, Clone)]
pub struct ThpAllocator {}

impl RegionAllocator for ThpAllocator {
    type Error = Error;

    fn map_region(&mut self, index: usize) -> Result<Memory, Error> {
        if !*THP_ENABLED {
            return Err(Error::ThpDisabled);
        }
        assert!(index >= 1, "region bases start at one huge page");
        let base = (index << HUGE_PAGE_SHIFT) as *mut libc::c_void;
        let p = unsafe {
            libc::mmap(
                base,
                HUGE_PAGE_SIZE,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANONYMOUS | MAP_FIXED_NOREPLACE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        if unsafe { libc::madvise(p, HUGE_PAGE_SIZE, MADV_HUGEPAGE) } != 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::munmap(p, HUGE_PAGE_SIZE) };
            return Err(err.into());
        }
        if unsafe { libc::mlock(p, HUGE_PAGE_SIZE) } != 0 {
            warn!(
                "mlock failed for region {}: {}",
                index,
                std::io::Error::last_os_error()
            );
        }
        // touch every page so khugepaged sees a populated, aligned candidate
        unsafe { libc::memset(p, 0x00, HUGE_PAGE_SIZE) };
        assert_eq!(p as usize & HUGE_PAGE_MASK, 0);

        let memory = Memory::new(p as *mut u8, HUGE_PAGE_SIZE);
        if log_enabled!(log::Level::Debug) {
            memory.log_pfns(log::Level::Debug);
        }
        if let Ok(ranges) = memory.consec_pfns()
            && (ranges.len() != 1 || ranges[0].start.as_usize() & HUGE_PAGE_MASK != 0)
        {
            warn!("region {} is not backed by one aligned huge page", index);
        }
        Ok(memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peen_core::memory::BytePointer;

    #[test]
    fn test_parse_thp_enabled() {
        assert!(parse_thp_enabled("[always] madvise never"));
        assert!(parse_thp_enabled("always [madvise] never"));
        assert!(!parse_thp_enabled("always madvise [never]"));
        assert!(!parse_thp_enabled(""));
    }

    #[test]
    #[ignore]
    fn test_map_region_at_fixed_base() {
        let mut allocator = ThpAllocator::default();
        let memory = allocator.map_region(1).expect("mapping failed");
        assert_eq!(memory.ptr() as usize, 1 << HUGE_PAGE_SHIFT);
        assert_eq!(memory.len(), HUGE_PAGE_SIZE);
        memory.dealloc();
    }
}
