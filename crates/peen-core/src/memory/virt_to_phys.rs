use std::fmt::{self, Debug, Formatter};

use crate::util::{PAGE_MASK, PAGE_SHIFT};
use log::warn;
use pagemap2::{PageMapError, VirtualMemoryArea};
use serde::Serialize;
use thiserror::Error;

/// Physical memory address.
///
/// A newtype wrapper around a physical address value.
#[repr(transparent)]
#[derive(Clone, Copy, Default, Serialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct PhysAddr(usize);

impl PhysAddr {
    /// Creates a new physical address.
    pub fn new(addr: usize) -> Self {
        PhysAddr(addr)
    }

    /// Returns the address as a usize.
    pub fn as_usize(&self) -> usize {
        self.0
    }
}

impl Debug for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("PhysAddr(0x{:02x})", self.0))
    }
}

impl fmt::Pointer for PhysAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:p}", self.0 as *const u8)
    }
}

impl From<PhysAddr> for usize {
    fn from(addr: PhysAddr) -> usize {
        addr.0
    }
}

/// Errors that can happen while reading `/proc/self/pagemap`
#[derive(Debug, Error)]
#[error(transparent)]
pub struct LinuxPageMapError(#[from] PageMapError);

/// Virtual to physical address translator using Linux pagemap.
///
/// Requires root privileges, otherwise the kernel reports PFN 0 for
/// every page.
pub struct LinuxPageMap {
    pagemap: pagemap2::PageMap,
}

impl LinuxPageMap {
    /// Creates a new pagemap resolver for the current process.
    ///
    /// # Errors
    ///
    /// Returns an error if opening `/proc/self/pagemap` fails.
    pub fn new() -> Result<LinuxPageMap, LinuxPageMapError> {
        Ok(LinuxPageMap {
            pagemap: pagemap2::PageMap::new(std::process::id() as u64)?,
        })
    }

    /// Translates a virtual address to a physical address.
    ///
    /// # Errors
    ///
    /// Returns an error if the pagemap entry for `virt` cannot be read.
    pub fn get_phys(&mut self, virt: u64) -> Result<PhysAddr, LinuxPageMapError> {
        let page_start = virt & !(PAGE_MASK as u64);
        let vma = VirtualMemoryArea::from((page_start, page_start + PAGE_MASK as u64));
        let entries = self.pagemap.pagemap_vma(&vma)?;
        assert_eq!(
            entries.len(),
            1,
            "got {} pagemap entries for virtual address 0x{:x}, expected exactly one",
            entries.len(),
            virt
        );
        let pfn = entries[0].pfn()?;
        if pfn == 0 {
            warn!(
                "got invalid PFN 0 for virtual address 0x{:x}. Are we root?",
                virt
            );
        }
        Ok(PhysAddr(
            ((pfn << PAGE_SHIFT) | (virt & PAGE_MASK as u64)) as usize,
        ))
    }

    /// Translates `len` bytes of virtual address space starting at `virt`
    /// into one physical page address per page.
    ///
    /// # Errors
    ///
    /// Returns an error if a pagemap entry cannot be read.
    pub fn get_phys_range(
        &mut self,
        virt: u64,
        len: usize,
    ) -> Result<Vec<PhysAddr>, LinuxPageMapError> {
        let vma = VirtualMemoryArea::from((virt, virt + len as u64));
        let entries = self.pagemap.pagemap_vma(&vma)?;
        entries
            .into_iter()
            .map(|entry| {
                entry
                    .pfn()
                    .map(|pfn| PhysAddr((pfn << PAGE_SHIFT) as usize))
                    .map_err(LinuxPageMapError::from)
            })
            .collect()
    }
}
