use std::ops::Range;
use std::ptr::null_mut;

use super::BytePointer;
use crate::memory::virt_to_phys::{LinuxPageMap, LinuxPageMapError, PhysAddr};
use crate::util::PAGE_SIZE;
use libc::{MAP_ANONYMOUS, MAP_POPULATE, MAP_SHARED};
use log::{log, warn};

/// An owned, mapped memory region.
///
/// All derived locations (aggressor rows, victim rows, target pages) are byte
/// offsets into this region; the DRAM geometry layer never hands out raw
/// pointers of its own.
#[derive(Clone, Debug)]
pub struct Memory {
    /// Region pointer
    pub ptr: *mut u8,
    /// Region length in bytes
    pub len: usize,
}

impl Memory {
    /// Creates a memory region from an existing mapping.
    pub fn new(ptr: *mut u8, len: usize) -> Self {
        Memory { ptr, len }
    }

    /// Maps an anonymous region of the given size.
    ///
    /// The region is not huge-page backed and lands at a kernel-chosen base.
    /// Useful for scratch buffers and for exercising the offset arithmetic in
    /// tests; the attack itself maps its regions through a
    /// [`RegionAllocator`](crate::allocator::RegionAllocator).
    ///
    /// # Errors
    ///
    /// Returns an I/O error if mmap fails.
    pub fn mmap(size: usize) -> std::io::Result<Self> {
        let p = unsafe {
            libc::mmap(
                null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                MAP_SHARED | MAP_ANONYMOUS | MAP_POPULATE,
                -1,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error());
        }
        unsafe { libc::memset(p, 0x00, size) };
        Ok(Memory::new(p as *mut u8, size))
    }

    /// Unmaps the region. Consumes self.
    pub fn dealloc(self) {
        unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
    }
}

impl BytePointer for Memory {
    fn addr(&self, offset: usize) -> *mut u8 {
        assert!(
            offset < self.len,
            "Memory::addr failed. Offset {} >= {}",
            offset,
            self.len
        );
        unsafe { self.ptr.byte_add(offset) }
    }

    fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    fn len(&self) -> usize {
        self.len
    }
}

impl Memory {
    /// Returns the consecutive physical address ranges backing this region.
    ///
    /// # Errors
    ///
    /// Returns an error if `/proc/self/pagemap` cannot be read.
    pub fn consec_pfns(&self) -> Result<Vec<Range<PhysAddr>>, LinuxPageMapError> {
        let mut resolver = LinuxPageMap::new()?;
        let pfns = resolver.get_phys_range(self.ptr as u64, self.len)?;
        let mut ranges: Vec<Range<PhysAddr>> = vec![];
        for pfn in pfns {
            match ranges.last_mut() {
                Some(last) if last.end == pfn => {
                    last.end = PhysAddr::new(pfn.as_usize() + PAGE_SIZE)
                }
                _ => ranges.push(pfn..PhysAddr::new(pfn.as_usize() + PAGE_SIZE)),
            }
        }
        Ok(ranges)
    }

    /// Logs the physical ranges of this region at the given level.
    pub fn log_pfns(&self, level: log::Level) {
        match self.consec_pfns() {
            Ok(ranges) => {
                for range in &ranges {
                    log!(
                        level,
                        "{:p}..[{:04} KB]..{:p}",
                        range.start,
                        (range.end.as_usize() - range.start.as_usize()) / 1024,
                        range.end
                    );
                }
            }
            Err(e) => warn!("failed to resolve PFNs: {}", e),
        }
    }
}
