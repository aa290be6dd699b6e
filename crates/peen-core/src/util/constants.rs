/// Shift of a 4KB virtual memory page (12 bits)
pub const PAGE_SHIFT: usize = 12;
/// Bytes per virtual memory page
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
/// Low bits addressing a byte within a page
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Shift of a DRAM row (13 bits)
pub const ROW_SHIFT: usize = 13;
/// Bytes per DRAM row on the target DIMMs, two pages
pub const ROW_SIZE: usize = 1 << ROW_SHIFT;
/// Low bits addressing a byte within a row
pub const ROW_MASK: usize = ROW_SIZE - 1;

/// Bytes per cache line on x86_64
pub const CL_SIZE: usize = 64;

/// Shift of a 2MB transparent huge page (21 bits)
pub const HUGE_PAGE_SHIFT: usize = 21;
/// Bytes per transparent huge page, the size of one hammered region
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_SHIFT;
/// Low bits addressing a byte within a huge page; with an aligned huge page
/// behind the buffer these equal the low physical address bits
pub const HUGE_PAGE_MASK: usize = HUGE_PAGE_SIZE - 1;

/// Random bytes written at the start of every 4KB page to keep pages unique
/// until same-page merging is wanted
pub const ENTROPY_PADDING_SIZE: usize = size_of::<u64>();

/// Rows addressable through the DRAM functions inside one huge page bank
pub const CONTROLLED_ROWS: usize = 1 << 4;
/// Banks addressable through the DRAM functions inside one huge page
pub const CONTROLLED_BANKS: usize = 8;
/// Successive huge-page regions tried before a run gives up
pub const MAX_REGIONS: usize = 20;

/// Default row activations per hammering round (about 4.19 million)
pub const DEFAULT_ACTIVATIONS: u64 = 4 << 20;
/// Default hammering rounds per aggressor pair
pub const DEFAULT_HAMMERING_ROUNDS: u64 = 17;
/// Default number of random aggressor pairs
pub const DEFAULT_RANDOM_PAIRS: u64 = 1000;
