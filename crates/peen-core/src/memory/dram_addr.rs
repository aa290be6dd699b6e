use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::util::HUGE_PAGE_SHIFT;
use serde::Deserialize;
use thiserror::Error;

fn parity(value: usize) -> u8 {
    (value.count_ones() & 1) as u8
}

/// DRAM coordinate of a byte inside the huge-page buffer.
///
/// Carries one parity bit per configured address function (channel, rank and
/// bank selection collapse into this tuple) plus the row number extracted
/// under the row bitmask. Column bits are not represented; converting back to
/// an offset yields the canonical start of the row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct DramAddr {
    /// One parity bit per address function, in function order
    pub bank_bits: Vec<u8>,
    /// Row number
    pub row: usize,
}

impl Display for DramAddr {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "(bank {}, row {})", self.bank(), self.row)
    }
}

impl DramAddr {
    /// Packs the function parity bits into a bank index (bit `i` of the
    /// result is the parity of function `i`).
    pub fn bank(&self) -> usize {
        self.bank_bits
            .iter()
            .enumerate()
            .fold(0, |acc, (i, &bit)| acc | ((bit as usize) << i))
    }

    /// Builds the coordinate of `row` in `bank`, unpacking the bank index
    /// into one bit per address function.
    pub fn for_bank(bank: usize, row: usize, config: &DramConfig) -> DramAddr {
        debug_assert!(bank < config.bank_count());
        let bank_bits = (0..config.function_masks.len())
            .map(|i| ((bank >> i) & 1) as u8)
            .collect();
        DramAddr { bank_bits, row }
    }

    /// Decodes a huge-page offset into its DRAM coordinate.
    ///
    /// Each bank bit is the population parity of the offset under the
    /// corresponding function mask; the row is the offset under the row mask,
    /// shifted down to the mask's least significant set bit.
    pub fn from_offset(offset: usize, config: &DramConfig) -> DramAddr {
        let bank_bits = config
            .function_masks
            .iter()
            .map(|&mask| parity(offset & mask))
            .collect();
        let row = (offset & config.row_mask) >> config.row_shift();
        DramAddr { bank_bits, row }
    }

    /// Encodes this coordinate back into a huge-page offset.
    ///
    /// Starts from the row bits and, for every function whose parity over the
    /// partial offset disagrees with the requested bank bit, toggles that
    /// function's writable bit (its lowest set bit outside the row mask).
    /// The result is the canonical row-start offset; callers OR it with the
    /// buffer base to obtain a pointer.
    pub fn to_offset(&self, config: &DramConfig) -> usize {
        debug_assert_eq!(self.bank_bits.len(), config.function_masks.len());
        debug_assert!(self.row < config.row_count());
        let mut offset = self.row << config.row_shift();
        for (i, &mask) in config.function_masks.iter().enumerate() {
            if parity(offset & mask) == self.bank_bits[i] {
                continue;
            }
            offset ^= config.writable_bit(mask);
        }
        offset
    }
}

/// Errors while loading or validating a DRAM configuration.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum DramConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("row mask must not be zero")]
    EmptyRowMask,
    #[error("mask {0:#x} lies outside the huge page window")]
    MaskOutOfRange(usize),
    #[error("function mask {0:#x} has no writable bit outside the row mask")]
    NoWritableBit(usize),
    #[error("writable bit {0:#x} is shared between function masks")]
    SharedWritableBit(usize),
}

/// DRAM addressing configuration.
///
/// An ordered list of XOR function bitmasks (4 on DDR3, 6 on DDR4) plus one
/// row bitmask, all inside the low 21 bits of a physical address. Immutable
/// for a run.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DramConfig {
    /// Physical address bitmasks of the channel/rank/bank parity functions
    pub function_masks: Vec<usize>,
    /// Physical address bitmask of the row bits
    pub row_mask: usize,
}

impl DramConfig {
    /// The DDR3 functions of the target platform.
    pub fn ddr3() -> Self {
        DramConfig {
            function_masks: vec![
                0x22000,  // BA0(13, 17)
                0x44000,  // BA1(14, 18)
                0x110000, // BA2(16, 20)
                0x88000,  // RANK(15, 19)
            ],
            row_mask: 0x1e0000,
        }
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// masks do not satisfy [`DramConfig::validate`].
    pub fn from_jsonfile<P: AsRef<Path>>(filepath: P) -> Result<DramConfig, DramConfigError> {
        let mut file = File::open(filepath.as_ref())?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: DramConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the masks admit a well-defined inverse translation.
    ///
    /// Every function mask must carry at least one set bit outside the row
    /// mask (the writable bit toggled by [`DramAddr::to_offset`]), no two
    /// functions may share their writable bit, and all masks must stay inside
    /// the huge page window.
    ///
    /// # Errors
    ///
    /// Returns the first violated condition.
    pub fn validate(&self) -> Result<(), DramConfigError> {
        if self.row_mask == 0 {
            return Err(DramConfigError::EmptyRowMask);
        }
        if self.row_mask >> HUGE_PAGE_SHIFT != 0 {
            return Err(DramConfigError::MaskOutOfRange(self.row_mask));
        }
        for (i, &mask) in self.function_masks.iter().enumerate() {
            if mask == 0 || mask >> HUGE_PAGE_SHIFT != 0 {
                return Err(DramConfigError::MaskOutOfRange(mask));
            }
            if mask & !self.row_mask == 0 {
                return Err(DramConfigError::NoWritableBit(mask));
            }
            let bit = self.writable_bit(mask);
            for (j, &other) in self.function_masks.iter().enumerate() {
                if i != j && other & bit != 0 {
                    return Err(DramConfigError::SharedWritableBit(bit));
                }
            }
        }
        Ok(())
    }

    /// Shift of the row field (trailing zeros of the row mask).
    pub fn row_shift(&self) -> usize {
        self.row_mask.trailing_zeros() as usize
    }

    /// Number of rows addressable under the row mask.
    pub fn row_count(&self) -> usize {
        1 << self.row_mask.count_ones()
    }

    /// Number of banks addressable through the function list.
    pub fn bank_count(&self) -> usize {
        1 << self.function_masks.len()
    }

    /// The single bit of `mask` that the inverse translation may toggle:
    /// the lowest set bit outside the row mask.
    fn writable_bit(&self, mask: usize) -> usize {
        let outside = mask & !self.row_mask;
        debug_assert_ne!(outside, 0, "mask {:#x} has no bit outside the row mask", mask);
        1 << outside.trailing_zeros()
    }
}

/// Returns the offset of the start of the row containing `offset`, by
/// round-tripping through [`DramAddr`].
pub fn row_align(offset: usize, config: &DramConfig) -> usize {
    DramAddr::from_offset(offset, config).to_offset(config)
}

/// Row placement selector for [`adjacent_row`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowNeighbor {
    /// The row immediately before
    Previous,
    /// The row immediately after
    Next,
}

/// Returns the start offset of the row immediately before or after the row
/// containing `offset`, in the same bank.
pub fn adjacent_row(offset: usize, neighbor: RowNeighbor, config: &DramConfig) -> usize {
    let mut dram = DramAddr::from_offset(offset, config);
    dram.row = match neighbor {
        RowNeighbor::Previous => {
            assert!(dram.row > 0, "no row before row 0");
            dram.row - 1
        }
        RowNeighbor::Next => dram.row + 1,
    };
    dram.to_offset(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::HUGE_PAGE_SIZE;

    #[test]
    fn test_decode_known_offset() {
        let config = DramConfig::ddr3();
        let dram = DramAddr::from_offset(0x22000, &config);
        // 0x22000 hits both bits of BA0, so every parity is even
        assert_eq!(dram.bank_bits, vec![0, 0, 0, 0]);
        assert_eq!(dram.row, (0x22000 & 0x1e0000) >> 17);
        assert_eq!(dram.row, 1);
        assert_eq!(dram.bank(), 0);
    }

    #[test]
    fn test_encode_sets_requested_parity() {
        let config = DramConfig::ddr3();
        let dram = DramAddr {
            bank_bits: vec![1, 0, 0, 0],
            row: 3,
        };
        let offset = dram.to_offset(&config);
        assert_eq!(offset & config.row_mask, 3 << 17);
        assert_eq!((offset & 0x22000).count_ones() & 1, 1);
        assert_eq!(offset, 0x64000);
    }

    #[test]
    fn test_row_align() {
        let config = DramConfig::ddr3();
        assert_eq!(row_align(0x60123, &config), 0x60000);
    }

    #[test]
    fn test_adjacent_row() {
        let config = DramConfig::ddr3();
        for bank in 0..config.bank_count() {
            let row5 = DramAddr::for_bank(bank, 5, &config).to_offset(&config);
            let row6 = DramAddr::for_bank(bank, 6, &config).to_offset(&config);
            assert_eq!(adjacent_row(row5, RowNeighbor::Next, &config), row6);
            assert_eq!(adjacent_row(row6, RowNeighbor::Previous, &config), row5);
            // next-then-previous lands back in the same row
            let back = adjacent_row(
                adjacent_row(row5 + 0x123, RowNeighbor::Next, &config),
                RowNeighbor::Previous,
                &config,
            );
            assert_eq!(back, row_align(row5 + 0x123, &config));
        }
    }

    #[test]
    fn test_round_trip_dram_to_offset() {
        let config = DramConfig::ddr3();
        for bank in 0..config.bank_count() {
            for row in 0..config.row_count() {
                let dram = DramAddr::for_bank(bank, row, &config);
                let offset = dram.to_offset(&config);
                assert!(offset < HUGE_PAGE_SIZE);
                assert_eq!(DramAddr::from_offset(offset, &config), dram);
            }
        }
    }

    #[test]
    fn test_round_trip_row_starts() {
        let config = DramConfig::ddr3();
        for bank in 0..config.bank_count() {
            for row in 0..config.row_count() {
                let start = DramAddr::for_bank(bank, row, &config).to_offset(&config);
                assert_eq!(
                    DramAddr::from_offset(start, &config).to_offset(&config),
                    start
                );
            }
        }
    }

    #[test]
    fn test_parity_consistency() {
        let config = DramConfig::ddr3();
        for offset in (0..HUGE_PAGE_SIZE).step_by(0x1357) {
            let dram = DramAddr::from_offset(offset, &config);
            for (i, &mask) in config.function_masks.iter().enumerate() {
                assert_eq!(
                    dram.bank_bits[i] as u32,
                    (offset & mask).count_ones() % 2,
                    "parity mismatch for offset {:#x}, mask {:#x}",
                    offset,
                    mask
                );
            }
        }
    }

    #[test]
    fn test_validate_rejects_mask_inside_row_bits() {
        let config = DramConfig {
            function_masks: vec![0x180000],
            row_mask: 0x1e0000,
        };
        assert!(matches!(
            config.validate(),
            Err(DramConfigError::NoWritableBit(0x180000))
        ));
    }

    #[test]
    fn test_validate_rejects_shared_writable_bit() {
        let config = DramConfig {
            function_masks: vec![0x22000, 0x2000],
            row_mask: 0x1e0000,
        };
        assert!(matches!(
            config.validate(),
            Err(DramConfigError::SharedWritableBit(0x2000))
        ));
    }

    #[test]
    fn test_from_jsonfile() -> anyhow::Result<()> {
        let mut path = std::env::temp_dir();
        path.push(format!("peen-dram-config-{}.json", std::process::id()));
        std::fs::write(
            &path,
            format!(
                "{{ \"function_masks\": [{}, {}, {}, {}], \"row_mask\": {} }}",
                0x22000, 0x44000, 0x110000, 0x88000, 0x1e0000
            ),
        )?;
        let config = DramConfig::from_jsonfile(&path)?;
        assert_eq!(config, DramConfig::ddr3());
        std::fs::remove_file(&path)?;
        Ok(())
    }
}
