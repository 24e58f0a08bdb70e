//! Memory types for the EPT identity map, derived from the variable-range MTRRs.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 12.11 MEMORY TYPE RANGE REGISTERS (MTRRS)

use {
    crate::utils::instructions::rdmsr,
    alloc::vec::Vec,
    core::ops::Range,
    x86::msr::{IA32_MTRRCAP, IA32_MTRR_PHYSBASE0, IA32_MTRR_PHYSMASK0},
};

/// Memory types an MTRR can assign.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mtrr {
    /// Uncacheable (UC)
    Uncacheable = 0,
    /// Write-combining (WC)
    WriteCombining = 1,
    /// Write-through (WT)
    WriteThrough = 4,
    /// Write-protected (WP)
    WriteProtected = 5,
    /// Write-back (WB)
    WriteBack = 6,
}

impl Mtrr {
    /// Decodes the type field of an `IA32_MTRR_PHYSBASEn` MSR.
    pub const fn from_raw(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Uncacheable),
            1 => Some(Self::WriteCombining),
            4 => Some(Self::WriteThrough),
            5 => Some(Self::WriteProtected),
            6 => Some(Self::WriteBack),
            _ => None,
        }
    }

    /// Builds the list of enabled variable ranges whose type differs from write-back.
    pub fn build_mtrr_map() -> Vec<MtrrRangeDescriptor> {
        let count = rdmsr(IA32_MTRRCAP) as u32 & 0xFF;

        let descriptors: Vec<MtrrRangeDescriptor> = (0..count)
            .filter_map(|index| {
                let base = rdmsr(IA32_MTRR_PHYSBASE0 + index * 2);
                let mask = rdmsr(IA32_MTRR_PHYSMASK0 + index * 2);
                MtrrRangeDescriptor::from_msrs(base, mask)
            })
            .filter(|descriptor| descriptor.memory_type != Mtrr::WriteBack)
            .collect();

        for descriptor in &descriptors {
            log::info!(
                "MTRR Range: Base={:#x} End={:#x} Type={:?}",
                descriptor.base_address,
                descriptor.end_address,
                descriptor.memory_type
            );
        }

        descriptors
    }

    /// Memory type for `range`, defaulting to write-back.
    ///
    /// Uncacheable takes precedence over every other type; otherwise the last matching
    /// descriptor wins.
    pub fn find(mtrr_map: &[MtrrRangeDescriptor], range: Range<u64>) -> Mtrr {
        let mut memory_type = Mtrr::WriteBack;

        for descriptor in mtrr_map {
            if range.start >= descriptor.base_address && range.end <= descriptor.end_address + 1 {
                if descriptor.memory_type == Mtrr::Uncacheable {
                    return Mtrr::Uncacheable;
                }
                memory_type = descriptor.memory_type;
            }
        }

        memory_type
    }
}

/// An enabled variable MTRR range, with an inclusive end address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MtrrRangeDescriptor {
    pub base_address: u64,
    pub end_address: u64,
    pub memory_type: Mtrr,
}

impl MtrrRangeDescriptor {
    /// Valid bit of `IA32_MTRR_PHYSMASKn`.
    const VALID: u64 = 1 << 11;
    const ADDR_MASK: u64 = !0xFFF;

    /// Decodes an `IA32_MTRR_PHYSBASEn`/`IA32_MTRR_PHYSMASKn` pair, or `None` if the range
    /// is disabled, has no address bits in its mask or carries a reserved type.
    ///
    /// Reference: Figure 12-8. IA32_MTRR_PHYSBASEn and IA32_MTRR_PHYSMASKn Variable-Range Register Pair
    pub fn from_msrs(base: u64, mask: u64) -> Option<Self> {
        if mask & Self::VALID == 0 {
            return None;
        }

        let address_mask = mask & Self::ADDR_MASK;
        if address_mask == 0 {
            log::warn!("Ignoring variable MTRR with an empty mask: base={:#x} mask={:#x}", base, mask);
            return None;
        }

        let memory_type = Mtrr::from_raw(base as u8)?;
        let base_address = base & Self::ADDR_MASK;
        let size = 1u64 << address_mask.trailing_zeros();

        Some(Self {
            base_address,
            end_address: base_address.saturating_add(size - 1),
            memory_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const _2MB: u64 = 0x20_0000;

    #[test]
    fn decodes_variable_range() {
        // 256 MB uncacheable range at 3.75 GB.
        let descriptor = MtrrRangeDescriptor::from_msrs(0xF000_0000, 0xF_F000_0800).unwrap();
        assert_eq!(descriptor.base_address, 0xF000_0000);
        assert_eq!(descriptor.end_address, 0xFFFF_FFFF);
        assert_eq!(descriptor.memory_type, Mtrr::Uncacheable);

        assert_eq!(MtrrRangeDescriptor::from_msrs(0xF000_0000, 0xF_F000_0000), None);
    }

    #[test]
    fn valid_range_without_mask_bits_is_ignored() {
        assert_eq!(MtrrRangeDescriptor::from_msrs(0x6, 0x800), None);
    }

    #[test]
    fn uncacheable_wins_and_default_is_write_back() {
        let map = [
            MtrrRangeDescriptor { base_address: 0, end_address: 0x3FF_FFFF, memory_type: Mtrr::WriteThrough },
            MtrrRangeDescriptor { base_address: 0x20_0000, end_address: 0x3F_FFFF, memory_type: Mtrr::Uncacheable },
        ];

        assert_eq!(Mtrr::find(&map, 0.._2MB), Mtrr::WriteThrough);
        assert_eq!(Mtrr::find(&map, _2MB.._2MB * 2), Mtrr::Uncacheable);
        assert_eq!(Mtrr::find(&map, 0x400_0000..0x400_0000 + _2MB), Mtrr::WriteBack);
    }
}
