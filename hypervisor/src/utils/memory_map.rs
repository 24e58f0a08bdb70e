//! Physical RAM ranges reported by the firmware memory map.
//!
//! Captured once before the execute-trap engine is initialized and read-only afterwards.

use crate::config::MAX_RAM_RANGES;

/// A contiguous range of physical RAM.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RamRange {
    pub base: u64,
    pub size: u64,
}

impl RamRange {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }
}

/// Fixed-capacity table of physical RAM ranges.
#[derive(Debug, Clone, Copy)]
pub struct RamRegions {
    ranges: [RamRange; MAX_RAM_RANGES],
    count: usize,
}

impl Default for RamRegions {
    fn default() -> Self {
        Self::empty()
    }
}

impl RamRegions {
    pub const fn empty() -> Self {
        Self {
            ranges: [RamRange { base: 0, size: 0 }; MAX_RAM_RANGES],
            count: 0,
        }
    }

    /// Collects ranges until an all-zero terminator or until the table is full.
    pub fn from_ranges<I: IntoIterator<Item = RamRange>>(ranges: I) -> Self {
        let mut regions = Self::empty();

        for range in ranges {
            if range.base == 0 && range.size == 0 {
                break;
            }

            if regions.count == MAX_RAM_RANGES {
                log::warn!("Ignoring RAM ranges beyond the first {}", MAX_RAM_RANGES);
                break;
            }

            regions.ranges[regions.count] = range;
            regions.count += 1;
        }

        regions
    }

    pub fn iter(&self) -> impl Iterator<Item = &RamRange> {
        self.ranges[..self.count].iter()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Reads the ranges from `MmGetPhysicalMemoryRanges`.
    #[cfg(windows)]
    pub fn read() -> Result<Self, crate::error::HypervisorError> {
        use wdk_sys::ntddk::ExFreePool;

        #[repr(C)]
        struct PhysicalMemoryRange {
            base_address: i64,
            number_of_bytes: i64,
        }

        #[link(name = "ntoskrnl")]
        extern "system" {
            fn MmGetPhysicalMemoryRanges() -> *mut PhysicalMemoryRange;
        }

        let ranges = unsafe { MmGetPhysicalMemoryRanges() };
        if ranges.is_null() {
            return Err(crate::error::HypervisorError::MemoryRangesUnavailable);
        }

        let mut index = 0;
        let regions = Self::from_ranges(core::iter::from_fn(|| {
            // SAFETY: the array is terminated by an all-zero entry, at which iteration stops.
            let range = unsafe { &*ranges.add(index) };
            index += 1;

            Some(RamRange {
                base: range.base_address as u64,
                size: range.number_of_bytes as u64,
            })
        }));

        unsafe { ExFreePool(ranges as _) };

        for range in regions.iter() {
            log::info!("RAM range: base={:#x} size={:#x}", range.base, range.size);
        }

        Ok(regions)
    }
}
