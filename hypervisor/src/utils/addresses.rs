//! Guest address-space access used while walking a process' page tables.
//!
//! The walk needs three things from the platform: the CR3 currently loaded, a way to load
//! another one, and a virtual mapping of a physical page-table page. [`AddressSpace`]
//! bundles them so the walk can run against an in-memory page-table image in tests.

use x86::bits64::paging::BASE_PAGE_SHIFT;

/// One 4 KB page-table page viewed as raw entries.
pub type PageTable = [u64; 512];

/// Bits 51:12 of CR3 and of every paging-structure entry hold a page frame address.
pub const PFN_MASK: u64 = 0x000F_FFFF_FFFF_F000;

/// Page-table access for the address space the hypervisor is running in.
pub trait AddressSpace {
    /// The value currently loaded in CR3.
    fn current_cr3(&self) -> u64;

    /// Loads `cr3`.
    fn write_cr3(&self, cr3: u64);

    /// Converts a virtual address of hypervisor memory to its physical address.
    fn pa_from_va(&self, va: u64) -> u64;

    /// Maps the page-table page at physical address `pa`, or `None` if it has no
    /// virtual mapping.
    fn page_table(&self, pa: u64) -> Option<&PageTable>;
}

/// Loads a CR3 for as long as the guard lives and restores the previous one on drop.
pub struct Cr3Guard<'a, A: AddressSpace + ?Sized> {
    address_space: &'a A,
    previous: u64,
}

impl<'a, A: AddressSpace + ?Sized> Cr3Guard<'a, A> {
    pub fn switch(address_space: &'a A, cr3: u64) -> Self {
        let previous = address_space.current_cr3();
        address_space.write_cr3(cr3);

        Self { address_space, previous }
    }
}

impl<A: AddressSpace + ?Sized> Drop for Cr3Guard<'_, A> {
    fn drop(&mut self) {
        self.address_space.write_cr3(self.previous);
    }
}

/// Page frame number of a physical address.
pub const fn pfn(pa: u64) -> u64 {
    pa >> BASE_PAGE_SHIFT
}

/// The Windows kernel address space.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemAddressSpace;

#[cfg(windows)]
impl AddressSpace for SystemAddressSpace {
    fn current_cr3(&self) -> u64 {
        crate::utils::instructions::cr3()
    }

    fn write_cr3(&self, cr3: u64) {
        crate::utils::instructions::cr3_write(cr3)
    }

    fn pa_from_va(&self, va: u64) -> u64 {
        unsafe { wdk_sys::ntddk::MmGetPhysicalAddress(va as _).QuadPart as u64 }
    }

    fn page_table(&self, pa: u64) -> Option<&PageTable> {
        let mut physical_address: wdk_sys::PHYSICAL_ADDRESS = unsafe { core::mem::zeroed() };
        physical_address.QuadPart = (pa & PFN_MASK) as i64;

        let va = unsafe { wdk_sys::ntddk::MmGetVirtualForPhysical(physical_address) } as *const PageTable;

        // SAFETY: a non-null result maps a whole resident physical page.
        unsafe { va.as_ref() }
    }
}
