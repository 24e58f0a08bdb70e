//! The EPT paging structures of one hierarchy: a PML4, one PML3 and 512 PML2 tables that
//! identity map the first 512 GB of guest-physical memory with 2 MB pages, plus PML1
//! tables for the 2 MB pages that were split into 4 KB pages.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 EPT Translation Mechanism

use {
    crate::{
        error::HypervisorError,
        intel::ept::mtrr::{Mtrr, MtrrRangeDescriptor},
        utils::{
            addresses::{pfn, AddressSpace},
            alloc::{box_zeroed, Zeroable},
        },
    },
    alloc::{boxed::Box, collections::BTreeMap},
    bitfield::bitfield,
    core::ptr::addr_of,
    static_assertions::const_assert_eq,
    x86::bits64::paging::{BASE_PAGE_SIZE, LARGE_PAGE_SIZE},
};

/// Number of entries in every EPT paging structure.
pub const ENTRIES: usize = 512;

bitfield! {
    /// An EPT paging-structure entry.
    ///
    /// With mode-based execute control enabled, `executable` grants execute access to
    /// supervisor-mode linear addresses and `user_mode_execute` to user-mode ones.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.2 Figure 29-1. Formats of EPTP and EPT Paging-Structure Entries
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct Entry(u64);
    impl Debug;

    pub readable, set_readable: 0;
    pub writable, set_writable: 1;
    pub executable, set_executable: 2;
    pub memory_type, set_memory_type: 5, 3;
    pub ignore_pat, set_ignore_pat: 6;
    pub large, set_large: 7;
    pub accessed, set_accessed: 8;
    pub dirty, set_dirty: 9;
    pub user_mode_execute, set_user_mode_execute: 10;
    pub pfn, set_pfn: 51, 12;
}

impl Entry {
    /// Grants read, write and execute, the permissions of a freshly identity mapped entry.
    fn set_full_access(&mut self) {
        self.set_readable(true);
        self.set_writable(true);
        self.set_executable(true);
    }
}

/// One 4 KB EPT paging structure.
#[repr(C, align(4096))]
#[derive(Debug, Clone, Copy)]
pub struct Table {
    pub entries: [Entry; ENTRIES],
}

unsafe impl Zeroable for Table {}

const_assert_eq!(core::mem::size_of::<Entry>(), 8);
const_assert_eq!(core::mem::size_of::<Table>(), BASE_PAGE_SIZE);

#[repr(C, align(4096))]
struct Tables {
    pml4: Table,
    pml3: Table,
    pml2: [Table; ENTRIES],
}

unsafe impl Zeroable for Tables {}

const_assert_eq!(core::mem::size_of::<Tables>(), (ENTRIES + 2) * BASE_PAGE_SIZE);

/// An EPT hierarchy.
pub struct Ept {
    tables: Box<Tables>,
    /// PML1 tables keyed by the linear index of the PML2 entry they replaced.
    pml1: BTreeMap<usize, Box<Table>>,
}

impl Ept {
    /// Allocates an empty hierarchy. Every entry is not-present until [`Ept::build_identity_map`].
    pub fn new() -> Result<Self, HypervisorError> {
        Ok(Self {
            tables: box_zeroed()?,
            pml1: BTreeMap::new(),
        })
    }

    /// Identity maps the first 512 GB of guest-physical memory with read, write and execute
    /// access, using 2 MB pages whose memory type comes from `mtrr_map`.
    pub fn build_identity_map<A: AddressSpace + ?Sized>(
        &mut self,
        address_space: &A,
        mtrr_map: &[MtrrRangeDescriptor],
    ) -> Result<(), HypervisorError> {
        log::trace!("Building identity map for EPT");

        self.pml1.clear();
        let tables = &mut *self.tables;

        let pml3_pa = address_space.pa_from_va(addr_of!(tables.pml3) as u64);
        tables.pml4.entries[0].set_full_access();
        tables.pml4.entries[0].set_pfn(pfn(pml3_pa));

        let mut pa = 0u64;
        for (i, pml3e) in tables.pml3.entries.iter_mut().enumerate() {
            let pml2_pa = address_space.pa_from_va(addr_of!(tables.pml2[i]) as u64);
            pml3e.set_full_access();
            pml3e.set_pfn(pfn(pml2_pa));

            for pml2e in tables.pml2[i].entries.iter_mut() {
                let memory_type = Mtrr::find(mtrr_map, pa..pa + LARGE_PAGE_SIZE as u64);

                *pml2e = Entry(0);
                pml2e.set_full_access();
                pml2e.set_memory_type(memory_type as u64);
                pml2e.set_large(true);
                pml2e.set_pfn(pfn(pa));

                pa += LARGE_PAGE_SIZE as u64;
            }
        }

        Ok(())
    }

    /// The top-level entry mapping the first 512 GB, whose execute bits gate every
    /// translation below it.
    pub fn pml4_entry(&self) -> &Entry {
        &self.tables.pml4.entries[0]
    }

    pub fn pml4_entry_mut(&mut self) -> &mut Entry {
        &mut self.tables.pml4.entries[0]
    }

    /// Returns the leaves covering the 2 MB page that contains `guest_pa`: its 512 PML1
    /// entries if it has been split, the large PML2 entry alone otherwise. `None` beyond the
    /// first 512 GB.
    pub fn large_page_leaves_mut(&mut self, guest_pa: u64) -> Option<&mut [Entry]> {
        let (pml3_index, pml2_index) = Self::pml2_indexes(guest_pa)?;

        match self.pml1.get_mut(&(pml3_index * ENTRIES + pml2_index)) {
            Some(pml1) => Some(&mut pml1.entries[..]),
            None => Some(core::slice::from_mut(&mut self.tables.pml2[pml3_index].entries[pml2_index])),
        }
    }

    /// Returns the leaf entry mapping `guest_pa`: a PML1 entry if its 2 MB page has been
    /// split, the large PML2 entry otherwise.
    pub fn leaf_entry_mut(&mut self, guest_pa: u64) -> Option<&mut Entry> {
        let (pml3_index, pml2_index) = Self::pml2_indexes(guest_pa)?;

        match self.pml1.get_mut(&(pml3_index * ENTRIES + pml2_index)) {
            Some(pml1) => Some(&mut pml1.entries[Self::pml1_index(guest_pa)]),
            None => Some(&mut self.tables.pml2[pml3_index].entries[pml2_index]),
        }
    }

    /// Splits the 2 MB page containing `guest_pa` into 512 4 KB pages that inherit its
    /// permissions and memory type. Splitting an already split page does nothing.
    ///
    /// The PML2 entry becomes a fully permissive directory, so the PML1 leaves alone decide
    /// the access rights of each 4 KB page.
    pub fn split_large_page<A: AddressSpace + ?Sized>(
        &mut self,
        guest_pa: u64,
        address_space: &A,
    ) -> Result<(), HypervisorError> {
        let (pml3_index, pml2_index) =
            Self::pml2_indexes(guest_pa).ok_or(HypervisorError::UnresolvablePhysicalAddress)?;
        let key = pml3_index * ENTRIES + pml2_index;

        let pml2e = self.tables.pml2[pml3_index].entries[pml2_index];
        if self.pml1.contains_key(&key) || !pml2e.large() {
            return Ok(());
        }

        log::trace!("Splitting 2MB page at {:#x} into 4KB pages", guest_pa);

        let mut pml1: Box<Table> = box_zeroed()?;
        let base_pfn = pml2e.pfn();
        for (i, pml1e) in pml1.entries.iter_mut().enumerate() {
            *pml1e = pml2e;
            pml1e.set_large(false);
            pml1e.set_pfn(base_pfn + i as u64);
        }

        let pml1_pa = address_space.pa_from_va(addr_of!(*pml1) as u64);

        let mut directory = Entry(0);
        directory.set_full_access();
        directory.set_user_mode_execute(true);
        directory.set_pfn(pfn(pml1_pa));

        self.pml1.insert(key, pml1);
        self.tables.pml2[pml3_index].entries[pml2_index] = directory;

        Ok(())
    }

    /// Visits every PML4, PML3, PML2 and PML1 entry of the hierarchy.
    pub fn for_each_entry_mut(&mut self, mut visit: impl FnMut(&mut Entry)) {
        let tables = &mut *self.tables;

        tables.pml4.entries.iter_mut().for_each(&mut visit);
        tables.pml3.entries.iter_mut().for_each(&mut visit);
        tables
            .pml2
            .iter_mut()
            .flat_map(|table| table.entries.iter_mut())
            .for_each(&mut visit);
        self.pml1
            .values_mut()
            .flat_map(|table| table.entries.iter_mut())
            .for_each(&mut visit);
    }

    /// Creates an Extended Page Table Pointer (EPTP) with a Write-Back memory type and a
    /// 4-level page walk for this hierarchy.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.11 Extended-Page-Table Pointer (EPTP)
    pub fn create_eptp_with_wb_and_4lvl_walk<A: AddressSpace + ?Sized>(
        &self,
        address_space: &A,
    ) -> Result<u64, HypervisorError> {
        let ept_pml4_base_addr = address_space.pa_from_va(addr_of!(self.tables.pml4) as u64);

        // Page-walk length minus one, in bits 5:3.
        const EPT_PAGE_WALK_LENGTH_4: u64 = 3 << 3;
        const EPT_MEMORY_TYPE_WB: u64 = Mtrr::WriteBack as u64;

        if ept_pml4_base_addr.trailing_zeros() >= 12 {
            Ok(ept_pml4_base_addr | EPT_PAGE_WALK_LENGTH_4 | EPT_MEMORY_TYPE_WB)
        } else {
            Err(HypervisorError::InvalidEptPml4BaseAddress)
        }
    }

    fn pml2_indexes(guest_pa: u64) -> Option<(usize, usize)> {
        let large_page = guest_pa / LARGE_PAGE_SIZE as u64;
        if large_page >= (ENTRIES * ENTRIES) as u64 {
            return None;
        }

        let large_page = large_page as usize;
        Some((large_page / ENTRIES, large_page % ENTRIES))
    }

    fn pml1_index(guest_pa: u64) -> usize {
        ((guest_pa / BASE_PAGE_SIZE as u64) % ENTRIES as u64) as usize
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {super::*, crate::utils::addresses::tests::MockAddressSpace};

    /// A hierarchy identity mapped with write-back memory and identity VA to PA translation.
    pub fn identity_ept() -> Ept {
        let mut ept = Ept::new().unwrap();
        ept.build_identity_map(&MockAddressSpace::new(0), &[]).unwrap();
        ept
    }

    #[test]
    fn identity_map_uses_large_write_back_pages() {
        let mut ept = identity_ept();

        let pml4e = *ept.pml4_entry();
        assert!(pml4e.readable() && pml4e.writable() && pml4e.executable());
        assert!(!pml4e.user_mode_execute());

        let leaf = *ept.leaf_entry_mut(0x1234_5678).unwrap();
        assert!(leaf.large());
        assert_eq!(leaf.memory_type(), Mtrr::WriteBack as u64);
        assert_eq!(leaf.pfn() << 12, 0x1220_0000);
    }

    #[test]
    fn identity_map_applies_mtrr_types() {
        let mut ept = Ept::new().unwrap();
        let mtrr_map = [MtrrRangeDescriptor {
            base_address: 0xC000_0000,
            end_address: 0xFFFF_FFFF,
            memory_type: Mtrr::Uncacheable,
        }];
        ept.build_identity_map(&MockAddressSpace::new(0), &mtrr_map).unwrap();

        assert_eq!(ept.leaf_entry_mut(0xFEE0_0000).unwrap().memory_type(), Mtrr::Uncacheable as u64);
        assert_eq!(ept.leaf_entry_mut(0x8000_0000).unwrap().memory_type(), Mtrr::WriteBack as u64);
    }

    #[test]
    fn addresses_beyond_512gb_are_unmapped() {
        let mut ept = identity_ept();
        assert!(ept.leaf_entry_mut(512 << 30).is_none());
        assert!(ept.large_page_leaves_mut(512 << 30).is_none());
        assert_eq!(ept.large_page_leaves_mut((512 << 30) - 1).map(|leaves| leaves.len()), Some(1));
    }

    #[test]
    fn split_creates_4kb_leaves_with_inherited_permissions() {
        let address_space = MockAddressSpace::new(0);
        let mut ept = identity_ept();

        ept.leaf_entry_mut(0x40_0000).unwrap().set_writable(false);
        ept.split_large_page(0x40_1000, &address_space).unwrap();
        assert_eq!(ept.large_page_leaves_mut(0x5F_F000).map(|leaves| leaves.len()), Some(ENTRIES));

        let directory = ept.tables.pml2[0].entries[2];
        assert!(!directory.large());
        assert_eq!(directory.memory_type(), 0);
        assert!(directory.writable() && directory.user_mode_execute());

        let leaf = *ept.leaf_entry_mut(0x40_3000).unwrap();
        assert!(!leaf.large());
        assert!(!leaf.writable());
        assert_eq!(leaf.pfn() << 12, 0x40_3000);

        // Idempotent.
        ept.split_large_page(0x40_0000, &address_space).unwrap();
        assert_eq!(ept.leaf_entry_mut(0x40_3000).unwrap().pfn() << 12, 0x40_3000);
    }

    #[test]
    fn eptp_encodes_write_back_and_walk_length() {
        let ept = identity_ept();
        let eptp = ept.create_eptp_with_wb_and_4lvl_walk(&MockAddressSpace::new(0)).unwrap();

        assert_eq!(eptp & 0x7, 6);
        assert_eq!((eptp >> 3) & 0x7, 3);
        assert_eq!(eptp & !0xFFF, addr_of!(*ept.pml4_entry()) as u64);
    }
}
