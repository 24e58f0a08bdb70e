//! Execute-only layout of the mode-based execute hierarchy.
//!
//! The layout grants user-mode execute everywhere and removes write access from RAM, so the
//! two execute bits of the top-level entry alone decide which privilege level may fetch
//! instructions. Pages holding a watched process' own page tables are then made writable again
//! so the guest can keep updating them.

use {
    crate::{
        error::HypervisorError,
        intel::ept::paging::Ept,
        utils::{
            addresses::{AddressSpace, Cr3Guard, PFN_MASK},
            memory_map::RamRegions,
        },
    },
    x86::bits64::paging::{PDEntry, PDFlags, PDPTEntry, PDPTFlags, PML4Entry, PTEntry, LARGE_PAGE_SIZE},
};

/// Sets user-mode execute on every entry of `ept` and clears write access on each 2 MB page
/// touched by a RAM range, on its 4 KB leaves if it has been split. MMIO keeps its permissions.
pub fn build_execute_only_layout(ept: &mut Ept, ram_regions: &RamRegions) -> Result<(), HypervisorError> {
    ept.for_each_entry_mut(|entry| entry.set_user_mode_execute(true));

    for range in ram_regions.iter() {
        for address in (range.base..range.end()).step_by(LARGE_PAGE_SIZE) {
            if let Some(leaves) = ept.large_page_leaves_mut(address) {
                leaves.iter_mut().for_each(|leaf| leaf.set_writable(false));
            }
        }
    }

    log::trace!("Execute-only layout applied to {} RAM ranges", ram_regions.len());

    Ok(())
}

/// Grants read and write on the EPT leaves backing every page-table page of the address
/// space rooted at `target_cr3`.
///
/// The 2 MB page holding each referenced frame is split first, so only the referenced 4 KB
/// page becomes writable. The walk runs with `kernel_cr3` loaded so the guest tables can be
/// mapped; the CR3 that was loaded on entry is restored on every path. Large guest pages
/// (1 GB and 2 MB) end the descent, and tables without a virtual mapping are skipped.
///
/// # Errors
///
/// [`HypervisorError::UnresolvablePhysicalAddress`] if the root table itself cannot be mapped,
/// or [`HypervisorError::MemoryAllocationFailed`] if a 2 MB page cannot be split.
pub fn prime_execute_permissions<A: AddressSpace + ?Sized>(
    ept: &mut Ept,
    address_space: &A,
    target_cr3: u64,
    kernel_cr3: u64,
) -> Result<(), HypervisorError> {
    let _cr3 = Cr3Guard::switch(address_space, kernel_cr3);

    let root = target_cr3 & PFN_MASK;
    let pml4 = address_space
        .page_table(root)
        .ok_or(HypervisorError::UnresolvablePhysicalAddress)?;
    grant_read_write(ept, address_space, root)?;

    for pml4e in pml4.iter().map(|&raw| PML4Entry(raw)).filter(|entry| entry.is_present()) {
        let pdpt_pa = pml4e.address().as_u64();
        grant_read_write(ept, address_space, pdpt_pa)?;

        let Some(pdpt) = address_space.page_table(pdpt_pa) else {
            continue;
        };

        for pdpte in pdpt.iter().map(|&raw| PDPTEntry(raw)).filter(|entry| entry.is_present()) {
            let pd_pa = pdpte.address().as_u64();
            grant_read_write(ept, address_space, pd_pa)?;

            if pdpte.flags().contains(PDPTFlags::PS) {
                continue;
            }

            let Some(pd) = address_space.page_table(pd_pa) else {
                continue;
            };

            for pde in pd.iter().map(|&raw| PDEntry(raw)).filter(|entry| entry.is_present()) {
                let pt_pa = pde.address().as_u64();
                grant_read_write(ept, address_space, pt_pa)?;

                if pde.flags().contains(PDFlags::PS) {
                    continue;
                }

                let Some(pt) = address_space.page_table(pt_pa) else {
                    continue;
                };

                for pte in pt.iter().map(|&raw| PTEntry(raw)).filter(|entry| entry.is_present()) {
                    grant_read_write(ept, address_space, pte.address().as_u64())?;
                }
            }
        }
    }

    Ok(())
}

fn grant_read_write<A: AddressSpace + ?Sized>(ept: &mut Ept, address_space: &A, pa: u64) -> Result<(), HypervisorError> {
    if ept.leaf_entry_mut(pa).is_none() {
        log::trace!("No EPT leaf maps {:#x}", pa);
        return Ok(());
    }

    ept.split_large_page(pa, address_space)?;

    if let Some(leaf) = ept.leaf_entry_mut(pa) {
        leaf.set_readable(true);
        leaf.set_writable(true);
    }

    Ok(())
}
