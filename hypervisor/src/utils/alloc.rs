//! Heap helpers for paging structures.

use {
    crate::error::HypervisorError,
    alloc::boxed::Box,
    core::alloc::Layout,
};

/// Types for which the all-zero bit pattern is a valid value.
///
/// # Safety
///
/// Implementors must be plain data: integers, arrays and `repr(C)` structs thereof.
pub unsafe trait Zeroable: Sized {}

/// Allocates a zero-filled `T` directly on the heap.
///
/// Paging structures are far larger than a kernel stack, so they are never constructed by value.
pub fn box_zeroed<T: Zeroable>() -> Result<Box<T>, HypervisorError> {
    let layout = Layout::new::<T>();
    if layout.size() == 0 {
        return Err(HypervisorError::MemoryAllocationFailed);
    }

    let memory = unsafe { alloc::alloc::alloc_zeroed(layout) } as *mut T;
    if memory.is_null() {
        log::error!("Failed to allocate {:#x} bytes", layout.size());
        return Err(HypervisorError::MemoryAllocationFailed);
    }

    Ok(unsafe { Box::from_raw(memory) })
}

/// Global allocator backed by the non-paged pool.
///
/// Allocations of a page or more are page aligned by the pool, which covers every
/// paging structure allocated by this crate.
#[cfg(windows)]
pub struct KernelAlloc;

#[cfg(windows)]
unsafe impl core::alloc::GlobalAlloc for KernelAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        use wdk_sys::{ntddk::ExAllocatePool, _POOL_TYPE::NonPagedPool};

        let memory = ExAllocatePool(NonPagedPool, layout.size() as _) as *mut u8;
        if memory.is_null() {
            return memory;
        }

        if memory as usize % layout.align() != 0 {
            log::error!("Pool allocation {:p} does not meet alignment {:#x}", memory, layout.align());
            wdk_sys::ntddk::ExFreePool(memory as _);
            return core::ptr::null_mut();
        }

        memory
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        wdk_sys::ntddk::ExFreePool(ptr as _);
    }
}
