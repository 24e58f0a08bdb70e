//! Access to the current VMCS and to the EPT translation caches.
//!
//! Everything that reads or writes VMCS fields goes through [`VmcsAccessor`], so the
//! resource arbiter and the execute-trap engine can run against a recording VMCS in tests.

/// Reads, writes and invalidations on the VMCS loaded on the current logical processor.
pub trait VmcsAccessor {
    /// Read a specified field from the VMCS.
    fn vmread(&self, field: u32) -> u64;

    /// Write to a specified field in the VMCS.
    fn vmwrite(&mut self, field: u32, value: u64);

    /// Invalidate the cached translations derived from `eptp`.
    fn invept_single_context(&mut self, eptp: u64);

    /// Sets or clears `bits` in `field` with a single read-modify-write.
    fn update_bits(&mut self, field: u32, bits: u64, set: bool) {
        let mut value = self.vmread(field);

        if set {
            value |= bits;
        } else {
            value &= !bits;
        }

        self.vmwrite(field, value);
    }
}

/// The VMCS made current with VMPTRLD on this processor.
#[derive(Debug, Default, Clone, Copy)]
pub struct Hardware;

impl VmcsAccessor for Hardware {
    fn vmread(&self, field: u32) -> u64 {
        vmread(field)
    }

    fn vmwrite(&mut self, field: u32, value: u64) {
        vmwrite(field, value)
    }

    fn invept_single_context(&mut self, eptp: u64) {
        invept(InveptType::SingleContext, eptp)
    }
}

/// Read a specified field from a VMCS.
pub fn vmread(field: u32) -> u64 {
    match unsafe { x86::bits64::vmx::vmread(field) } {
        Ok(value) => value,
        Err(error) => {
            log::error!("VMREAD of field {:#x} failed: {:?}", field, error);
            0
        }
    }
}

/// Write to a specified field in a VMCS.
pub fn vmwrite<T: Into<u64>>(field: u32, val: T) {
    let value: u64 = val.into();

    if let Err(error) = unsafe { x86::bits64::vmx::vmwrite(field, value) } {
        log::error!("VMWRITE of {:#x} to field {:#x} failed: {:?}", value, field, error);
    }
}

/// Types of INVEPT operations.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.4.3.1 Operations that Invalidate Cached Mappings
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InveptType {
    /// Invalidate guest-physical and combined mappings associated with one EPTP.
    SingleContext = 1,
    /// Invalidate mappings associated with all EPTPs.
    AllContexts = 2,
}

fn invept(invept_type: InveptType, eptp: u64) {
    // 128-bit descriptor: EPTP in the low quadword, reserved (zero) high quadword.
    let descriptor: [u64; 2] = [eptp, 0];

    unsafe {
        core::arch::asm!(
        "invept {0}, [{1}]",
        in(reg) invept_type as u64,
        in(reg) &descriptor,
        options(nostack)
        );
    };
}
