//! Thin wrappers around privileged instructions.

/// Reads an MSR.
pub fn rdmsr(msr: u32) -> u64 {
    unsafe { x86::msr::rdmsr(msr) }
}

/// Reads the CR3 register.
pub fn cr3() -> u64 {
    unsafe { x86::controlregs::cr3() }
}

/// Writes a value to the CR3 register.
pub fn cr3_write(val: u64) {
    unsafe { x86::controlregs::cr3_write(val) };
}
