//! VM-execution control bits the hypervisor toggles at run time and the capability
//! checks that decide whether they may be used.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6 VM-EXECUTION CONTROL FIELDS

use {
    bit_field::BitField,
    bitflags::bitflags,
    lazy_static::lazy_static,
    x86::{
        msr,
        vmx::vmcs::control::{ExitControls, PinbasedControls, PrimaryControls},
    },
};

bitflags! {
    /// Secondary processor-based controls used by the execute-trap engine.
    ///
    /// Reference: Table 25-7. Definitions of Secondary Processor-Based VM-Execution Controls
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SecondaryControlsExt: u32 {
        /// Mode-based execute control for EPT: bit 2 of an EPT entry governs supervisor-mode
        /// linear addresses and bit 10 governs user-mode linear addresses.
        const MODE_BASED_EPT_EXECUTE = 1 << 22;
    }
}

/// Pin-based external-interrupt exiting.
pub const EXTERNAL_INTERRUPT_EXITING: u64 = PinbasedControls::EXTERNAL_INTERRUPT_EXITING.bits() as u64;

/// VM-exit control "acknowledge interrupt on exit", paired with external-interrupt exiting.
pub const ACK_INTERRUPT_ON_EXIT: u64 = ExitControls::ACK_INTERRUPT_ON_EXIT.bits() as u64;

/// Primary processor-based RDTSC exiting.
pub const RDTSC_EXITING: u64 = PrimaryControls::RDTSC_EXITING.bits() as u64;

/// Primary processor-based MOV-DR exiting.
pub const MOV_DR_EXITING: u64 = PrimaryControls::MOV_DR_EXITING.bits() as u64;

/// Primary processor-based CR3-load exiting.
pub const CR3_LOAD_EXITING: u64 = PrimaryControls::CR3_LOAD_EXITING.bits() as u64;

/// Secondary processor-based mode-based execute control for EPT.
pub const MODE_BASED_EPT_EXECUTE: u64 = SecondaryControlsExt::MODE_BASED_EPT_EXECUTE.bits() as u64;

lazy_static! {
    static ref MODE_BASED_EXECUTION_SUPPORTED: bool =
        allowed1_contains(unsafe { msr::rdmsr(msr::IA32_VMX_PROCBASED_CTLS2) }, MODE_BASED_EPT_EXECUTE);
}

/// Checks whether the processor allows mode-based execute control for EPT to be set.
///
/// The result is read from `IA32_VMX_PROCBASED_CTLS2` once and cached.
///
/// Reference: A.3.3 Secondary Processor-Based VM-Execution Controls
pub fn is_mode_based_execution_supported() -> bool {
    *MODE_BASED_EXECUTION_SUPPORTED
}

/// Returns `true` if every bit of `control` may be set according to a VMX capability MSR value.
///
/// Bits 63:32 of a capability MSR report the allowed 1-settings of the control field.
pub fn allowed1_contains(capability: u64, control: u64) -> bool {
    let allowed1 = capability.get_bits(32..64);
    allowed1 & control == control
}
