//! VM exit reasons and exit qualifications consumed by the VM-exit dispatcher.

use {crate::events::ExecutionMode, bitfield::bitfield};

/// Basic VM exit reasons raised by the controls this hypervisor manages.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table C-1. Basic Exit Reasons
#[repr(u16)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VmxBasicExitReason {
    ExceptionOrNmi = 0,
    ExternalInterrupt = 1,
    Rdtsc = 16,
    ControlRegisterAccesses = 28,
    MovDr = 29,
    EptViolation = 48,
    EptMisconfiguration = 49,
}

impl VmxBasicExitReason {
    /// Converts the 32-bit exit reason field to a basic exit reason.
    ///
    /// The lower 16 bits of the field form the basic exit reason.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9.1 VM Exit Reason
    pub fn from_u32(value: u32) -> Option<Self> {
        match (value & 0xFFFF) as u16 {
            0 => Some(Self::ExceptionOrNmi),
            1 => Some(Self::ExternalInterrupt),
            16 => Some(Self::Rdtsc),
            28 => Some(Self::ControlRegisterAccesses),
            29 => Some(Self::MovDr),
            48 => Some(Self::EptViolation),
            49 => Some(Self::EptMisconfiguration),
            _ => None,
        }
    }
}

impl core::fmt::Display for VmxBasicExitReason {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let description = match self {
            Self::ExceptionOrNmi => "Exception or non-maskable interrupt (NMI)",
            Self::ExternalInterrupt => "External interrupt",
            Self::Rdtsc => "RDTSC",
            Self::ControlRegisterAccesses => "Control-register accesses",
            Self::MovDr => "MOV DR",
            Self::EptViolation => "EPT violation",
            Self::EptMisconfiguration => "EPT misconfiguration",
        };
        write!(f, "{}", description)
    }
}

bitfield! {
    /// Exit qualification for EPT violations.
    ///
    /// Bits 3 to 6 report the permissions of the guest-physical address as the AND of every
    /// EPT paging-structure entry used to translate it. With mode-based execute control
    /// enabled, bit 5 is the supervisor-mode execute permission and bit 6 the user-mode one.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-7. Exit Qualification for EPT Violations
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct EptViolationExitQualification(u64);
    impl Debug;

    pub read_access, set_read_access: 0;
    pub write_access, set_write_access: 1;
    pub execute_access, set_execute_access: 2;
    pub readable, set_readable: 3;
    pub writable, set_writable: 4;
    pub executable, set_executable: 5;
    pub user_mode_executable, set_user_mode_executable: 6;
    pub valid_guest_linear_address, set_valid_guest_linear_address: 7;
    pub caused_by_translation, set_caused_by_translation: 8;
    pub user_mode_linear_address, set_user_mode_linear_address: 9;
    pub nmi_unblocking, set_nmi_unblocking: 12;
}

impl EptViolationExitQualification {
    /// The mode the guest was trying to enter when an instruction fetch faulted on a
    /// mode-based execute EPT, or `None` if the violation is not an execute-trap fault.
    ///
    /// A fetch denied by the user-mode execute bit means the guest is running user code;
    /// a fetch denied by the supervisor execute bit means it is running kernel code.
    pub fn mode_transition(&self) -> Option<ExecutionMode> {
        if !self.execute_access() {
            return None;
        }

        if !self.user_mode_executable() {
            Some(ExecutionMode::User)
        } else if !self.executable() {
            Some(ExecutionMode::Kernel)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn qualification(execute_access: bool, executable: bool, user_executable: bool) -> EptViolationExitQualification {
        let mut qualification = EptViolationExitQualification(0);
        qualification.set_readable(true);
        qualification.set_writable(true);
        qualification.set_execute_access(execute_access);
        qualification.set_executable(executable);
        qualification.set_user_mode_executable(user_executable);
        qualification
    }

    #[test]
    fn decodes_raw_bits() {
        let qualification = EptViolationExitQualification(0b10_0010_0100);
        assert!(qualification.execute_access());
        assert!(qualification.executable());
        assert!(!qualification.user_mode_executable());
        assert!(qualification.user_mode_linear_address());
    }

    #[test]
    fn user_execute_fault_is_user_mode_entry() {
        assert_eq!(qualification(true, true, false).mode_transition(), Some(ExecutionMode::User));
    }

    #[test]
    fn supervisor_execute_fault_is_kernel_mode_entry() {
        assert_eq!(qualification(true, false, true).mode_transition(), Some(ExecutionMode::Kernel));
    }

    #[test]
    fn data_accesses_are_not_mode_transitions() {
        let mut write = qualification(false, false, false);
        write.set_write_access(true);
        assert_eq!(write.mode_transition(), None);

        // Fetch allowed in both modes: some other EPT permission caused the exit.
        assert_eq!(qualification(true, true, true).mode_transition(), None);
    }

    #[test]
    fn exit_reason_uses_low_sixteen_bits() {
        assert_eq!(VmxBasicExitReason::from_u32(0x8000_0030), Some(VmxBasicExitReason::EptViolation));
        assert_eq!(VmxBasicExitReason::from_u32(10), None);
    }
}
