//! A module providing utilities and structures for handling VM exits.
//!
//! Only the exits that drive the execute-trap engine are handled here: MOV to CR3 and EPT
//! violations raised by the mode-based execute hierarchy. Every other exit is reported back as
//! unhandled so the embedding hypervisor can process it.

use {
    crate::{
        error::HypervisorError,
        events::DebuggerEvents,
        intel::{
            exec_trap::ExecTrap, registers::GuestRegisters, support::VmcsAccessor, vcpu::Vcpu,
            vmerror::VmxBasicExitReason,
        },
    },
    x86::vmx::vmcs::{guest, ro},
};

pub mod cr;
pub mod ept;

/// How the guest resumes after a handled VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitType {
    /// Skip the instruction that caused the exit.
    IncrementRIP,
    /// Re-execute the instruction that caused the exit.
    Continue,
}

/// Identifies the guest process running on the current processor.
pub trait ProcessQuery {
    /// The ID of the process whose address space the guest is switching to.
    fn current_process_id(&self) -> u32;
}

/// Represents a VM exit, which can be caused by various reasons.
///
/// A VM exit transfers control from the guest to the host (hypervisor). The handlers it
/// dispatches to keep the execute trap consistent with the guest's scheduling.
pub struct VmExit<'a> {
    exec_trap: &'a ExecTrap,
    events: &'a dyn DebuggerEvents,
    processes: &'a dyn ProcessQuery,
}

impl<'a> VmExit<'a> {
    pub fn new(exec_trap: &'a ExecTrap, events: &'a dyn DebuggerEvents, processes: &'a dyn ProcessQuery) -> Self {
        Self {
            exec_trap,
            events,
            processes,
        }
    }

    /// Handles the VM-exit.
    ///
    /// # Arguments
    ///
    /// * `vcpu` - The processor the exit occurred on.
    /// * `registers` - A mutable reference to the guest's current register state.
    ///
    /// # Returns
    ///
    /// The basic exit reason if the exit was handled, [`HypervisorError::UnknownVmExitReason`]
    /// for reasons this module does not know, or [`HypervisorError::UnhandledVmExit`] for exits
    /// the caller must handle itself.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.9 VM-EXIT INFORMATION FIELDS
    pub fn handle_vmexit<V: VmcsAccessor>(
        &self,
        vcpu: &mut Vcpu<V>,
        registers: &mut GuestRegisters,
    ) -> Result<VmxBasicExitReason, HypervisorError> {
        let exit_reason = vcpu.vmcs().vmread(ro::EXIT_REASON) as u32;

        let Some(basic_exit_reason) = VmxBasicExitReason::from_u32(exit_reason) else {
            log::trace!("Unknown exit reason: {:#x}", exit_reason);
            return Err(HypervisorError::UnknownVmExitReason);
        };
        log::trace!("Basic Exit Reason: {}", basic_exit_reason);

        let exit_type = match basic_exit_reason {
            VmxBasicExitReason::ControlRegisterAccesses => {
                cr::handle_cr3_write(vcpu, registers, self.exec_trap, self.processes)
            }
            VmxBasicExitReason::EptViolation => ept::handle_ept_violation(vcpu, self.exec_trap, self.events),
            _ => None,
        };

        // A suppression request only applies to the exit that raised it.
        let rip_suppressed = vcpu.take_rip_suppression();

        let Some(exit_type) = exit_type else {
            return Err(HypervisorError::UnhandledVmExit);
        };

        if exit_type == ExitType::IncrementRIP && !rip_suppressed {
            Self::advance_guest_rip(vcpu, registers);
        }

        Ok(basic_exit_reason)
    }

    /// Advances the guest's instruction pointer (RIP) past the instruction that caused the exit.
    fn advance_guest_rip<V: VmcsAccessor>(vcpu: &mut Vcpu<V>, registers: &mut GuestRegisters) {
        let len = vcpu.vmcs().vmread(ro::VMEXIT_INSTRUCTION_LEN);
        registers.rip += len;
        vcpu.vmcs_mut().vmwrite(guest::RIP, registers.rip);
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            events::ExecutionMode,
            intel::{
                ept::state::EptpState,
                protected::tests::MockEvents,
                vcpu::tests::{vcpu, MockVmcs},
            },
            utils::{memory_map::RamRegions, processor::Sequential},
        },
        alloc::vec,
        core::cell::Cell,
    };

    const WATCHED: u32 = 8;

    struct MockProcesses(Cell<u32>);

    impl ProcessQuery for MockProcesses {
        fn current_process_id(&self) -> u32 {
            self.0.get()
        }
    }

    /// MOV CR3, RBX
    const MOV_TO_CR3_FROM_RBX: u64 = 3 | 3 << 8;

    fn exit(vcpu: &mut Vcpu<MockVmcs>, reason: u64, qualification: u64) {
        let vmcs = vcpu.vmcs_mut();
        vmcs.vmwrite(ro::EXIT_REASON, reason);
        vmcs.vmwrite(ro::EXIT_QUALIFICATION, qualification);
        vmcs.vmwrite(ro::VMEXIT_INSTRUCTION_LEN, 3);
    }

    #[test]
    fn traced_process_round_trip() {
        let exec_trap = ExecTrap::new(RamRegions::empty());
        let events = MockEvents::default();
        let processes = MockProcesses(Cell::new(WATCHED));
        let mut processors = vec![vcpu(0)];
        exec_trap.initialize(&mut processors, &Sequential, &events, true).unwrap();
        exec_trap.add_process(WATCHED).unwrap();

        let vmexit = VmExit::new(&exec_trap, &events, &processes);
        let vcpu = &mut processors[0];
        let mut registers = GuestRegisters {
            rbx: 0x1AB000 | 1 << 63,
            rip: 0x1000,
            ..Default::default()
        };

        exit(vcpu, 28, MOV_TO_CR3_FROM_RBX);
        assert_eq!(vmexit.handle_vmexit(vcpu, &mut registers), Ok(VmxBasicExitReason::ControlRegisterAccesses));
        assert_eq!(vcpu.vmcs().field(guest::CR3), 0x1AB000);
        assert_eq!(registers.rip, 0x1003);
        assert_eq!(vcpu.eptp_state(), EptpState::UserExecuteDisabled);

        // First user-mode fetch: user execute denied, supervisor execute granted.
        exit(vcpu, 48, 0b010_1100);
        assert_eq!(vmexit.handle_vmexit(vcpu, &mut registers), Ok(VmxBasicExitReason::EptViolation));
        assert_eq!(registers.rip, 0x1003);
        assert_eq!(vcpu.eptp_state(), EptpState::KernelExecuteDisabled);
        assert_eq!(*events.dispatched.borrow(), [(0, ExecutionMode::User)]);

        // Switching to another process leaves the trap disarmed.
        processes.0.set(WATCHED + 4);
        exit(vcpu, 28, MOV_TO_CR3_FROM_RBX);
        vmexit.handle_vmexit(vcpu, &mut registers).unwrap();
        assert!(!vcpu.is_mbec_enabled());
        assert_eq!(vcpu.eptp_state(), EptpState::Normal);
        assert_eq!(registers.rip, 0x1006);
    }

    #[test]
    fn foreign_exits_are_returned_to_the_caller() {
        let exec_trap = ExecTrap::new(RamRegions::empty());
        let events = MockEvents::default();
        let processes = MockProcesses(Cell::new(0));
        let vmexit = VmExit::new(&exec_trap, &events, &processes);
        let mut vcpu = vcpu(0);
        let mut registers = GuestRegisters::default();

        // RDTSC
        exit(&mut vcpu, 16, 0);
        assert_eq!(vmexit.handle_vmexit(&mut vcpu, &mut registers), Err(HypervisorError::UnhandledVmExit));

        // MOV CR4, RAX
        exit(&mut vcpu, 28, 4);
        assert_eq!(vmexit.handle_vmexit(&mut vcpu, &mut registers), Err(HypervisorError::UnhandledVmExit));

        // EPT violation while the trap is not initialized.
        exit(&mut vcpu, 48, 0b010_1100);
        assert_eq!(vmexit.handle_vmexit(&mut vcpu, &mut registers), Err(HypervisorError::UnhandledVmExit));

        // VMCALL is unknown to this module.
        exit(&mut vcpu, 18, 0);
        assert_eq!(vmexit.handle_vmexit(&mut vcpu, &mut registers), Err(HypervisorError::UnknownVmExitReason));

        assert_eq!(registers.rip, 0);
    }
}
