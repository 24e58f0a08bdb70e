//! Control-register access exits.

use {
    crate::intel::{
        exec_trap::ExecTrap,
        registers::GuestRegisters,
        support::VmcsAccessor,
        vcpu::Vcpu,
        vmexit::{ExitType, ProcessQuery},
    },
    bit_field::BitField,
    bitfield::bitfield,
    x86::vmx::vmcs::{guest, ro},
};

bitfield! {
    /// Exit qualification for control-register accesses.
    ///
    /// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 28-3. Exit Qualification for Control-Register Accesses
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct ControlRegisterAccessQualification(u64);
    impl Debug;

    pub control_register, _: 3, 0;
    pub access_type, _: 5, 4;
    pub lmsw_operand_type, _: 6;
    pub general_purpose_register, _: 11, 8;
    pub lmsw_source_data, _: 31, 16;
}

const MOV_TO_CR: u64 = 0;

/// Emulates MOV to CR3 and lets the execute trap follow the process switch.
///
/// Returns `None` for any other control-register access.
pub fn handle_cr3_write<V: VmcsAccessor>(
    vcpu: &mut Vcpu<V>,
    registers: &GuestRegisters,
    exec_trap: &ExecTrap,
    processes: &dyn ProcessQuery,
) -> Option<ExitType> {
    let qualification = ControlRegisterAccessQualification(vcpu.vmcs().vmread(ro::EXIT_QUALIFICATION));

    if qualification.control_register() != 3 || qualification.access_type() != MOV_TO_CR {
        return None;
    }

    // With CR4.PCIDE set, bit 63 of the source only requests that the TLB is not flushed.
    let mut cr3 = registers.gpr(qualification.general_purpose_register());
    cr3.set_bit(63, false);
    vcpu.vmcs_mut().vmwrite(guest::CR3, cr3);

    exec_trap.handle_cr3_exit(vcpu, processes.current_process_id());

    Some(ExitType::IncrementRIP)
}
