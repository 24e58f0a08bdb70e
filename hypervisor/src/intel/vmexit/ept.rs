use {
    crate::{
        events::DebuggerEvents,
        intel::{
            exec_trap::ExecTrap, support::VmcsAccessor, vcpu::Vcpu,
            vmerror::EptViolationExitQualification, vmexit::ExitType,
        },
    },
    x86::vmx::vmcs::ro,
};

/// Handle VM exits for EPT violations raised by the mode-based execute hierarchy.
///
/// Returns `None` if the violation has another cause.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.3.2 EPT Violations
pub fn handle_ept_violation<V: VmcsAccessor>(
    vcpu: &mut Vcpu<V>,
    exec_trap: &ExecTrap,
    events: &dyn DebuggerEvents,
) -> Option<ExitType> {
    let qualification = EptViolationExitQualification(vcpu.vmcs().vmread(ro::EXIT_QUALIFICATION));
    log::trace!("Exit Qualification for EPT Violations: {:?}", qualification);

    exec_trap
        .handle_ept_violation(vcpu, events, qualification)
        .then_some(ExitType::Continue)
}
