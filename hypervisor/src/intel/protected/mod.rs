//! Arbitration of VMCS resources shared by independent debugger features.
//!
//! The exception bitmap, external-interrupt exiting, RDTSC exiting, MOV-DR exiting, MOV to
//! CR0/CR4 exiting and CR3-load exiting are each wanted by several features at once. A feature
//! that no longer needs one of them asks for it to be released; the release is silently
//! skipped while any other demand source is still active, so one feature can never switch off
//! an interception another one relies on. Enabling always goes through.
//!
//! Every operation acts on the VMCS of the calling processor only.

pub mod demand;

use {
    crate::{
        events::DebuggerEvents,
        intel::{
            controls::{
                ACK_INTERRUPT_ON_EXIT, CR3_LOAD_EXITING, EXTERNAL_INTERRUPT_EXITING, MOV_DR_EXITING,
                RDTSC_EXITING,
            },
            exceptions::{ExceptionSelector, ExceptionVector},
            support::VmcsAccessor,
            vcpu::Vcpu,
        },
    },
    demand::{required_exceptions, PassOver, ProtectedControl},
    x86::vmx::vmcs::{control, guest},
};

/// A control register whose writes can be intercepted through a guest/host mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRegister {
    Cr0,
    Cr4,
}

impl ControlRegister {
    /// (guest/host mask, read shadow, guest register) VMCS fields.
    const fn fields(self) -> (u32, u32, u32) {
        match self {
            Self::Cr0 => (control::CR0_GUEST_HOST_MASK, control::CR0_READ_SHADOW, guest::CR0),
            Self::Cr4 => (control::CR4_GUEST_HOST_MASK, control::CR4_READ_SHADOW, guest::CR4),
        }
    }
}

/// The protected resources of one processor's VMCS.
pub struct ProtectedResources<'a, V: VmcsAccessor> {
    vcpu: &'a mut Vcpu<V>,
    events: &'a dyn DebuggerEvents,
}

impl<'a, V: VmcsAccessor> ProtectedResources<'a, V> {
    pub fn new(vcpu: &'a mut Vcpu<V>, events: &'a dyn DebuggerEvents) -> Self {
        Self { vcpu, events }
    }

    /// Writes `mask` OR'd with every exception still required by a demand source that is not
    /// passed over.
    fn write_exception_bitmap(&mut self, mask: u32, pass_over: PassOver) {
        let bitmap = mask | required_exceptions(self.events, self.vcpu.id(), pass_over);

        self.vcpu
            .vmcs_mut()
            .vmwrite(control::EXCEPTION_BITMAP, u64::from(bitmap));
    }

    fn current_exception_bitmap(&self) -> u32 {
        self.vcpu.vmcs().vmread(control::EXCEPTION_BITMAP) as u32
    }

    /// Intercepts the exceptions selected by `selector`.
    ///
    /// Out of range vectors are logged and leave the bitmap untouched.
    pub fn set_exception_bitmap(&mut self, selector: ExceptionSelector) {
        let Ok(mask) = selector.mask() else {
            log::error!("Ignoring exception bitmap request for {:?}", selector);
            return;
        };

        let current = self.current_exception_bitmap();
        self.write_exception_bitmap(current | mask, PassOver::empty());
    }

    /// Stops intercepting the exceptions selected by `selector`, except those still required.
    pub fn unset_exception_bitmap(&mut self, selector: ExceptionSelector) {
        self.unset_exception_bitmap_with_pass_over(selector, PassOver::empty());
    }

    fn unset_exception_bitmap_with_pass_over(&mut self, selector: ExceptionSelector, pass_over: PassOver) {
        let Ok(mask) = selector.mask() else {
            log::error!("Ignoring exception bitmap request for {:?}", selector);
            return;
        };

        let current = self.current_exception_bitmap();
        self.write_exception_bitmap(current & !mask, pass_over);
    }

    /// Resets the bitmap to the exceptions required by the remaining demand sources, ignoring
    /// the generic exception events that are being cleared.
    pub fn reset_exception_bitmap_to_clear_events(&mut self) {
        self.write_exception_bitmap(0, PassOver::EXCEPTION_EVENTS);
    }

    /// Drops #UD interception for a command removing syscall/sysret hooks.
    pub fn remove_undefined_opcode_for_syscall_sysret_commands(&mut self) {
        self.unset_exception_bitmap_with_pass_over(
            ExceptionVector::InvalidOpcode.into(),
            PassOver::UD_EXCEPTIONS_FOR_SYSCALL_SYSRET_HOOK,
        );
    }

    /// Returns `false` if a release of `control` is vetoed.
    fn may_release(&self, protected: ProtectedControl, pass_over: PassOver) -> bool {
        match protected.vetoing_demand(self.events, self.vcpu.id(), pass_over) {
            Some(demand) => {
                log::trace!(
                    "Processor {}: keeping {:?} enabled for {}",
                    self.vcpu.id(),
                    protected,
                    demand.name
                );
                false
            }
            None => true,
        }
    }

    fn apply_external_interrupt_exiting(&mut self, set: bool, pass_over: PassOver) {
        if !set && !self.may_release(ProtectedControl::ExternalInterruptExiting, pass_over) {
            return;
        }

        let vmcs = self.vcpu.vmcs_mut();
        vmcs.update_bits(control::PINBASED_EXEC_CONTROLS, EXTERNAL_INTERRUPT_EXITING, set);
        vmcs.update_bits(control::VMEXIT_CONTROLS, ACK_INTERRUPT_ON_EXIT, set);
    }

    fn apply_primary_control(&mut self, protected: ProtectedControl, bits: u64, set: bool, pass_over: PassOver) {
        if !set && !self.may_release(protected, pass_over) {
            return;
        }

        self.vcpu
            .vmcs_mut()
            .update_bits(control::PRIMARY_PROCBASED_EXEC_CONTROLS, bits, set);
    }

    fn apply_mov_to_cr_exiting(&mut self, set: bool, register: ControlRegister, mask: u64, pass_over: PassOver) {
        if !set && !self.may_release(ProtectedControl::MovToControlRegisterExiting, pass_over) {
            return;
        }

        let (mask_field, shadow_field, guest_field) = register.fields();
        let vmcs = self.vcpu.vmcs_mut();

        if set {
            let shadow = vmcs.vmread(guest_field);
            vmcs.vmwrite(mask_field, mask);
            vmcs.vmwrite(shadow_field, shadow);
        } else {
            vmcs.vmwrite(mask_field, 0);
            vmcs.vmwrite(shadow_field, 0);
        }
    }

    /// External-interrupt exiting together with "acknowledge interrupt on exit".
    pub fn set_external_interrupt_exiting(&mut self, set: bool) {
        self.apply_external_interrupt_exiting(set, PassOver::empty());
    }

    pub fn disable_external_interrupt_exiting_for_interrupt_commands(&mut self) {
        self.apply_external_interrupt_exiting(false, PassOver::INTERRUPT_EVENTS);
    }

    pub fn set_rdtsc_exiting(&mut self, set: bool) {
        self.apply_primary_control(ProtectedControl::RdtscExiting, RDTSC_EXITING, set, PassOver::empty());
    }

    pub fn disable_rdtsc_exiting_for_tsc_commands(&mut self) {
        self.apply_primary_control(ProtectedControl::RdtscExiting, RDTSC_EXITING, false, PassOver::TSC_EVENTS);
    }

    pub fn set_mov_debug_regs_exiting(&mut self, set: bool) {
        self.apply_primary_control(
            ProtectedControl::MovDebugRegistersExiting,
            MOV_DR_EXITING,
            set,
            PassOver::empty(),
        );
    }

    pub fn disable_mov_debug_regs_exiting_for_dr_commands(&mut self) {
        self.apply_primary_control(
            ProtectedControl::MovDebugRegistersExiting,
            MOV_DR_EXITING,
            false,
            PassOver::MOV_TO_HW_DEBUG_REGS_EVENTS,
        );
    }

    /// Intercepts writes to the `mask` bits of `register`. The guest keeps reading the value
    /// the register had when interception started.
    pub fn set_mov_to_cr_exiting(&mut self, set: bool, register: ControlRegister, mask: u64) {
        self.apply_mov_to_cr_exiting(set, register, mask, PassOver::empty());
    }

    pub fn disable_mov_to_cr_exiting_for_cr_commands(&mut self, register: ControlRegister, mask: u64) {
        self.apply_mov_to_cr_exiting(false, register, mask, PassOver::MOV_TO_CONTROL_REGS_EVENTS);
    }

    pub fn set_mov_to_cr3_exiting(&mut self, set: bool) {
        self.apply_primary_control(ProtectedControl::Cr3LoadExiting, CR3_LOAD_EXITING, set, PassOver::empty());
    }
}
