//! Per-processor hypervisor state.
//!
//! A `Vcpu` is only ever touched by the processor it belongs to, either from its own VM-exit
//! handler or from an operation broadcast to it, so none of its state needs synchronization.

use {
    crate::{
        error::HypervisorError,
        events::ExecutionMode,
        intel::{
            controls::MODE_BASED_EPT_EXECUTE,
            ept::{
                mtrr::MtrrRangeDescriptor,
                paging::Ept,
                state::{EptpState, ModeBasedEpt},
            },
            support::{Hardware, VmcsAccessor},
        },
        utils::addresses::AddressSpace,
    },
    x86::vmx::vmcs::control,
};

/// Represents a virtual CPU and the EPT state it owns.
pub struct Vcpu<V: VmcsAccessor = Hardware> {
    /// The processor's unique identifier.
    index: u32,

    /// Access to this processor's VMCS.
    vmcs: V,

    /// Identity mapped hierarchy used while no execute trap is active.
    ept: Ept,

    /// EPTP of `ept`.
    eptp: u64,

    /// Hierarchy whose top-level execute bits trap mode transitions.
    mode_based: ModeBasedEpt,

    /// The VMCS currently points at the mode-based hierarchy instead of `eptp`.
    not_normal_eptp: bool,

    /// Mode-based execute control is enabled in the secondary controls.
    mbec_enabled: bool,

    /// The current VM exit must resume at the faulting instruction.
    suppress_rip_increment: bool,
}

impl<V: VmcsAccessor> Vcpu<V> {
    /// Creates the virtual CPU for processor `index`, building both EPT hierarchies.
    pub fn new<A: AddressSpace + ?Sized>(
        index: u32,
        vmcs: V,
        address_space: &A,
        mtrr_map: &[MtrrRangeDescriptor],
    ) -> Result<Self, HypervisorError> {
        log::info!("Creating processor {}", index);

        let mut ept = Ept::new()?;
        ept.build_identity_map(address_space, mtrr_map)?;
        let eptp = ept.create_eptp_with_wb_and_4lvl_walk(address_space)?;

        let mode_based = ModeBasedEpt::new(address_space, mtrr_map)?;

        Ok(Self {
            index,
            vmcs,
            ept,
            eptp,
            mode_based,
            not_normal_eptp: false,
            mbec_enabled: false,
            suppress_rip_increment: false,
        })
    }

    pub fn id(&self) -> u32 {
        self.index
    }

    pub fn vmcs(&self) -> &V {
        &self.vmcs
    }

    pub fn vmcs_mut(&mut self) -> &mut V {
        &mut self.vmcs
    }

    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    /// The EPTP of the identity mapped hierarchy, loaded during normal execution.
    pub fn eptp(&self) -> u64 {
        self.eptp
    }

    pub fn mode_based_ept(&self) -> &ModeBasedEpt {
        &self.mode_based
    }

    pub fn mode_based_ept_mut(&mut self) -> &mut ModeBasedEpt {
        &mut self.mode_based
    }

    pub fn eptp_state(&self) -> EptpState {
        self.mode_based.state()
    }

    pub fn is_not_normal_eptp(&self) -> bool {
        self.not_normal_eptp
    }

    pub fn is_mbec_enabled(&self) -> bool {
        self.mbec_enabled
    }

    /// Sets or clears "mode-based execute control for EPT" in the secondary controls.
    pub fn set_mode_based_execution(&mut self, enable: bool) {
        self.vmcs
            .update_bits(control::SECONDARY_PROCBASED_EXEC_CONTROLS, MODE_BASED_EPT_EXECUTE, enable);
        self.mbec_enabled = enable;
    }

    /// Loads the mode-based hierarchy's EPTP.
    pub fn switch_to_mode_based_eptp(&mut self) {
        let eptp = self.mode_based.eptp();
        self.vmcs.vmwrite(control::EPTP_FULL, eptp);
        self.vmcs.invept_single_context(eptp);
        self.not_normal_eptp = true;
    }

    /// Arms the mode-based hierarchy to trap the first instruction fetched after the guest
    /// leaves `entered`.
    pub fn request_transition(&mut self, entered: ExecutionMode) {
        self.mode_based
            .transition(&mut self.vmcs, EptpState::armed_after(entered));
    }

    /// Re-enables execution at both privilege levels while keeping the mode-based EPTP loaded.
    pub fn disarm_execute_trap(&mut self) {
        if self.mode_based.state() != EptpState::Normal {
            self.mode_based.transition(&mut self.vmcs, EptpState::Normal);
        }
    }

    /// Re-enables execution at both privilege levels and loads the identity mapped EPTP again.
    ///
    /// Calling it on a processor that is already in its normal state does nothing.
    pub fn restore_normal(&mut self) {
        if !self.not_normal_eptp && self.mode_based.state() == EptpState::Normal {
            return;
        }

        self.mode_based.transition(&mut self.vmcs, EptpState::Normal);
        self.vmcs.vmwrite(control::EPTP_FULL, self.eptp);
        self.not_normal_eptp = false;
    }

    /// Keeps the guest RIP at the instruction that caused the current VM exit.
    pub fn suppress_rip_increment(&mut self) {
        self.suppress_rip_increment = true;
    }

    /// Returns whether RIP must stay unchanged for the current VM exit and resets the request.
    pub fn take_rip_suppression(&mut self) -> bool {
        core::mem::take(&mut self.suppress_rip_increment)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use {
        super::*,
        crate::utils::addresses::tests::MockAddressSpace,
        alloc::{collections::BTreeMap, vec::Vec},
    };

    /// A VMCS held in memory, recording every INVEPT.
    #[derive(Debug, Default)]
    pub struct MockVmcs {
        pub fields: BTreeMap<u32, u64>,
        pub writes: Vec<(u32, u64)>,
        pub invalidations: Vec<u64>,
    }

    impl MockVmcs {
        pub fn field(&self, field: u32) -> u64 {
            self.fields.get(&field).copied().unwrap_or(0)
        }
    }

    impl VmcsAccessor for MockVmcs {
        fn vmread(&self, field: u32) -> u64 {
            self.field(field)
        }

        fn vmwrite(&mut self, field: u32, value: u64) {
            self.fields.insert(field, value);
            self.writes.push((field, value));
        }

        fn invept_single_context(&mut self, eptp: u64) {
            self.invalidations.push(eptp);
        }
    }

    pub fn vcpu(index: u32) -> Vcpu<MockVmcs> {
        Vcpu::new(index, MockVmcs::default(), &MockAddressSpace::new(0), &[]).unwrap()
    }

    #[test]
    fn hierarchies_have_distinct_eptps() {
        let vcpu = vcpu(0);
        assert_ne!(vcpu.eptp(), vcpu.mode_based_ept().eptp());
        assert_eq!(vcpu.eptp_state(), EptpState::Normal);
        assert!(!vcpu.is_not_normal_eptp());
    }

    #[test]
    fn mode_based_execution_toggles_secondary_bit_22() {
        let mut vcpu = vcpu(0);
        vcpu.vmcs_mut().vmwrite(control::SECONDARY_PROCBASED_EXEC_CONTROLS, 0x82);

        vcpu.set_mode_based_execution(true);
        assert_eq!(vcpu.vmcs().field(control::SECONDARY_PROCBASED_EXEC_CONTROLS), 0x82 | 1 << 22);
        assert!(vcpu.is_mbec_enabled());

        vcpu.set_mode_based_execution(false);
        assert_eq!(vcpu.vmcs().field(control::SECONDARY_PROCBASED_EXEC_CONTROLS), 0x82);
        assert!(!vcpu.is_mbec_enabled());
    }

    #[test]
    fn restore_normal_is_idempotent() {
        let mut vcpu = vcpu(1);
        vcpu.switch_to_mode_based_eptp();
        vcpu.request_transition(ExecutionMode::Kernel);
        vcpu.vmcs_mut().invalidations.clear();

        vcpu.restore_normal();
        vcpu.restore_normal();

        assert_eq!(vcpu.eptp_state(), EptpState::Normal);
        assert!(!vcpu.is_not_normal_eptp());
        assert_eq!(vcpu.vmcs().field(control::EPTP_FULL), vcpu.eptp());
        assert_eq!(vcpu.vmcs().invalidations.len(), 1);
    }

    #[test]
    fn rip_suppression_is_consumed_once() {
        let mut vcpu = vcpu(0);
        assert!(!vcpu.take_rip_suppression());

        vcpu.suppress_rip_increment();
        assert!(vcpu.take_rip_suppression());
        assert!(!vcpu.take_rip_suppression());
    }
}
