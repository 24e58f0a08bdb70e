//! The mode-based execute hierarchy and the execute permissions of its top-level entry.
//!
//! With mode-based execute control enabled, bit 2 of an EPT entry allows supervisor-mode
//! fetches and bit 10 allows user-mode fetches. Clearing one of them in PML4[0] makes the next
//! fetch at that privilege level cause an EPT violation, which is how mode transitions of a
//! watched process are observed. Only that single entry is ever rewritten, followed by an
//! INVEPT, so a transition is cheap enough to run on every VM exit.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3.3.2 EPT Violations

use {
    crate::{
        error::HypervisorError,
        events::ExecutionMode,
        intel::{
            ept::{mtrr::MtrrRangeDescriptor, paging::Ept},
            support::VmcsAccessor,
        },
        utils::addresses::AddressSpace,
    },
};

/// Execute permissions of the top-level entry of the mode-based execute hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EptpState {
    /// Both privilege levels may execute.
    Normal,
    /// Supervisor-mode fetches fault: the next kernel-mode entry is trapped.
    KernelExecuteDisabled,
    /// User-mode fetches fault: the next user-mode entry is trapped.
    UserExecuteDisabled,
}

impl EptpState {
    /// The state that traps the first fetch after leaving `entered`.
    pub const fn armed_after(entered: ExecutionMode) -> Self {
        match entered {
            ExecutionMode::User => Self::KernelExecuteDisabled,
            ExecutionMode::Kernel => Self::UserExecuteDisabled,
        }
    }

    /// (supervisor execute, user-mode execute) bits of PML4[0] in this state.
    const fn execute_bits(self) -> (bool, bool) {
        match self {
            Self::Normal => (true, true),
            Self::KernelExecuteDisabled => (false, true),
            Self::UserExecuteDisabled => (true, false),
        }
    }
}

/// A processor's mode-based execute hierarchy together with its EPTP.
pub struct ModeBasedEpt {
    ept: Ept,
    eptp: u64,
    state: EptpState,
}

impl ModeBasedEpt {
    /// Builds an identity mapped hierarchy; the execute-only layout is applied later, when the
    /// execute-trap engine is initialized.
    pub fn new<A: AddressSpace + ?Sized>(
        address_space: &A,
        mtrr_map: &[MtrrRangeDescriptor],
    ) -> Result<Self, HypervisorError> {
        let mut ept = Ept::new()?;
        ept.build_identity_map(address_space, mtrr_map)?;
        let eptp = ept.create_eptp_with_wb_and_4lvl_walk(address_space)?;

        Ok(Self {
            ept,
            eptp,
            state: EptpState::Normal,
        })
    }

    pub fn ept(&self) -> &Ept {
        &self.ept
    }

    pub fn ept_mut(&mut self) -> &mut Ept {
        &mut self.ept
    }

    pub fn eptp(&self) -> u64 {
        self.eptp
    }

    pub fn state(&self) -> EptpState {
        self.state
    }

    /// Rewrites the execute bits of PML4[0] for `state` and invalidates the cached
    /// translations of this hierarchy.
    pub fn transition<V: VmcsAccessor + ?Sized>(&mut self, vmcs: &mut V, state: EptpState) {
        let (supervisor, user) = state.execute_bits();

        let pml4e = self.ept.pml4_entry_mut();
        pml4e.set_executable(supervisor);
        pml4e.set_user_mode_execute(user);

        self.state = state;
        vmcs.invept_single_context(self.eptp);
    }
}
