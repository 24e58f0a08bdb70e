//! Traps user/kernel mode transitions of selected processes with mode-based execute control
//! for EPT (MBEC).
//!
//! While a watched process runs, MBEC is enabled and one of the two execute bits of the
//! mode-based hierarchy's top-level entry is cleared. The first instruction fetched at the
//! disabled privilege level causes an EPT violation, which is reported to the debugger as a
//! mode transition before the opposite bit is cleared instead. MOV to CR3 exits re-arm the trap
//! whenever a watched process is scheduled and switch MBEC off for everything else.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.2 Processor-Based VM-Execution Controls

pub mod watch_list;

use {
    crate::{
        error::HypervisorError,
        events::{DebuggerEvents, ExecutionMode},
        intel::{
            ept::layout::{build_execute_only_layout, prime_execute_permissions},
            protected::ProtectedResources,
            support::VmcsAccessor,
            vcpu::Vcpu,
            vmerror::EptViolationExitQualification,
        },
        utils::{addresses::AddressSpace, memory_map::RamRegions, processor::Broadcast},
    },
    core::sync::atomic::{AtomicU8, Ordering},
    watch_list::WatchList,
};

#[cfg(windows)]
lazy_static::lazy_static! {
    /// The execute trap covering the RAM reported by the memory manager.
    pub static ref EXEC_TRAP: ExecTrap = ExecTrap::new(RamRegions::read().unwrap_or_else(|error| {
        log::error!("Execute trap has no RAM ranges to protect: {}", error);
        RamRegions::empty()
    }));
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized = 0,
    Initialized = 1,
    Uninitializing = 2,
}

/// The execute-trap engine shared by all processors.
pub struct ExecTrap {
    lifecycle: AtomicU8,
    watch_list: WatchList,
    ram_regions: RamRegions,
}

impl ExecTrap {
    /// Creates an uninitialized engine protecting `ram_regions` once initialized.
    pub const fn new(ram_regions: RamRegions) -> Self {
        Self {
            lifecycle: AtomicU8::new(Lifecycle::Uninitialized as u8),
            watch_list: WatchList::new(),
            ram_regions,
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        match self.lifecycle.load(Ordering::Acquire) {
            1 => Lifecycle::Initialized,
            2 => Lifecycle::Uninitializing,
            _ => Lifecycle::Uninitialized,
        }
    }

    fn publish(&self, lifecycle: Lifecycle) {
        self.lifecycle.store(lifecycle as u8, Ordering::Release);
    }

    pub fn is_initialized(&self) -> bool {
        self.lifecycle() == Lifecycle::Initialized
    }

    /// Whether [`ExecTrap::uninitialize`] is in progress.
    pub fn is_uninitializing(&self) -> bool {
        self.lifecycle() == Lifecycle::Uninitializing
    }

    pub fn watch_list(&self) -> &WatchList {
        &self.watch_list
    }

    pub fn ram_regions(&self) -> &RamRegions {
        &self.ram_regions
    }

    /// Prepares every processor's mode-based hierarchy, loads it and starts intercepting
    /// MOV to CR3. Does nothing if the engine is already initialized.
    ///
    /// The engine is marked initialized before CR3-load exiting is enabled, since an EPT
    /// violation can be raised as soon as the first processor loads the new EPTP.
    ///
    /// # Errors
    ///
    /// [`HypervisorError::MbecUnsupported`] if the processor lacks mode-based execute control,
    /// or the error of a failed broadcast.
    pub fn initialize<V: VmcsAccessor, B: Broadcast>(
        &self,
        processors: &mut [Vcpu<V>],
        broadcast: &B,
        events: &dyn DebuggerEvents,
        mbec_supported: bool,
    ) -> Result<(), HypervisorError> {
        if self.is_initialized() {
            return Ok(());
        }

        if !mbec_supported {
            log::error!(
                "Mode-based execute control is not supported; it is available starting with 7th generation (Kaby Lake) processors"
            );
            return Err(HypervisorError::MbecUnsupported);
        }

        for processor in processors.iter_mut() {
            build_execute_only_layout(processor.mode_based_ept_mut().ept_mut(), &self.ram_regions)?;
        }

        broadcast.on_each_processor(processors, &mut |processor| processor.switch_to_mode_based_eptp())?;

        self.publish(Lifecycle::Initialized);

        broadcast.on_each_processor(processors, &mut |processor| {
            ProtectedResources::new(processor, events).set_mov_to_cr3_exiting(true)
        })?;

        log::info!("Execute trap initialized on {} processors", processors.len());

        Ok(())
    }

    /// Stops intercepting MOV to CR3 (unless another feature still needs it), switches MBEC off
    /// and loads every processor's normal EPTP again. Does nothing unless initialized.
    pub fn uninitialize<V: VmcsAccessor, B: Broadcast>(
        &self,
        processors: &mut [Vcpu<V>],
        broadcast: &B,
        events: &dyn DebuggerEvents,
    ) -> Result<(), HypervisorError> {
        if !self.is_initialized() {
            return Ok(());
        }

        self.publish(Lifecycle::Uninitializing);

        let result = broadcast
            .on_each_processor(processors, &mut |processor| {
                ProtectedResources::new(processor, events).set_mov_to_cr3_exiting(false)
            })
            .and_then(|_| {
                broadcast.on_each_processor(processors, &mut |processor| {
                    if processor.is_mbec_enabled() {
                        processor.set_mode_based_execution(false);
                    }
                    processor.restore_normal();
                })
            });

        self.publish(Lifecycle::Uninitialized);

        log::info!("Execute trap uninitialized");

        result
    }

    /// Starts trapping mode transitions of `process_id`.
    ///
    /// # Errors
    ///
    /// [`HypervisorError::WatchListFull`] if no more processes can be watched.
    pub fn add_process(&self, process_id: u32) -> Result<(), HypervisorError> {
        self.watch_list.add(process_id).inspect_err(|_| {
            log::warn!("Cannot watch process {:#x}: watch-list is full", process_id)
        })
    }

    /// Stops trapping mode transitions of `process_id`, returning whether it was watched.
    pub fn remove_process(&self, process_id: u32) -> bool {
        self.watch_list.remove(process_id)
    }

    /// Makes the page tables of the address space rooted at `target_cr3` writable in every
    /// processor's mode-based hierarchy, then invalidates the stale translations.
    pub fn prime_process<V: VmcsAccessor, B: Broadcast, A: AddressSpace + ?Sized>(
        &self,
        processors: &mut [Vcpu<V>],
        broadcast: &B,
        address_space: &A,
        target_cr3: u64,
        kernel_cr3: u64,
    ) -> Result<(), HypervisorError> {
        for processor in processors.iter_mut() {
            prime_execute_permissions(
                processor.mode_based_ept_mut().ept_mut(),
                address_space,
                target_cr3,
                kernel_cr3,
            )?;
        }

        broadcast.on_each_processor(processors, &mut |processor| {
            let eptp = processor.mode_based_ept().eptp();
            processor.vmcs_mut().invept_single_context(eptp);
        })
    }

    /// Handles a MOV to CR3 exit that switched to `process_id`.
    ///
    /// A watched process gets MBEC and a trap armed for its first user-mode instruction; any
    /// other process runs with MBEC switched off. No event is reported from here.
    pub fn handle_cr3_exit<V: VmcsAccessor>(&self, vcpu: &mut Vcpu<V>, process_id: u32) {
        if !self.is_initialized() {
            return;
        }

        if self.watch_list.contains(process_id) {
            // The process is in the kernel here. No event is reported: the next one comes from
            // its first user-mode fetch, so user and kernel events alternate.
            vcpu.set_mode_based_execution(true);
            vcpu.request_transition(ExecutionMode::Kernel);
        } else if vcpu.is_mbec_enabled() {
            vcpu.set_mode_based_execution(false);
            vcpu.disarm_execute_trap();
        }
    }

    /// Handles an EPT violation raised by a trapped mode transition, including while
    /// [`ExecTrap::uninitialize`] is still restoring the processors.
    ///
    /// Returns `false` if the violation was not caused by this engine and must be handled by
    /// the regular EPT violation path.
    pub fn handle_ept_violation<V: VmcsAccessor>(
        &self,
        vcpu: &mut Vcpu<V>,
        events: &dyn DebuggerEvents,
        qualification: EptViolationExitQualification,
    ) -> bool {
        // Cores stay armed until the teardown broadcast restores their normal EPTP.
        if self.lifecycle() == Lifecycle::Uninitialized {
            return false;
        }

        let Some(entered) = qualification.mode_transition() else {
            return false;
        };

        log::trace!("Processor {}: watched process entered {:?} mode", vcpu.id(), entered);

        // The faulting fetch never executed.
        vcpu.suppress_rip_increment();

        events.dispatch_mode_event(vcpu.id(), entered);
        vcpu.request_transition(entered);

        true
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            intel::{
                controls::{CR3_LOAD_EXITING, MODE_BASED_EPT_EXECUTE},
                ept::state::EptpState,
                protected::tests::MockEvents,
                vcpu::tests::{vcpu, MockVmcs},
            },
            events::TracingFeature,
            utils::{memory_map::RamRange, processor::Sequential},
        },
        alloc::{vec, vec::Vec},
        core::cell::RefCell,
        x86::vmx::vmcs::control,
    };

    const WATCHED: u32 = 0x1234;

    fn engine() -> ExecTrap {
        ExecTrap::new(RamRegions::from_ranges([RamRange { base: 0, size: 0x4000_0000 }]))
    }

    fn processors() -> Vec<Vcpu<MockVmcs>> {
        vec![vcpu(0), vcpu(1)]
    }

    fn violation(executable: bool, user_executable: bool) -> EptViolationExitQualification {
        let mut qualification = EptViolationExitQualification(0);
        qualification.set_execute_access(true);
        qualification.set_readable(true);
        qualification.set_executable(executable);
        qualification.set_user_mode_executable(user_executable);
        qualification
    }

    fn initialized() -> (ExecTrap, Vec<Vcpu<MockVmcs>>, MockEvents) {
        let exec_trap = engine();
        let mut processors = processors();
        let events = MockEvents::default();
        exec_trap.initialize(&mut processors, &Sequential, &events, true).unwrap();
        (exec_trap, processors, events)
    }

    #[test]
    fn initialize_requires_mbec() {
        let exec_trap = engine();
        let mut processors = processors();

        assert_eq!(
            exec_trap.initialize(&mut processors, &Sequential, &MockEvents::default(), false),
            Err(HypervisorError::MbecUnsupported)
        );
        assert!(!exec_trap.is_initialized());
        assert!(processors.iter().all(|processor| processor.vmcs().writes.is_empty()));
    }

    #[test]
    fn initialize_loads_mode_based_eptp_and_enables_cr3_exiting() {
        let (exec_trap, mut processors, _) = initialized();
        assert!(exec_trap.is_initialized());

        for processor in processors.iter_mut() {
            assert!(processor.is_not_normal_eptp());
            assert_eq!(processor.vmcs().field(control::EPTP_FULL), processor.mode_based_ept().eptp());
            assert_eq!(
                processor.vmcs().field(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & CR3_LOAD_EXITING,
                CR3_LOAD_EXITING
            );

            let ram = *processor.mode_based_ept_mut().ept_mut().leaf_entry_mut(0x20_0000).unwrap();
            assert!(!ram.writable() && ram.user_mode_execute());
        }
    }

    #[test]
    fn cr3_exits_scope_mbec_to_watched_processes() {
        let (exec_trap, mut processors, events) = initialized();
        exec_trap.add_process(WATCHED).unwrap();
        let processor = &mut processors[0];

        exec_trap.handle_cr3_exit(processor, WATCHED);
        assert!(processor.is_mbec_enabled());
        assert_eq!(
            processor.vmcs().field(control::SECONDARY_PROCBASED_EXEC_CONTROLS) & MODE_BASED_EPT_EXECUTE,
            MODE_BASED_EPT_EXECUTE
        );
        assert_eq!(processor.eptp_state(), EptpState::UserExecuteDisabled);

        exec_trap.handle_cr3_exit(processor, WATCHED + 4);
        assert!(!processor.is_mbec_enabled());
        assert_eq!(processor.vmcs().field(control::SECONDARY_PROCBASED_EXEC_CONTROLS), 0);
        assert_eq!(processor.eptp_state(), EptpState::Normal);

        assert!(events.dispatched.borrow().is_empty());
    }

    #[test]
    fn cr3_exits_are_ignored_until_initialized() {
        let exec_trap = engine();
        exec_trap.add_process(WATCHED).unwrap();
        let mut processor = vcpu(0);

        exec_trap.handle_cr3_exit(&mut processor, WATCHED);

        assert!(!processor.is_mbec_enabled());
        assert!(processor.vmcs().writes.is_empty());
    }

    #[test]
    fn violations_alternate_between_user_and_kernel() {
        let (exec_trap, mut processors, events) = initialized();
        exec_trap.add_process(WATCHED).unwrap();
        let processor = &mut processors[1];
        exec_trap.handle_cr3_exit(processor, WATCHED);

        for _ in 0..3 {
            // User-mode execute is disabled: the process reached user mode.
            assert!(exec_trap.handle_ept_violation(processor, &events, violation(true, false)));
            assert_eq!(processor.eptp_state(), EptpState::KernelExecuteDisabled);
            assert!(processor.take_rip_suppression());

            // Supervisor execute is disabled: the process is back in the kernel.
            assert!(exec_trap.handle_ept_violation(processor, &events, violation(false, true)));
            assert_eq!(processor.eptp_state(), EptpState::UserExecuteDisabled);
            assert!(processor.take_rip_suppression());
        }

        let dispatched = events.dispatched.borrow();
        assert_eq!(dispatched.len(), 6);
        for (i, &(core, mode)) in dispatched.iter().enumerate() {
            assert_eq!(core, 1);
            let expected = if i % 2 == 0 { ExecutionMode::User } else { ExecutionMode::Kernel };
            assert_eq!(mode, expected);
        }
    }

    #[test]
    fn unrelated_violations_are_left_to_the_caller() {
        let (exec_trap, mut processors, events) = initialized();
        let processor = &mut processors[0];

        let mut write = EptViolationExitQualification(0);
        write.set_write_access(true);
        write.set_readable(true);
        write.set_executable(true);
        write.set_user_mode_executable(true);

        assert!(!exec_trap.handle_ept_violation(processor, &events, write));
        assert!(!processor.take_rip_suppression());
        assert!(events.dispatched.borrow().is_empty());
    }

    #[test]
    fn violations_are_ignored_until_initialized() {
        let exec_trap = engine();
        let events = MockEvents::default();
        let mut processor = vcpu(0);

        assert!(!exec_trap.handle_ept_violation(&mut processor, &events, violation(true, false)));
        assert!(events.dispatched.borrow().is_empty());
    }

    #[test]
    fn uninitialize_restores_normal_eptp() {
        let (exec_trap, mut processors, events) = initialized();
        exec_trap.add_process(WATCHED).unwrap();
        exec_trap.handle_cr3_exit(&mut processors[0], WATCHED);

        exec_trap.uninitialize(&mut processors, &Sequential, &events).unwrap();

        assert!(!exec_trap.is_initialized());
        assert!(!exec_trap.is_uninitializing());
        for processor in &processors {
            assert!(!processor.is_not_normal_eptp());
            assert!(!processor.is_mbec_enabled());
            assert_eq!(processor.eptp_state(), EptpState::Normal);
            assert_eq!(processor.vmcs().field(control::EPTP_FULL), processor.eptp());
            assert_eq!(processor.vmcs().field(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & CR3_LOAD_EXITING, 0);
        }

        // A second call is a no-op.
        let writes = processors[0].vmcs().writes.len();
        exec_trap.uninitialize(&mut processors, &Sequential, &events).unwrap();
        assert_eq!(processors[0].vmcs().writes.len(), writes);
    }

    /// Raises a user-mode fetch fault on every processor right before it runs the broadcast
    /// operation.
    struct FaultingBroadcast<'a> {
        exec_trap: &'a ExecTrap,
        events: &'a MockEvents,
        handled: RefCell<Vec<bool>>,
    }

    impl Broadcast for FaultingBroadcast<'_> {
        fn on_each_processor<V: VmcsAccessor>(
            &self,
            processors: &mut [Vcpu<V>],
            operation: &mut dyn FnMut(&mut Vcpu<V>),
        ) -> Result<(), HypervisorError> {
            for processor in processors.iter_mut() {
                let handled = self
                    .exec_trap
                    .handle_ept_violation(processor, self.events, violation(true, false));
                self.handled.borrow_mut().push(handled);
                processor.take_rip_suppression();
                operation(processor);
            }
            Ok(())
        }
    }

    #[test]
    fn violations_during_teardown_are_still_handled() {
        let (exec_trap, mut processors, events) = initialized();
        exec_trap.add_process(WATCHED).unwrap();
        for processor in processors.iter_mut() {
            exec_trap.handle_cr3_exit(processor, WATCHED);
        }

        let broadcast = FaultingBroadcast {
            exec_trap: &exec_trap,
            events: &events,
            handled: RefCell::new(Vec::new()),
        };
        exec_trap.uninitialize(&mut processors, &broadcast, &events).unwrap();

        // Two teardown broadcasts over two processors.
        assert_eq!(*broadcast.handled.borrow(), [true; 4]);
        assert_eq!(events.dispatched.borrow().len(), 4);
        for processor in &processors {
            assert_eq!(processor.eptp_state(), EptpState::Normal);
            assert!(!processor.is_not_normal_eptp());
            assert!(!processor.is_mbec_enabled());
        }

        assert!(!exec_trap.handle_ept_violation(&mut processors[0], &events, violation(true, false)));
    }

    #[test]
    fn uninitialize_keeps_cr3_exiting_for_process_tracing() {
        let (exec_trap, mut processors, _) = initialized();
        let events = MockEvents {
            tracing: vec![TracingFeature::WaitingForMovCr3VmExits],
            ..Default::default()
        };

        exec_trap.uninitialize(&mut processors, &Sequential, &events).unwrap();

        assert_eq!(
            processors[0].vmcs().field(control::PRIMARY_PROCBASED_EXEC_CONTROLS) & CR3_LOAD_EXITING,
            CR3_LOAD_EXITING
        );
        assert_eq!(processors[0].vmcs().field(control::EPTP_FULL), processors[0].eptp());
    }

    #[test]
    fn priming_makes_process_tables_writable() {
        use crate::utils::addresses::tests::MockAddressSpace;

        let (exec_trap, mut processors, _) = initialized();
        let mut address_space = MockAddressSpace::new(0x1000);
        address_space.table_mut(0x60_0000)[0] = 0x80_0000 | 0b11;

        exec_trap
            .prime_process(&mut processors, &Sequential, &address_space, 0x60_0000, 0x2000)
            .unwrap();

        for processor in processors.iter_mut() {
            let eptp = processor.mode_based_ept().eptp();
            assert_eq!(processor.vmcs().invalidations.last(), Some(&eptp));
            let ept = processor.mode_based_ept_mut().ept_mut();
            assert!(ept.leaf_entry_mut(0x60_0000).unwrap().writable());
            assert!(ept.leaf_entry_mut(0x80_0000).unwrap().writable());
            assert!(!ept.leaf_entry_mut(0xA0_0000).unwrap().writable());
        }
    }

    #[test]
    fn watch_list_operations() {
        let exec_trap = engine();
        exec_trap.add_process(3).unwrap();
        assert!(exec_trap.watch_list().contains(3));
        assert!(exec_trap.remove_process(3));
        assert!(!exec_trap.remove_process(3));
    }
}
