//! Running an operation on every logical processor.

use crate::{
    error::HypervisorError,
    intel::{support::VmcsAccessor, vcpu::Vcpu},
};

/// Runs an operation once per virtual processor, on that processor, and returns after
/// every processor has completed it.
pub trait Broadcast {
    fn on_each_processor<V: VmcsAccessor>(
        &self,
        processors: &mut [Vcpu<V>],
        operation: &mut dyn FnMut(&mut Vcpu<V>),
    ) -> Result<(), HypervisorError>;
}

/// Runs the operation for each processor in turn on the calling processor.
///
/// Suitable where every VMCS is reachable from the caller, such as a single processor
/// system or an emulated VMCS.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sequential;

impl Broadcast for Sequential {
    fn on_each_processor<V: VmcsAccessor>(
        &self,
        processors: &mut [Vcpu<V>],
        operation: &mut dyn FnMut(&mut Vcpu<V>),
    ) -> Result<(), HypervisorError> {
        processors.iter_mut().for_each(|processor| operation(processor));
        Ok(())
    }
}

#[cfg(windows)]
pub use self::windows::{processor_count, AffinityBroadcast, ProcessorExecutor};

#[cfg(windows)]
mod windows {
    use {
        super::Broadcast,
        crate::{
            error::HypervisorError,
            intel::{support::VmcsAccessor, vcpu::Vcpu},
        },
        core::mem::MaybeUninit,
        wdk_sys::{
            ntddk::{
                KeGetProcessorNumberFromIndex, KeQueryActiveProcessorCountEx,
                KeRevertToUserGroupAffinityThread, KeSetSystemGroupAffinityThread,
            },
            ALL_PROCESSOR_GROUPS, GROUP_AFFINITY, NTSTATUS, NT_SUCCESS, PROCESSOR_NUMBER,
        },
    };

    #[link(name = "ntoskrnl")]
    extern "system" {
        ///undocumented
        fn ZwYieldExecution() -> NTSTATUS;
    }

    /// Returns the number of active logical processors in the system.
    pub fn processor_count() -> u32 {
        unsafe { KeQueryActiveProcessorCountEx(ALL_PROCESSOR_GROUPS as _) }
    }

    fn processor_number_from_index(index: u32) -> Option<PROCESSOR_NUMBER> {
        let mut processor_number: MaybeUninit<PROCESSOR_NUMBER> = MaybeUninit::uninit();
        let status = unsafe { KeGetProcessorNumberFromIndex(index, processor_number.as_mut_ptr()) };

        if NT_SUCCESS(status) {
            Some(unsafe { processor_number.assume_init() })
        } else {
            None
        }
    }

    /// Pins the current thread to one processor until dropped.
    pub struct ProcessorExecutor {
        old_affinity: MaybeUninit<GROUP_AFFINITY>,
    }

    impl ProcessorExecutor {
        /// Switches the execution context to processor `i`.
        ///
        /// # Returns
        ///
        /// `None` if the index is out of range or the thread could not be rescheduled.
        pub fn switch_to_processor(i: u32) -> Option<Self> {
            if i >= processor_count() {
                log::error!("Invalid processor index: {}", i);
                return None;
            }

            let processor_number = processor_number_from_index(i)?;

            let mut old_affinity: MaybeUninit<GROUP_AFFINITY> = MaybeUninit::uninit();
            let mut affinity: GROUP_AFFINITY = unsafe { core::mem::zeroed() };

            affinity.Group = processor_number.Group;
            affinity.Mask = 1 << processor_number.Number;

            log::trace!("Switching execution to processor {}", i);
            unsafe { KeSetSystemGroupAffinityThread(&mut affinity, old_affinity.as_mut_ptr()) };

            if !NT_SUCCESS(unsafe { ZwYieldExecution() }) {
                unsafe { KeRevertToUserGroupAffinityThread(old_affinity.as_mut_ptr()) };
                return None;
            }

            Some(Self { old_affinity })
        }
    }

    impl Drop for ProcessorExecutor {
        fn drop(&mut self) {
            unsafe { KeRevertToUserGroupAffinityThread(self.old_affinity.as_mut_ptr()) };
        }
    }

    /// Runs the operation on each processor by migrating the calling thread to it.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct AffinityBroadcast;

    impl Broadcast for AffinityBroadcast {
        fn on_each_processor<V: VmcsAccessor>(
            &self,
            processors: &mut [Vcpu<V>],
            operation: &mut dyn FnMut(&mut Vcpu<V>),
        ) -> Result<(), HypervisorError> {
            for processor in processors.iter_mut() {
                let Some(executor) = ProcessorExecutor::switch_to_processor(processor.id()) else {
                    return Err(HypervisorError::ProcessorSwitchFailed);
                };

                operation(processor);

                core::mem::drop(executor);
            }

            Ok(())
        }
    }
}
