//! Queries and notifications exchanged with the debugger's event subsystem.
//!
//! The hypervisor never owns debugger state. It only asks whether some registered event,
//! tracing feature or debugger session still depends on a VMCS resource, and it reports
//! user/kernel mode transitions of watched processes.

/// Kinds of registered debugger events whose per-core count decides whether a VM-exit
/// control must stay enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// `!syscall` events hooking the EFER based syscall path.
    SyscallHookEferSyscall,
    /// `!sysret` events hooking the EFER based sysret path.
    SyscallHookEferSysret,
    /// `!interrupt` events.
    ExternalInterruptOccurred,
    /// `!tsc` events.
    TscInstructionExecution,
    /// `!dr` events.
    DebugRegistersAccessed,
    /// `!crwrite` events.
    ControlRegisterModified,
}

/// Per-core tracing features that keep a VM-exit control alive while they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingFeature {
    /// Thread switches detected through accesses to debug registers.
    DebugRegisterInterception,
    /// Thread switches detected through clock interrupts.
    InterruptsForThreadChange,
    /// Process switches detected through clock interrupts.
    InterruptsForProcessChange,
    /// Process switches detected through MOV to CR3.
    WaitingForMovCr3VmExits,
}

/// The privilege level a watched process has just started executing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    User,
    Kernel,
}

/// The debugger event subsystem as seen by the hypervisor.
///
/// All queries are read-only and must be callable from VMX root mode.
pub trait DebuggerEvents {
    /// Number of registered events of `kind` that apply to `core`.
    fn count_events(&self, core: u32, kind: EventKind) -> usize;

    /// Exception bitmap requested by generic `!exception` events on `core`.
    fn exception_event_bitmap(&self, core: u32) -> u32;

    /// Whether a kernel or user debugger session is attached.
    fn is_debugger_active(&self) -> bool;

    /// Whether `feature` is running on `core`.
    fn is_tracing_active(&self, core: u32, feature: TracingFeature) -> bool;

    /// Whether timing side channels are being hidden from the guest.
    fn is_transparent_mode(&self) -> bool;

    /// Number of EPT hooks currently installed.
    fn ept_hook_count(&self) -> usize;

    /// Whether the user debugger intercepts page faults and CR3 loads.
    fn is_user_debugger_page_fault_tracing_active(&self) -> bool;

    /// Reports that a watched process on `core` has just entered `mode`.
    fn dispatch_mode_event(&self, core: u32, mode: ExecutionMode);
}
