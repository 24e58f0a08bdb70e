//! Who still needs each protected VMCS resource.
//!
//! Every resource is guarded by an ordered table of demand sources. A source is a read-only
//! query on the debugger's event subsystem, optionally tied to the pass-over flag that lets a
//! command which is itself removing that kind of event ignore it.

use {
    crate::{
        events::{DebuggerEvents, EventKind, TracingFeature},
        intel::exceptions::ExceptionVector,
    },
    bitflags::bitflags,
};

bitflags! {
    /// Demand sources to ignore while deciding whether a resource may be released.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PassOver: u32 {
        const EXCEPTION_EVENTS = 1 << 0;
        const INTERRUPT_EVENTS = 1 << 1;
        const TSC_EVENTS = 1 << 2;
        const MOV_TO_HW_DEBUG_REGS_EVENTS = 1 << 3;
        const UD_EXCEPTIONS_FOR_SYSCALL_SYSRET_HOOK = 1 << 4;
        const MOV_TO_CONTROL_REGS_EVENTS = 1 << 5;
    }
}

/// A boolean demand on a VM-execution control.
pub struct Demand {
    /// Shown in trace output when the demand vetoes a release.
    pub name: &'static str,
    /// The flag that suppresses this demand, or empty if it can never be passed over.
    pub pass_over: PassOver,
    active: fn(&dyn DebuggerEvents, u32) -> bool,
}

impl Demand {
    /// Whether this demand keeps the control enabled on `core`.
    pub fn is_active(&self, events: &dyn DebuggerEvents, core: u32, pass_over: PassOver) -> bool {
        if !self.pass_over.is_empty() && pass_over.contains(self.pass_over) {
            return false;
        }

        (self.active)(events, core)
    }
}

/// A demand on bits of the exception bitmap.
pub struct ExceptionDemand {
    pub name: &'static str,
    pub pass_over: PassOver,
    bits: fn(&dyn DebuggerEvents, u32) -> u32,
}

impl ExceptionDemand {
    /// Exception bitmap bits this demand requires on `core`.
    pub fn bits(&self, events: &dyn DebuggerEvents, core: u32, pass_over: PassOver) -> u32 {
        if !self.pass_over.is_empty() && pass_over.contains(self.pass_over) {
            return 0;
        }

        (self.bits)(events, core)
    }
}

/// VM-execution controls whose release is arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectedControl {
    ExternalInterruptExiting,
    RdtscExiting,
    MovDebugRegistersExiting,
    MovToControlRegisterExiting,
    Cr3LoadExiting,
}

impl ProtectedControl {
    pub fn demands(self) -> &'static [Demand] {
        match self {
            Self::ExternalInterruptExiting => EXTERNAL_INTERRUPT_DEMANDS,
            Self::RdtscExiting => RDTSC_DEMANDS,
            Self::MovDebugRegistersExiting => MOV_DR_DEMANDS,
            Self::MovToControlRegisterExiting => MOV_TO_CR_DEMANDS,
            Self::Cr3LoadExiting => CR3_LOAD_DEMANDS,
        }
    }

    /// The first active demand on this control, in table order.
    pub fn vetoing_demand(
        self,
        events: &dyn DebuggerEvents,
        core: u32,
        pass_over: PassOver,
    ) -> Option<&'static Demand> {
        self.demands()
            .iter()
            .find(|demand| demand.is_active(events, core, pass_over))
    }
}

/// Exception bitmap bits still required on `core`.
pub fn required_exceptions(events: &dyn DebuggerEvents, core: u32, pass_over: PassOver) -> u32 {
    EXCEPTION_BITMAP_DEMANDS
        .iter()
        .fold(0, |bitmap, demand| bitmap | demand.bits(events, core, pass_over))
}

fn has_events(events: &dyn DebuggerEvents, core: u32, kind: EventKind) -> bool {
    events.count_events(core, kind) != 0
}

const fn bits_if(active: bool, bits: u32) -> u32 {
    if active {
        bits
    } else {
        0
    }
}

fn exception_events(events: &dyn DebuggerEvents, core: u32) -> u32 {
    events.exception_event_bitmap(core)
}

fn syscall_hooks(events: &dyn DebuggerEvents, core: u32) -> u32 {
    let hooked = has_events(events, core, EventKind::SyscallHookEferSyscall)
        || has_events(events, core, EventKind::SyscallHookEferSysret);
    bits_if(hooked, ExceptionVector::InvalidOpcode.mask())
}

fn debugger_session(events: &dyn DebuggerEvents, _core: u32) -> u32 {
    bits_if(
        events.is_debugger_active(),
        ExceptionVector::Breakpoint.mask() | ExceptionVector::Debug.mask(),
    )
}

fn debug_register_interception_exceptions(events: &dyn DebuggerEvents, core: u32) -> u32 {
    bits_if(
        debug_register_interception(events, core),
        ExceptionVector::Debug.mask(),
    )
}

fn page_fault_tracing_exceptions(events: &dyn DebuggerEvents, core: u32) -> u32 {
    bits_if(
        page_fault_tracing(events, core),
        ExceptionVector::PageFault.mask(),
    )
}

fn ept_hooks(events: &dyn DebuggerEvents, _core: u32) -> u32 {
    bits_if(events.ept_hook_count() != 0, ExceptionVector::Breakpoint.mask())
}

fn interrupt_events(events: &dyn DebuggerEvents, core: u32) -> bool {
    has_events(events, core, EventKind::ExternalInterruptOccurred)
}

fn thread_change_interception(events: &dyn DebuggerEvents, core: u32) -> bool {
    events.is_tracing_active(core, TracingFeature::InterruptsForThreadChange)
}

fn process_change_interception(events: &dyn DebuggerEvents, core: u32) -> bool {
    events.is_tracing_active(core, TracingFeature::InterruptsForProcessChange)
}

fn tsc_events(events: &dyn DebuggerEvents, core: u32) -> bool {
    has_events(events, core, EventKind::TscInstructionExecution)
}

fn transparent_mode(events: &dyn DebuggerEvents, _core: u32) -> bool {
    events.is_transparent_mode()
}

fn dr_events(events: &dyn DebuggerEvents, core: u32) -> bool {
    has_events(events, core, EventKind::DebugRegistersAccessed)
}

fn debug_register_interception(events: &dyn DebuggerEvents, core: u32) -> bool {
    events.is_tracing_active(core, TracingFeature::DebugRegisterInterception)
}

fn crwrite_events(events: &dyn DebuggerEvents, core: u32) -> bool {
    has_events(events, core, EventKind::ControlRegisterModified)
}

fn waiting_for_mov_cr3(events: &dyn DebuggerEvents, core: u32) -> bool {
    events.is_tracing_active(core, TracingFeature::WaitingForMovCr3VmExits)
}

fn page_fault_tracing(events: &dyn DebuggerEvents, _core: u32) -> bool {
    events.is_user_debugger_page_fault_tracing_active()
}

pub const EXCEPTION_BITMAP_DEMANDS: &[ExceptionDemand] = &[
    ExceptionDemand {
        name: "!exception events",
        pass_over: PassOver::EXCEPTION_EVENTS,
        bits: exception_events,
    },
    ExceptionDemand {
        name: "!syscall/!sysret hooks",
        pass_over: PassOver::UD_EXCEPTIONS_FOR_SYSCALL_SYSRET_HOOK,
        bits: syscall_hooks,
    },
    ExceptionDemand {
        name: "debugger session",
        pass_over: PassOver::empty(),
        bits: debugger_session,
    },
    ExceptionDemand {
        name: "debug register thread interception",
        pass_over: PassOver::empty(),
        bits: debug_register_interception_exceptions,
    },
    ExceptionDemand {
        name: "user debugger page-fault tracing",
        pass_over: PassOver::empty(),
        bits: page_fault_tracing_exceptions,
    },
    ExceptionDemand {
        name: "EPT hooks",
        pass_over: PassOver::empty(),
        bits: ept_hooks,
    },
];

pub const EXTERNAL_INTERRUPT_DEMANDS: &[Demand] = &[
    Demand {
        name: "!interrupt events",
        pass_over: PassOver::INTERRUPT_EVENTS,
        active: interrupt_events,
    },
    Demand {
        name: "thread change interception",
        pass_over: PassOver::empty(),
        active: thread_change_interception,
    },
    Demand {
        name: "process change interception",
        pass_over: PassOver::empty(),
        active: process_change_interception,
    },
];

pub const RDTSC_DEMANDS: &[Demand] = &[
    Demand {
        name: "!tsc events",
        pass_over: PassOver::TSC_EVENTS,
        active: tsc_events,
    },
    Demand {
        name: "transparent mode",
        pass_over: PassOver::empty(),
        active: transparent_mode,
    },
];

pub const MOV_DR_DEMANDS: &[Demand] = &[
    Demand {
        name: "!dr events",
        pass_over: PassOver::MOV_TO_HW_DEBUG_REGS_EVENTS,
        active: dr_events,
    },
    Demand {
        name: "debug register thread interception",
        pass_over: PassOver::empty(),
        active: debug_register_interception,
    },
];

pub const MOV_TO_CR_DEMANDS: &[Demand] = &[Demand {
    name: "!crwrite events",
    pass_over: PassOver::MOV_TO_CONTROL_REGS_EVENTS,
    active: crwrite_events,
}];

pub const CR3_LOAD_DEMANDS: &[Demand] = &[
    Demand {
        name: "process change interception",
        pass_over: PassOver::empty(),
        active: waiting_for_mov_cr3,
    },
    Demand {
        name: "user debugger page-fault tracing",
        pass_over: PassOver::empty(),
        active: page_fault_tracing,
    },
];
