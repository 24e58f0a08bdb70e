use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypervisorError {
    #[error("Mode-based execute control for EPT is not supported by the processor")]
    MbecUnsupported,
    #[error("Process watch-list is full")]
    WatchListFull,
    #[error("Physical address could not be translated to a virtual address")]
    UnresolvablePhysicalAddress,
    #[error("EPT PML4 base address is not 4KB aligned")]
    InvalidEptPml4BaseAddress,
    #[error("Failed allocate memory")]
    MemoryAllocationFailed,
    #[error("Failed to switch execution to processor")]
    ProcessorSwitchFailed,
    #[error("Exception vector is outside of the exception bitmap")]
    InvalidExceptionVector,
    #[error("Failed to read the physical memory ranges")]
    MemoryRangesUnavailable,
    #[error("Unknown VM exit reason")]
    UnknownVmExitReason,
    #[error("Unhandled VM exit")]
    UnhandledVmExit,
}
