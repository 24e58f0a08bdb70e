//! Exception vectors as they appear in the VMCS exception bitmap.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.6.3 Exception Bitmap

use crate::error::HypervisorError;

/// Exceptions the hypervisor intercepts on behalf of the debugger.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: Table 6-1. Exceptions and Interrupts
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionVector {
    /// Divide Error
    DivideError = 0,
    /// Debug
    Debug = 1,
    /// Breakpoint
    Breakpoint = 3,
    /// Invalid Opcode (Undefined Opcode)
    InvalidOpcode = 6,
    /// General Protection
    GeneralProtection = 13,
    /// Page Fault
    PageFault = 14,
}

impl ExceptionVector {
    /// The bit of this vector in the exception bitmap.
    pub const fn mask(self) -> u32 {
        1 << self as u8
    }
}

/// Which exception bitmap bits a set/unset request touches.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ExceptionSelector {
    /// A single vector in the range 0..32.
    Vector(u8),
    /// All of the first 32 vectors.
    All,
}

impl ExceptionSelector {
    /// Bitmap bits covered by this selector.
    pub fn mask(self) -> Result<u32, HypervisorError> {
        match self {
            Self::All => Ok(u32::MAX),
            Self::Vector(vector) if vector < 32 => Ok(1 << vector),
            Self::Vector(_) => Err(HypervisorError::InvalidExceptionVector),
        }
    }
}

impl From<ExceptionVector> for ExceptionSelector {
    fn from(vector: ExceptionVector) -> Self {
        Self::Vector(vector as u8)
    }
}
