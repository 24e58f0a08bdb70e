//! Intel® 64 and IA-32 Architectures Software Developer's Manual: 29.3 THE EXTENDED PAGE TABLE MECHANISM (EPT)
//!
//! Guest-physical addresses are translated by traversing a set of EPT paging structures to
//! produce physical addresses that are used to access memory. Each processor owns an identity
//! mapped hierarchy for normal execution and a second one with mode-based execute permissions
//! that the execute-trap engine toggles.

pub mod layout;
pub mod mtrr;
pub mod paging;
pub mod state;
