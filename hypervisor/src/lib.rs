//! Traps user/kernel mode transitions of selected processes with mode-based execute control
//! for EPT, and arbitrates the VMCS controls shared by the debugger's event features.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod events;
pub mod intel;
pub mod logger;
pub mod utils;
