pub mod controls;
pub mod ept;
pub mod exceptions;
pub mod exec_trap;
pub mod protected;
pub mod registers;
pub mod support;
pub mod vcpu;
pub mod vmerror;
pub mod vmexit;
