pub mod addresses;
pub mod alloc;
pub mod instructions;
pub mod memory_map;
pub mod processor;
