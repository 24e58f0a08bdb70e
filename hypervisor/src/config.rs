//! Compile-time limits for the execute-trap engine.

/// Maximum number of process identifiers the watch-list can hold.
pub const MAX_WATCHED_PROCESSES: usize = 100;

/// Maximum number of physical RAM ranges captured from the firmware memory map.
pub const MAX_RAM_RANGES: usize = 32;

/// I/O port base of the serial port used by the default logger (COM2).
pub const DEFAULT_LOGGER_PORT: u16 = 0x2f8;
