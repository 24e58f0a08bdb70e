//! Logger setup for the hypervisor.
//!
//! Once VMX root operation is entered the kernel debugger output becomes unreliable, so
//! records are written to a serial port by default. The `kernel-log` feature switches the
//! backend to `DbgPrint` on Windows targets.

use {crate::config::DEFAULT_LOGGER_PORT, log::LevelFilter};

/// Settings for the global logger.
#[derive(Debug, Clone, Copy)]
pub struct LoggerConfig {
    /// Base I/O port of the serial port records are written to.
    pub port: u16,
    /// Maximum level of records that are emitted.
    pub level: LevelFilter,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_LOGGER_PORT,
            level: LevelFilter::Info,
        }
    }
}

/// Installs the global logger described by `config`.
///
/// Only the first call installs a backend; later calls leave the existing logger in place.
pub fn init(config: &LoggerConfig) {
    #[cfg(all(windows, feature = "kernel-log"))]
    {
        if kernel_log::KernelLogger::init(config.level).is_err() {
            log::warn!("Kernel logger already installed");
        }
    }

    #[cfg(not(all(windows, feature = "kernel-log")))]
    {
        com_logger::builder()
            .base(config.port)
            .filter(config.level)
            .setup();
    }

    log::info!("Logger initialized (level {})", config.level);
}
