//! A logging implementation which uses an OpenSBI syscall to print characters
use core::fmt::Write;

use crate::print::KernelWriter;
use ksync::SpinLock;
use log::{Level, Log, Metadata, Record, SetLoggerError};

/// A [`Log`] implementation that writes one line per record to the firmware console.
///
/// Lines are written while holding a lock so that records logged by different harts don't interleave.
pub struct KernelLogger {
    pub initial_log_level: Level,
    line_lock: SpinLock<()>,
}

impl KernelLogger {
    pub const fn new(max_log_level: Level) -> KernelLogger {
        KernelLogger {
            initial_log_level: max_log_level,
            line_lock: SpinLock::new(()),
        }
    }

    pub fn install(&'static self) -> Result<(), SetLoggerError> {
        log::set_logger(self).map(|_| log::set_max_level(self.initial_log_level.to_level_filter()))
    }

    pub fn update_log_level(&'static self, level: Level) {
        log::set_max_level(level.to_level_filter());
    }
}

impl Log for KernelLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let _line = self.line_lock.spin_lock();
            // there is nowhere left to report a failing console to
            let _ = KernelWriter {}.write_fmt(format_args!(
                "{} {}: {}\n",
                record.level(),
                record.target(),
                record.args(),
            ));
        }
    }

    fn flush(&self) {}
}
