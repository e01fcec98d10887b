use core::fmt;
use core::fmt::Write;

/// Writer used when not running on the kernels target.
///
/// There is no firmware console to write to, so all output is discarded.
pub struct HostWriter {}

impl Write for HostWriter {
    fn write_str(&mut self, _s: &str) -> fmt::Result {
        Ok(())
    }
}
