use core::fmt;
use core::fmt::Write;

#[cfg(target_arch = "riscv64")]
mod sbi_print;

#[cfg(target_arch = "riscv64")]
pub use sbi_print::SbiWriter as KernelWriter;

#[cfg(not(target_arch = "riscv64"))]
mod host_print;

#[cfg(not(target_arch = "riscv64"))]
pub use host_print::HostWriter as KernelWriter;

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    // the writers are infallible
    let _ = KernelWriter {}.write_fmt(args);
}

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::print::_print(format_args!($($arg)*)));
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}
