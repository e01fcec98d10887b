#![no_std]

pub mod cpu;
pub mod fence;
#[cfg(target_arch = "riscv64")]
pub mod interrupts;
pub mod mem;
#[cfg(target_arch = "riscv64")]
pub mod power;
#[cfg(target_arch = "riscv64")]
pub mod utils;
