//! Compile-time configuration of the kernel for the QEMU `virt` board

use log::Level;
use riscv::mem::{PAddr, PAGESIZE};

/// How many harts the kernel supports
pub const NUM_HARTS: usize = 4;

/// Bit mask which selects every supported hart in a remote fence
pub const ALL_HARTS_MASK: usize = (1 << NUM_HARTS) - 1;

/// Size of the stack each hart boots on
pub const BOOT_STACK_SIZE: usize = 4 * PAGESIZE;

/// The maximum log level that is active right after boot
pub const LOG_LEVEL: Level = Level::Debug;

/// Start of physical RAM
pub const RAM_START: PAddr = 0x8000_0000;

/// Amount of physical RAM that the kernel manages
pub const RAM_SIZE: u64 = 128 * 1024 * 1024;

/// End of physical RAM (exclusive)
pub const RAM_END: PAddr = RAM_START + RAM_SIZE;

/// Where the firmware places the kernel image
pub const KERNEL_LOAD_ADDR: PAddr = 0x8020_0000;

/// A window of memory mapped device registers
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MmioRegion {
    pub name: &'static str,
    pub base: PAddr,
    pub len: u64,
}

pub const UART0: MmioRegion = MmioRegion {
    name: "uart0",
    base: 0x1000_0000,
    len: PAGESIZE as u64,
};

pub const VIRTIO0: MmioRegion = MmioRegion {
    name: "virtio0",
    base: 0x1000_1000,
    len: PAGESIZE as u64,
};

/// Goldfish real time clock
pub const RTC: MmioRegion = MmioRegion {
    name: "rtc",
    base: 0x0010_1000,
    len: PAGESIZE as u64,
};

/// Platform level interrupt controller
pub const PLIC: MmioRegion = MmioRegion {
    name: "plic",
    base: 0x0c00_0000,
    len: 1024 * PAGESIZE as u64,
};

/// All device windows that are identity mapped into the kernel address space
pub const MMIO_REGIONS: [MmioRegion; 4] = [UART0, VIRTIO0, RTC, PLIC];
