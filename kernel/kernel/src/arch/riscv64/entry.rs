//! Entry point of every hart
//!
//! The firmware starts harts at `_start` with their hart id in `a0` and the address of the device tree in `a1`.
//! Each hart gets its own boot stack, keeps its hart id in `tp` and then continues in [`start_rust`] where exactly one
//! of them is chosen to bring up the kernel.

use core::arch::global_asm;
use core::ptr::addr_of_mut;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel::config::{BOOT_STACK_SIZE, NUM_HARTS};

#[repr(C, align(4096))]
struct BootStacks([[u8; BOOT_STACK_SIZE]; NUM_HARTS]);

/// Stacks of all harts, placed in front of `.bss` so that clearing it does not pull them away from under running harts
#[link_section = ".bss.boot_stacks"]
static mut BOOT_STACKS: BootStacks = BootStacks([[0; BOOT_STACK_SIZE]; NUM_HARTS]);

const NO_BOOT_HART: usize = usize::MAX;

/// Id of the hart which brings up the kernel
static BOOT_HART: AtomicUsize = AtomicUsize::new(NO_BOOT_HART);

global_asm!(
    r#"
    .section .text._start, "ax", @progbits
    .globl _start
_start:
    .option push
    .option norelax
    la gp, __global_pointer$
    .option pop

    csrw sie, zero
    mv tp, a0

    // harts without a stack are parked
    li t0, {num_harts}
    bgeu a0, t0, 2f

    // sp = stacks + (hart id + 1) * stack size
    la sp, {stacks}
    li t0, {stack_size}
    addi t1, a0, 1
    mul t0, t0, t1
    add sp, sp, t0

    call {start_rust}

2:
    wfi
    j 2b
"#,
    num_harts = const NUM_HARTS,
    stacks = sym BOOT_STACKS,
    stack_size = const BOOT_STACK_SIZE,
    start_rust = sym start_rust,
);

extern "C" fn start_rust(hart_id: usize, dtb: usize) -> ! {
    match BOOT_HART.compare_exchange(NO_BOOT_HART, hart_id, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => {
            // Safety: no other hart touches .bss before the boot hart releases it
            unsafe { clear_bss() };
            crate::boot_hart_main(hart_id, dtb)
        }
        Err(_) => crate::secondary_hart_main(hart_id),
    }
}

/// Zero the `.bss` section.
///
/// # Safety
/// Must be called exactly once before anything in `.bss` is used.
unsafe fn clear_bss() {
    extern "C" {
        static mut __bss_start: u8;
        static mut __bss_end: u8;
    }

    let start = addr_of_mut!(__bss_start);
    let end = addr_of_mut!(__bss_end);
    for i in 0..(end as usize - start as usize) {
        start.add(i).write_volatile(0);
    }
}
