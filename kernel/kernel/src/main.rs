#![cfg_attr(target_arch = "riscv64", no_std)]
#![cfg_attr(target_arch = "riscv64", no_main)]

#[cfg(target_arch = "riscv64")]
#[path = "arch/riscv64/entry.rs"]
mod entry;

#[cfg(target_arch = "riscv64")]
use {
    allocators::PageAllocator,
    core::panic::PanicInfo,
    core::sync::atomic::{AtomicU64, Ordering},
    kernel::config,
    kernel::hart::HartTable,
    kernel::mem::{build_kernel_space, KernelImage},
    klog::{println, KernelLogger},
    ksync::{HartState, Mutex},
    riscv::fence::{Mmu, SbiMmu},
    riscv::interrupts::SupervisorInterrupts,
    riscv::mem::{satp_of, AddressSpaceManager, MemoryPage, PAddr, PhysMapping},
};

#[cfg(target_arch = "riscv64")]
static LOGGER: KernelLogger = KernelLogger::new(config::LOG_LEVEL);

#[cfg(target_arch = "riscv64")]
static HARTS: HartTable<SupervisorInterrupts> = HartTable::new([
    HartState::new(0, SupervisorInterrupts),
    HartState::new(1, SupervisorInterrupts),
    HartState::new(2, SupervisorInterrupts),
    HartState::new(3, SupervisorInterrupts),
]);

#[cfg(target_arch = "riscv64")]
const NOT_READY: u64 = u64::MAX;

/// Root page table of the kernel address space, published by the boot hart once it is active
#[cfg(target_arch = "riscv64")]
static KERNEL_ROOT: AtomicU64 = AtomicU64::new(NOT_READY);

#[cfg(target_arch = "riscv64")]
#[panic_handler]
fn panic_handler(info: &PanicInfo) -> ! {
    // print panic message
    println!("!!! Kernel Panic !!!\n  {}", info);

    // halt the machine
    riscv::power::abort()
}

/// Bring up the kernel address space and release all other harts into it
#[cfg(target_arch = "riscv64")]
fn boot_hart_main(hart_id: usize, dtb: usize) -> ! {
    LOGGER.install().expect("Could not install logger");
    log::info!("booting on hart {hart_id} (device tree at {dtb:#x})");
    let hart = HARTS.current();

    let image = kernel_image();
    assert_eq!(
        image.start,
        config::KERNEL_LOAD_ADDR,
        "kernel was not loaded where it was linked to"
    );
    log::debug!(
        "kernel image at {:#x}..{:#x} (code up to {:#x})",
        image.start,
        image.end,
        image.text_end
    );

    // Safety: everything after the kernel image is unused and, with translation still disabled, all of it is
    // accessible at its physical address
    let allocator = unsafe {
        PageAllocator::<MemoryPage>::init(
            image.start as usize,
            image.end as usize,
            config::RAM_END as usize,
            image.start as usize as *mut MemoryPage,
        )
    };
    let reserved_end = allocator.reserved_end() as PAddr;
    let allocator = Mutex::new("page allocator", allocator);
    let manager = AddressSpaceManager::new(
        &allocator,
        SbiMmu,
        PhysMapping::identity(),
        config::ALL_HARTS_MASK,
    );

    let root = match build_kernel_space(&manager, hart, &image, reserved_end, config::RAM_END) {
        Ok(root) => root,
        Err(e) => panic!("could not build the kernel address space: {e}"),
    };
    // Safety: the kernel address space identity maps the whole kernel image including all stacks
    unsafe { manager.activate(root) };
    log::info!(
        "kernel address space is active, {} pages of memory are free",
        allocator.lock(hart).free_pages()
    );

    KERNEL_ROOT.store(root, Ordering::Release);
    riscv::utils::wfi_spin()
}

/// Wait until the boot hart has built the kernel address space and switch to it
#[cfg(target_arch = "riscv64")]
fn secondary_hart_main(hart_id: usize) -> ! {
    let root = loop {
        match KERNEL_ROOT.load(Ordering::Acquire) {
            NOT_READY => core::hint::spin_loop(),
            root => break root,
        }
    };

    // Safety: the kernel address space identity maps the whole kernel image including all stacks
    unsafe { SbiMmu.activate(satp_of(root)) };
    log::info!("hart {hart_id} joined the kernel address space");
    riscv::utils::wfi_spin()
}

/// Where the linker placed the kernel
#[cfg(target_arch = "riscv64")]
fn kernel_image() -> KernelImage {
    extern "C" {
        static __kernel_start: u8;
        static __text_end: u8;
        static __kernel_end: u8;
    }

    let addr = |symbol: *const u8| symbol as usize as PAddr;
    unsafe {
        KernelImage {
            start: addr(core::ptr::addr_of!(__kernel_start)),
            text_end: addr(core::ptr::addr_of!(__text_end)),
            end: addr(core::ptr::addr_of!(__kernel_end)),
        }
    }
}

#[cfg(not(target_arch = "riscv64"))]
fn main() {
    eprintln!("the kernel only runs on riscv64 machines, see the library tests for everything else");
    std::process::exit(1);
}
