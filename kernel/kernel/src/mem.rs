//! Setup of the kernel address space
//!
//! The kernel runs identity mapped: every device window and all of RAM is mapped to the virtual address that equals
//! its physical one.
//! This keeps the code which builds the address space valid after it has been activated.

use crate::config::MMIO_REGIONS;
use ksync::{HartState, InterruptControl};
use riscv::fence::Mmu;
use riscv::mem::{paddr, AddressSpaceManager, EntryFlags, MapError, PAddr, PAGESIZE};
use thiserror_no_std::Error;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum BootError {
    #[error("could not map the {region} region: {error}")]
    Map { region: &'static str, error: MapError },
    #[error("kernel page {vaddr:#x} translates to {found:#x?} instead of itself")]
    BrokenIdentity { vaddr: u64, found: Option<PAddr> },
}

/// Physical location of the loaded kernel image
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KernelImage {
    /// First byte of the image which is also the first byte of its code
    pub start: PAddr,
    /// End of the code (exclusive), page aligned
    pub text_end: PAddr,
    /// End of the whole image (exclusive), page aligned
    pub end: PAddr,
}

impl KernelImage {
    /// Number of bytes the image occupies
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Build the kernel address space and return the physical address of its root page table.
///
/// The device windows of [`MMIO_REGIONS`] and everything from the start of the kernel image up to `ram_end` are
/// identity mapped.
/// Kernel code is readable and executable, everything after it is readable and writable.
///
/// `reserved_end` is where the pages that the allocator reserved for the image and its own metadata end.
/// Those pages are mapped like any other allocated page so that the mappings hold a reference on them.
/// The remaining RAM is mapped with [`map_physical`](AddressSpaceManager::map_physical) since it is handed out and
/// released while the mapping stays.
/// Before returning, every page of the kernel image is checked to translate to itself.
pub fn build_kernel_space<M: Mmu, I: InterruptControl>(
    manager: &AddressSpaceManager<'_, '_, M>,
    hart: &HartState<I>,
    image: &KernelImage,
    reserved_end: PAddr,
    ram_end: PAddr,
) -> Result<PAddr, BootError> {
    debug_assert!(image.end <= reserved_end && reserved_end <= ram_end);
    let root = manager
        .create_root(hart)
        .map_err(|error| BootError::Map { region: "root", error })?;

    for region in MMIO_REGIONS {
        identity_map(
            manager,
            hart,
            root,
            region.name,
            region.base,
            region.len,
            EntryFlags::Read | EntryFlags::Write,
        )?;
    }
    identity_map_counted(
        manager,
        hart,
        root,
        "kernel text",
        image.start,
        image.text_end - image.start,
        EntryFlags::Read | EntryFlags::Execute,
    )?;
    identity_map_counted(
        manager,
        hart,
        root,
        "kernel data",
        image.text_end,
        reserved_end - image.text_end,
        EntryFlags::Read | EntryFlags::Write,
    )?;
    identity_map(
        manager,
        hart,
        root,
        "ram",
        reserved_end,
        ram_end - reserved_end,
        EntryFlags::Read | EntryFlags::Write,
    )?;

    verify_identity(manager, hart, root, image)?;
    log::info!(
        "kernel address space {root:#x} maps {} devices and {:#x}..{ram_end:#x}",
        MMIO_REGIONS.len(),
        image.start
    );
    Ok(root)
}

/// Check that every page of the kernel image translates to itself in the address space at `root`
pub fn verify_identity<M: Mmu, I: InterruptControl>(
    manager: &AddressSpaceManager<'_, '_, M>,
    hart: &HartState<I>,
    root: PAddr,
    image: &KernelImage,
) -> Result<(), BootError> {
    for vaddr in (image.start..image.end).step_by(PAGESIZE) {
        let found = manager.translate(hart, root, vaddr);
        if found != Some(vaddr) {
            log::error!("kernel page {vaddr:#x} translates to {found:#x?}");
            return Err(BootError::BrokenIdentity { vaddr, found });
        }
    }
    log::debug!("verified {} kernel pages", image.len() / PAGESIZE as u64);
    Ok(())
}

fn identity_map_counted<M: Mmu, I: InterruptControl>(
    manager: &AddressSpaceManager<'_, '_, M>,
    hart: &HartState<I>,
    root: PAddr,
    region: &'static str,
    base: PAddr,
    len: u64,
    perm: EntryFlags,
) -> Result<(), BootError> {
    log::debug!("identity mapping {region} at {base:#x}..{:#x}", base + len);
    manager
        .map_range(hart, root, base, base, len, perm)
        .map_err(|error| BootError::Map { region, error })
}

fn identity_map<M: Mmu, I: InterruptControl>(
    manager: &AddressSpaceManager<'_, '_, M>,
    hart: &HartState<I>,
    root: PAddr,
    region: &'static str,
    base: PAddr,
    len: u64,
    perm: EntryFlags,
) -> Result<(), BootError> {
    debug_assert!(paddr::is_page_aligned(base));
    log::debug!("identity mapping {region} at {base:#x}..{:#x}", base + len);
    manager
        .map_physical(hart, root, base, base, len, perm)
        .map_err(|error| BootError::Map { region, error })
}

#[cfg(test)]
mod test {
    extern crate std;

    use super::*;
    use crate::config::{PLIC, UART0};
    use allocators::PageAllocator;
    use core::cell::Cell;
    use ksync::Mutex;
    use riscv::cpu::SatpData;
    use riscv::fence::FenceError;
    use riscv::mem::{MemoryPage, PhysMapping, VAddr};
    use std::vec::Vec;

    const RAM_START: PAddr = 0x8000_0000;
    const RAM_PAGES: usize = 256;
    const RAM_END: PAddr = RAM_START + (RAM_PAGES * PAGESIZE) as u64;

    const IMAGE: KernelImage = KernelImage {
        start: RAM_START,
        text_end: RAM_START + 4 * PAGESIZE as u64,
        end: RAM_START + 8 * PAGESIZE as u64,
    };

    #[derive(Default)]
    struct NoInterrupts;

    impl InterruptControl for NoInterrupts {
        fn disable(&self) -> bool {
            false
        }

        fn restore(&self, _enabled: bool) {}
    }

    #[derive(Default)]
    struct CountingMmu {
        fences: Cell<usize>,
    }

    impl Mmu for CountingMmu {
        fn remote_sfence_vma(
            &self,
            _hart_mask: usize,
            _hart_mask_base: usize,
            _vaddr: VAddr,
            _size: u64,
        ) -> Result<(), FenceError> {
            self.fences.set(self.fences.get() + 1);
            Ok(())
        }

        unsafe fn activate(&self, _satp: SatpData) {}
    }

    type Allocator<'mem> = Mutex<PageAllocator<'mem, MemoryPage>>;

    /// Run `f` with a manager whose allocator covers all RAM with the kernel image being reserved.
    ///
    /// `f` also receives where the reserved pages end.
    fn with_kernel_ram<R>(
        f: impl FnOnce(
            &AddressSpaceManager<'_, '_, CountingMmu>,
            &HartState<NoInterrupts>,
            &Allocator<'_>,
            PAddr,
        ) -> R,
    ) -> R {
        let mut ram = std::vec![MemoryPage::default(); RAM_PAGES];
        let ram_ptr = ram.as_mut_ptr();
        let phys_map = PhysMapping::new(RAM_START, ram_ptr.cast());
        let allocator = unsafe {
            PageAllocator::init(
                IMAGE.start as usize,
                IMAGE.end as usize,
                RAM_END as usize,
                ram_ptr,
            )
        };
        let reserved_end = allocator.reserved_end() as PAddr;
        let allocator = Mutex::new("page allocator", allocator);
        let hart = HartState::new(0, NoInterrupts);
        let manager = AddressSpaceManager::new(&allocator, CountingMmu::default(), phys_map, 1);
        f(&manager, &hart, &allocator, reserved_end)
    }

    fn ref_count(allocator: &Allocator<'_>, hart: &HartState<NoInterrupts>, paddr: PAddr) -> u32 {
        let allocator = allocator.lock(hart);
        allocator.ref_count(allocator.index_of(paddr as usize).unwrap())
    }

    #[test]
    fn test_kernel_image_is_identity_mapped() {
        with_kernel_ram(|manager, hart, _, reserved_end| {
            let root = build_kernel_space(manager, hart, &IMAGE, reserved_end, RAM_END).unwrap();
            for vaddr in (IMAGE.start..IMAGE.end).step_by(PAGESIZE) {
                assert_eq!(manager.translate(hart, root, vaddr + 0x10), Some(vaddr + 0x10));
            }
            assert!(manager.mmu().fences.get() > 0);
        })
    }

    #[test]
    fn test_permissions_of_kernel_regions() {
        with_kernel_ram(|manager, hart, _, reserved_end| {
            let root = build_kernel_space(manager, hart, &IMAGE, reserved_end, RAM_END).unwrap();
            let perm = |vaddr| manager.walk(hart, root, vaddr, false).unwrap().entry.permissions();
            let rw = EntryFlags::Read | EntryFlags::Write;
            let direct = rw | EntryFlags::Shared;

            assert_eq!(perm(IMAGE.start), EntryFlags::Read | EntryFlags::Execute);
            assert_eq!(perm(IMAGE.text_end), rw);
            assert_eq!(perm(reserved_end - PAGESIZE as u64), rw);
            assert_eq!(perm(reserved_end), direct);
            assert_eq!(perm(RAM_END - PAGESIZE as u64), direct);
            assert_eq!(perm(UART0.base), direct);
            assert_eq!(perm(PLIC.base + PLIC.len - PAGESIZE as u64), direct);
        })
    }

    #[test]
    fn test_kernel_image_pages_are_referenced_by_their_mapping() {
        with_kernel_ram(|manager, hart, allocator, reserved_end| {
            assert_eq!(ref_count(allocator, hart, IMAGE.start), 1);
            let root = build_kernel_space(manager, hart, &IMAGE, reserved_end, RAM_END).unwrap();

            for paddr in (IMAGE.start..reserved_end).step_by(PAGESIZE) {
                assert_eq!(ref_count(allocator, hart, paddr), 2, "{paddr:#x}");
            }
            assert_eq!(ref_count(allocator, hart, reserved_end), 0);

            // dropping the mapping of an image page must not free it
            manager.unmap(hart, root, IMAGE.text_end).unwrap();
            assert_eq!(ref_count(allocator, hart, IMAGE.text_end), 1);
            let allocator = allocator.lock(hart);
            let index = allocator.index_of(IMAGE.text_end as usize).unwrap();
            assert!(!allocator.info(index).is_free());
        })
    }

    #[test]
    fn test_nothing_beyond_ram_is_mapped() {
        with_kernel_ram(|manager, hart, _, reserved_end| {
            let root = build_kernel_space(manager, hart, &IMAGE, reserved_end, RAM_END).unwrap();
            assert_eq!(manager.translate(hart, root, RAM_END), None);
            assert_eq!(manager.translate(hart, root, PLIC.base + PLIC.len), None);
            assert_eq!(manager.translate(hart, root, 0), None);
        })
    }

    #[test]
    fn test_broken_identity_is_detected() {
        with_kernel_ram(|manager, hart, _, _| {
            let root = manager.create_root(hart).unwrap();
            let len = IMAGE.len() - PAGESIZE as u64;
            manager
                .map_physical(hart, root, IMAGE.start, IMAGE.start, len, EntryFlags::Read)
                .unwrap();
            assert_eq!(
                verify_identity(manager, hart, root, &IMAGE),
                Err(BootError::BrokenIdentity {
                    vaddr: IMAGE.end - PAGESIZE as u64,
                    found: None
                })
            );
        })
    }

    #[test]
    fn test_running_out_of_table_pages_is_reported() {
        with_kernel_ram(|manager, hart, _, reserved_end| {
            let mut tables = Vec::new();
            while let Ok(root) = manager.create_root(hart) {
                tables.push(root);
            }
            assert!(!tables.is_empty());
            assert_eq!(
                build_kernel_space(manager, hart, &IMAGE, reserved_end, RAM_END),
                Err(BootError::Map {
                    region: "root",
                    error: MapError::OutOfMemory
                })
            );
        })
    }
}
