//! Construction and modification of Sv39 address spaces
//!
//! An address space is identified by the physical address of its root [`PageTable`].
//! All page tables and most mapped pages are obtained from a shared [`PageAllocator`] whose reference counts track
//! how many page table entries point to each page.
//!
//! Every modification of a page table happens while holding the page table lock of the [`AddressSpaceManager`], and
//! whenever an entry that the hardware might have cached is changed, a remote fence for the affected page is completed
//! on all harts before the lock is released again.

use crate::cpu::{SatpData, SatpMode};
use crate::fence::Mmu;
use crate::mem::paddr::{self, PAddr};
use crate::mem::vaddr::{self, VAddr, MAX_VADDR};
use crate::mem::{EntryFlags, MemoryPage, PageTable, PageTableEntry, PhysMapping, PAGESIZE};
use allocators::PageAllocator;
use ksync::{HartState, InterruptControl, Mutex};
use thiserror_no_std::Error;


#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum MapError {
    #[error("the level {level} page table which is needed to translate {vaddr:#x} does not exist")]
    MissingIntermediateTable { level: usize, vaddr: VAddr },
    #[error("no physical page is left to hold a page table")]
    OutOfMemory,
    #[error("address {addr:#x} is not aligned to the page size")]
    InvalidAlignment { addr: u64 },
    #[error("virtual address {vaddr:#x} is outside of the Sv39 address space")]
    AddressOutOfRange { vaddr: VAddr },
}

/// The location and content of a level 0 page table entry as found by [`AddressSpaceManager::walk`]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PteSlot {
    /// Physical address of the page table holding the entry
    pub table: PAddr,
    /// Index of the entry inside its table
    pub index: usize,
    /// Content of the entry at the time of the walk
    pub entry: PageTableEntry,
}

/// Builds, walks and modifies address spaces.
///
/// Page tables are accessed through `phys_map` and remote fences are sent to all harts in `hart_mask`.
pub struct AddressSpaceManager<'a, 'mem, M: Mmu> {
    allocator: &'a Mutex<PageAllocator<'mem, MemoryPage>>,
    tables: Mutex<()>,
    mmu: M,
    phys_map: PhysMapping,
    hart_mask: usize,
}

impl<'a, 'mem, M: Mmu> AddressSpaceManager<'a, 'mem, M> {
    pub fn new(
        allocator: &'a Mutex<PageAllocator<'mem, MemoryPage>>,
        mmu: M,
        phys_map: PhysMapping,
        hart_mask: usize,
    ) -> Self {
        Self {
            allocator,
            tables: Mutex::new("page tables", ()),
            mmu,
            phys_map,
            hart_mask,
        }
    }

    pub fn mmu(&self) -> &M {
        &self.mmu
    }

    pub fn phys_map(&self) -> &PhysMapping {
        &self.phys_map
    }

    /// Create a new, empty address space and return the physical address of its root page table
    pub fn create_root<I: InterruptControl>(&self, hart: &HartState<I>) -> Result<PAddr, MapError> {
        let root = self.allocate_table(hart)?;
        log::debug!("created address space with root page table {root:#x}");
        Ok(root)
    }

    /// Find the level 0 page table entry that is responsible for translating `vaddr`.
    ///
    /// Missing intermediate page tables are allocated if `create` is set.
    /// Otherwise [`MissingIntermediateTable`](MapError::MissingIntermediateTable) is returned for them.
    pub fn walk<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
        create: bool,
    ) -> Result<PteSlot, MapError> {
        check_vaddr(vaddr)?;
        check_aligned(root)?;
        let _tables = self.tables.lock(hart);
        let entry = self.walk_locked(hart, root, vaddr, create)?;

        let mapped = entry as u64;
        Ok(PteSlot {
            table: self.phys_map.rev_map(mapped & !paddr::PAGE_OFFSET_MASK),
            index: (mapped & paddr::PAGE_OFFSET_MASK) as usize / core::mem::size_of::<PageTableEntry>(),
            // Safety: the entry is part of a page table reachable from root
            entry: unsafe { *entry },
        })
    }

    /// Map the page at `vaddr` to the physical page at `paddr` with the given permissions.
    ///
    /// - An existing valid mapping is replaced, moving the reference from the old target page to the new one.
    /// - With a `paddr` of zero, a lazy entry that only carries `perm` is installed.
    ///   If `perm` is empty as well, the mapping is removed.
    ///
    /// Targets outside of the allocators memory (like MMIO regions) are mapped without any reference counting.
    /// Entries carrying [`Shared`](EntryFlags::Shared) never hold a reference on their target page, neither when
    /// they are installed nor when they are replaced.
    pub fn map<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
        paddr: PAddr,
        perm: EntryFlags,
    ) -> Result<(), MapError> {
        self.map_pages(hart, root, vaddr, paddr, PAGESIZE as u64, perm)
    }

    /// Remove the mapping of the page at `vaddr`, dropping the reference it holds on its target page
    pub fn unmap<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
    ) -> Result<(), MapError> {
        self.map(hart, root, vaddr, 0, EntryFlags::empty())
    }

    /// [`map`](AddressSpaceManager::map) all pages of the `len` bytes starting at `vaddr` to the consecutive physical
    /// pages starting at `paddr`.
    ///
    /// A `paddr` of zero installs lazy entries for the whole range.
    pub fn map_range<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
        paddr: PAddr,
        len: u64,
        perm: EntryFlags,
    ) -> Result<(), MapError> {
        self.map_pages(hart, root, vaddr, paddr, len, perm)
    }

    /// Map `len` bytes of physical memory starting at `paddr` to `vaddr` without the mappings owning the pages.
    ///
    /// This is meant for mapping physical memory itself (e.g. an identity mapping of RAM) where pages are mapped
    /// regardless of whether they are currently allocated.
    /// The entries are marked [`Shared`](EntryFlags::Shared) so that replacing them later does not drop a reference
    /// that was never taken.
    pub fn map_physical<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
        paddr: PAddr,
        len: u64,
        perm: EntryFlags,
    ) -> Result<(), MapError> {
        self.map_pages(hart, root, vaddr, paddr, len, perm | EntryFlags::Shared)
    }

    /// Translate the given `vaddr` by walking the hierarchy of pagetables in software.
    ///
    /// `None` is returned if the address is not mapped or only lazily mapped.
    pub fn translate<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
    ) -> Option<PAddr> {
        if vaddr > MAX_VADDR || !paddr::is_page_aligned(root) {
            return None;
        }
        let _tables = self.tables.lock(hart);
        let entry = self.walk_locked(hart, root, vaddr, false).ok()?;
        // Safety: the entry is part of a page table reachable from root
        let entry = unsafe { *entry };
        entry
            .get_addr()
            .ok()
            .map(|addr| addr | vaddr::page_offset(vaddr))
    }

    /// Make the address space with the given root the active one on the executing hart.
    ///
    /// This does not affect any other hart.
    ///
    /// # Safety
    /// The address space must map the currently executing code and stack to where they currently are.
    pub unsafe fn activate(&self, root: PAddr) {
        let satp = satp_of(root);
        log::debug!("activating address space {root:#x} ({satp:?})");
        self.mmu.activate(satp);
    }

    fn map_pages<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
        paddr: PAddr,
        len: u64,
        perm: EntryFlags,
    ) -> Result<(), MapError> {
        check_aligned(root)?;
        check_aligned(vaddr)?;
        check_aligned(paddr)?;
        let pages = len.div_ceil(PAGESIZE as u64);
        if pages == 0 {
            return Ok(());
        }
        check_vaddr(vaddr)?;
        check_vaddr(vaddr + (pages - 1) * PAGESIZE as u64)?;

        if pages > 1 {
            log::debug!(
                "mapping {vaddr:#x}..{:#x} to {paddr:#x} with flags {perm:?}",
                vaddr + pages * PAGESIZE as u64
            );
        }

        let _tables = self.tables.lock(hart);
        for i in 0..pages {
            let offset = i * PAGESIZE as u64;
            let target = match paddr {
                0 => 0,
                paddr => paddr + offset,
            };
            self.map_locked(hart, root, vaddr + offset, target, perm)?;
        }
        Ok(())
    }

    fn map_locked<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
        paddr: PAddr,
        perm: EntryFlags,
    ) -> Result<(), MapError> {
        let perm = perm - EntryFlags::Valid;
        let owning = !perm.contains(EntryFlags::Shared);
        let create = paddr != 0 || !perm.is_empty();
        let entry = match self.walk_locked(hart, root, vaddr, create) {
            // Safety: the entry is part of a page table reachable from root and the tables lock is held
            Ok(entry) => unsafe { &mut *entry },
            // nothing is mapped so there is nothing to remove
            Err(MapError::MissingIntermediateTable { .. }) if !create => return Ok(()),
            Err(e) => return Err(e),
        };

        let old = entry.raw_addr();
        let old_owning = !entry.permissions().contains(EntryFlags::Shared);
        match (entry.is_valid(), paddr) {
            (true, 0) => {
                unsafe {
                    match perm.is_empty() {
                        true => entry.clear(),
                        false => entry.set_lazy(perm),
                    }
                }
                self.fence(vaddr);
                if old_owning {
                    self.release_target(hart, old);
                }
            }
            (true, paddr) => {
                if owning {
                    self.retain_target(hart, paddr);
                }
                unsafe { entry.set(paddr, perm) };
                self.fence(vaddr);
                if old_owning {
                    self.release_target(hart, old);
                }
            }
            (false, 0) => unsafe {
                // no translation existed before so none can be cached
                match perm.is_empty() {
                    true => entry.clear(),
                    false => entry.set_lazy(perm),
                }
            },
            (false, paddr) => {
                if owning {
                    self.retain_target(hart, paddr);
                }
                unsafe { entry.set(paddr, perm) };
                self.fence(vaddr);
            }
        }
        Ok(())
    }

    /// Descend from `root` to the level 0 entry translating `vaddr`.
    ///
    /// The page table lock must be held by the caller.
    fn walk_locked<I: InterruptControl>(
        &self,
        hart: &HartState<I>,
        root: PAddr,
        vaddr: VAddr,
        create: bool,
    ) -> Result<*mut PageTableEntry, MapError> {
        let vpn = vaddr::vpn_segments(vaddr);
        let mut table = self.phys_map.map_ptr::<PageTable>(root);

        for level in [2, 1] {
            // Safety: page tables are only reachable through their parent entries which are only modified while the
            // page table lock is held
            let entry = unsafe { &mut (*table).entries[vpn[level]] };
            if !entry.is_valid() {
                if !create {
                    return Err(MapError::MissingIntermediateTable {
                        level: level - 1,
                        vaddr,
                    });
                }
                let next = self.allocate_table(hart)?;
                unsafe { entry.set(next, EntryFlags::empty()) };
                log::debug!(
                    "created level {} page table {next:#x} for {vaddr:#x}",
                    level - 1
                );
                self.fence(vaddr);
            } else if entry.is_leaf() {
                log::error!("found a huge page mapping while translating {vaddr:#x}: {entry:?}");
                panic!("unsupported huge page mapping at {vaddr:#x}");
            }
            table = self.phys_map.map_ptr(entry.raw_addr());
        }

        // Safety: see above
        Ok(unsafe { &mut (*table).entries[vpn[0]] as *mut PageTableEntry })
    }

    fn allocate_table<I: InterruptControl>(&self, hart: &HartState<I>) -> Result<PAddr, MapError> {
        let mut allocator = self.allocator.lock(hart);
        let page = allocator.allocate().map_err(|_| MapError::OutOfMemory)?;
        Ok(allocator.paddr_of(page) as PAddr)
    }

    fn retain_target<I: InterruptControl>(&self, hart: &HartState<I>, paddr: PAddr) {
        let mut allocator = self.allocator.lock(hart);
        if let Some(page) = allocator.page_index_of(paddr as usize) {
            allocator.ref_inc(page);
        }
    }

    /// Drop the reference that a mapping held on `paddr`.
    ///
    /// This must only happen after the mapping has been fenced so that the page cannot be reused while a hart can
    /// still reach it.
    fn release_target<I: InterruptControl>(&self, hart: &HartState<I>, paddr: PAddr) {
        let mut allocator = self.allocator.lock(hart);
        if let Some(page) = allocator.page_index_of(paddr as usize) {
            allocator.ref_dec(page);
        }
    }

    /// Invalidate the translation of the page containing `vaddr` on all harts.
    ///
    /// A failure leaves harts with stale translations and is fatal.
    fn fence(&self, vaddr: VAddr) {
        let vaddr = vaddr::page_align_down(vaddr);
        if let Err(e) = self
            .mmu
            .remote_sfence_vma(self.hart_mask, 0, vaddr, PAGESIZE as u64)
        {
            log::error!("{}", e);
            panic!("{}", e);
        }
    }
}

/// The content of the `satp` register that activates the address space with the given root
pub fn satp_of(root: PAddr) -> SatpData {
    SatpData {
        mode: SatpMode::Sv39,
        asid: 0,
        ppn: paddr::ppn(root),
    }
}

fn check_aligned(addr: u64) -> Result<(), MapError> {
    match paddr::is_page_aligned(addr) {
        true => Ok(()),
        false => Err(MapError::InvalidAlignment { addr }),
    }
}

fn check_vaddr(vaddr: VAddr) -> Result<(), MapError> {
    match vaddr <= MAX_VADDR {
        true => Ok(()),
        false => Err(MapError::AddressOutOfRange { vaddr }),
    }
}
