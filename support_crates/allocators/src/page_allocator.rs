use crate::AllocError;
use core::fmt::{Debug, Formatter};
use core::marker::PhantomData;
use core::mem;

/// Link value of a page that is not part of the free list
const NOT_LINKED: usize = usize::MAX;

/// Handle to one page managed by a [`PageAllocator`].
///
/// It is the index of the page counted from the start of the allocators physical range.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PageIndex(pub usize);

/// Metadata that a [`PageAllocator`] keeps about each page of its physical range.
///
/// A page is part of the free list exactly when its `ref_count` is zero.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct PageInfo {
    ref_count: u32,
    next: usize,
    prev: usize,
}

impl PageInfo {
    pub const EMPTY: Self = Self {
        ref_count: 0,
        next: NOT_LINKED,
        prev: NOT_LINKED,
    };

    /// How many owners currently reference the page
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Whether the page is currently on the free list
    pub fn is_free(&self) -> bool {
        self.next != NOT_LINKED
    }
}

impl Default for PageInfo {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Debug for PageInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageInfo")
            .field("ref_count", &self.ref_count)
            .field("free", &self.is_free())
            .finish()
    }
}

/// How many bytes of metadata a [`PageAllocator`] needs to manage `page_count` pages
pub const fn metadata_bytes(page_count: usize) -> usize {
    page_count * mem::size_of::<PageInfo>()
}

/// A reference counting allocator handing out single pages from a contiguous physical memory range.
///
/// The pages are described by the `Page` type parameter whose size is the page size.
/// Free pages are kept in a circular, doubly linked list that is threaded through the metadata array by index.
/// Allocation takes the page that was released most recently so that, right after initialization, pages are handed
/// out from the top of the range downwards.
///
/// The physical range starting at `phys_start` is accessible to the CPU at `mapped`, which is where pages are
/// zeroed before being handed out.
pub struct PageAllocator<'mem, Page> {
    phys_start: usize,
    mapped: *mut Page,
    pages: &'mem mut [PageInfo],
    head: Option<usize>,
    free_pages: usize,
    reserved_pages: usize,
    _phantom_data: PhantomData<&'mem mut [Page]>,
}

unsafe impl<Page: Send> Send for PageAllocator<'_, Page> {}

impl<'mem, Page> PageAllocator<'mem, Page> {
    /// Create an allocator from separately provided page memory and metadata.
    ///
    /// `memory` is the CPU accessible view of the physical range starting at `phys_start` and the first
    /// `reserved_pages` pages of it are marked as used.
    pub fn new(
        phys_start: usize,
        memory: &'mem mut [Page],
        metadata: &'mem mut [PageInfo],
        reserved_pages: usize,
    ) -> Self {
        assert!(
            metadata.len() >= memory.len(),
            "page metadata array is too small"
        );
        let page_count = memory.len();
        unsafe {
            Self::from_raw_parts(
                phys_start,
                memory.as_mut_ptr(),
                metadata[..page_count].as_mut_ptr(),
                page_count,
                reserved_pages,
            )
        }
    }

    /// Create an allocator over the physical range `[phys_start, phys_end)` that stores its own metadata at the
    /// beginning of that range.
    ///
    /// The pages occupied by the metadata are marked as used.
    ///
    /// # Safety
    /// The whole range must be unused and accessible through `mapped` for the lifetime `'mem`.
    pub unsafe fn init_in_place(phys_start: usize, phys_end: usize, mapped: *mut Page) -> Self {
        Self::init(phys_start, phys_start, phys_end, mapped)
    }

    /// Create an allocator over the physical range `[phys_start, phys_end)` whose first part up to `reserved_end`
    /// is already in use, e.g. by the loaded kernel image.
    ///
    /// The metadata is stored right after `reserved_end`.
    /// The pages in use and the pages occupied by the metadata are marked as used with a reference count of one, which
    /// [`reserved_end`](PageAllocator::reserved_end) reports the end of.
    ///
    /// # Safety
    /// The whole range must be accessible through `mapped` for the lifetime `'mem` and everything from
    /// `reserved_end` onwards must be unused.
    pub unsafe fn init(phys_start: usize, reserved_end: usize, phys_end: usize, mapped: *mut Page) -> Self {
        let page_size = mem::size_of::<Page>();
        assert!(phys_start <= reserved_end && reserved_end <= phys_end);
        assert_eq!(reserved_end % page_size, 0, "reserved range is not page aligned");
        let page_count = (phys_end - phys_start) / page_size;
        let used_pages = (reserved_end - phys_start) / page_size;
        let reserved_pages = used_pages + metadata_bytes(page_count).div_ceil(page_size);
        assert!(
            reserved_pages <= page_count,
            "memory range is too small to hold its own metadata"
        );
        Self::from_raw_parts(
            phys_start,
            mapped,
            mapped.add(used_pages).cast::<PageInfo>(),
            page_count,
            reserved_pages,
        )
    }

    /// Create an allocator from raw memory regions.
    ///
    /// Metadata is written for all `page_count` pages, the first `reserved_pages` of them are marked as used
    /// (with a reference count of one) and all others are put onto the free list.
    ///
    /// # Safety
    /// - `mapped` must point to `page_count` accessible pages which back the physical range starting at `phys_start`
    ///   and which are not used by anything else during `'mem` (except for the reserved pages).
    /// - `metadata` must point to writable memory for `page_count` [`PageInfo`] records which is exclusively owned by
    ///   the allocator during `'mem`.
    ///   It may overlap the reserved pages but no other.
    pub unsafe fn from_raw_parts(
        phys_start: usize,
        mapped: *mut Page,
        metadata: *mut PageInfo,
        page_count: usize,
        reserved_pages: usize,
    ) -> Self {
        let page_size = mem::size_of::<Page>();
        assert!(page_size.is_power_of_two(), "page size must be a power of two");
        assert_eq!(phys_start % page_size, 0, "physical range is not page aligned");
        assert_eq!(mapped as usize % mem::align_of::<Page>(), 0);
        assert!(reserved_pages <= page_count);

        for i in 0..page_count {
            metadata.add(i).write(PageInfo::EMPTY);
        }

        let mut allocator = Self {
            phys_start,
            mapped,
            pages: core::slice::from_raw_parts_mut(metadata, page_count),
            head: None,
            free_pages: 0,
            reserved_pages,
            _phantom_data: PhantomData,
        };
        for info in allocator.pages[..reserved_pages].iter_mut() {
            info.ref_count = 1;
        }
        for i in reserved_pages..page_count {
            allocator.push_free(i);
        }

        log::debug!(
            "page allocator manages {:#x}..{:#x} ({} pages, {} reserved)",
            allocator.phys_start(),
            allocator.phys_end(),
            page_count,
            reserved_pages
        );
        allocator
    }

    /// Allocate one zero-filled page with a reference count of one
    pub fn allocate(&mut self) -> Result<PageIndex, AllocError> {
        let index = self.head.ok_or(AllocError::OutOfMemory)?;
        self.unlink(index);
        // Safety: the page was free so nobody else accesses its content
        unsafe { self.mapped.add(index).write_bytes(0, 1) };
        self.pages[index].ref_count = 1;
        log::trace!("allocated page {:#x}", self.paddr_of(PageIndex(index)));
        Ok(PageIndex(index))
    }

    /// Put the page back onto the free list, regardless of how many references to it exist.
    ///
    /// # Panics
    /// This panics if the page is already free.
    pub fn release(&mut self, page: PageIndex) {
        let index = self.checked_index(page);
        if self.pages[index].is_free() {
            log::error!(
                "page {:#x} is released while already being free",
                self.paddr_of(page)
            );
            panic!("double release of page {:#x}", self.paddr_of(page));
        }
        self.free(index);
    }

    /// Add another reference to an allocated page
    pub fn ref_inc(&mut self, page: PageIndex) {
        let index = self.checked_index(page);
        if self.pages[index].ref_count == 0 {
            log::error!("page {:#x} is referenced while free", self.paddr_of(page));
            panic!("reference to free page {:#x}", self.paddr_of(page));
        }
        self.pages[index].ref_count += 1;
    }

    /// Remove one reference from an allocated page, releasing it when the last reference is gone
    pub fn ref_dec(&mut self, page: PageIndex) {
        let index = self.checked_index(page);
        match self.pages[index].ref_count {
            0 => {
                log::error!(
                    "reference count of page {:#x} is decremented below zero",
                    self.paddr_of(page)
                );
                panic!("reference count underflow of page {:#x}", self.paddr_of(page));
            }
            1 => self.free(index),
            _ => self.pages[index].ref_count -= 1,
        }
    }

    /// The physical address at which the given page starts
    pub fn paddr_of(&self, page: PageIndex) -> usize {
        self.phys_start + page.0 * mem::size_of::<Page>()
    }

    /// The page which starts at the page aligned physical address `paddr`
    pub fn index_of(&self, paddr: usize) -> Result<PageIndex, AllocError> {
        if paddr % mem::size_of::<Page>() != 0 {
            return Err(AllocError::InvalidAlignment { addr: paddr });
        }
        self.page_index_of(paddr)
            .ok_or(AllocError::OutOfRange { addr: paddr })
    }

    /// The page containing the physical address `paddr` or `None` if it is not managed by this allocator
    pub fn page_index_of(&self, paddr: usize) -> Option<PageIndex> {
        if !self.contains(paddr) {
            return None;
        }
        Some(PageIndex((paddr - self.phys_start) / mem::size_of::<Page>()))
    }

    /// A pointer through which the content of the given page can be accessed
    pub fn mapped_ptr(&self, page: PageIndex) -> *mut Page {
        let index = self.checked_index(page);
        // Safety: the index is inside the mapped range
        unsafe { self.mapped.add(index) }
    }

    /// The metadata record of the given page
    pub fn info(&self, page: PageIndex) -> &PageInfo {
        &self.pages[self.checked_index(page)]
    }

    pub fn ref_count(&self, page: PageIndex) -> u32 {
        self.info(page).ref_count()
    }

    /// Whether `paddr` lies inside the managed physical range
    pub fn contains(&self, paddr: usize) -> bool {
        paddr >= self.phys_start && paddr < self.phys_end()
    }

    pub fn phys_start(&self) -> usize {
        self.phys_start
    }

    /// First physical address after the managed range
    pub fn phys_end(&self) -> usize {
        self.phys_start + self.pages.len() * mem::size_of::<Page>()
    }

    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn free_pages(&self) -> usize {
        self.free_pages
    }

    pub fn reserved_pages(&self) -> usize {
        self.reserved_pages
    }

    /// First physical address after the pages that were marked as used during initialization
    pub fn reserved_end(&self) -> usize {
        self.paddr_of(PageIndex(self.reserved_pages))
    }

    fn checked_index(&self, page: PageIndex) -> usize {
        assert!(
            page.0 < self.pages.len(),
            "page index {} is out of range",
            page.0
        );
        page.0
    }

    fn free(&mut self, index: usize) {
        self.pages[index].ref_count = 0;
        self.push_free(index);
        log::trace!("released page {:#x}", self.paddr_of(PageIndex(index)));
    }

    /// Insert the page at the head of the free list
    fn push_free(&mut self, index: usize) {
        match self.head {
            None => {
                self.pages[index].next = index;
                self.pages[index].prev = index;
            }
            Some(head) => {
                let tail = self.pages[head].prev;
                self.pages[index].next = head;
                self.pages[index].prev = tail;
                self.pages[tail].next = index;
                self.pages[head].prev = index;
            }
        }
        self.head = Some(index);
        self.free_pages += 1;
    }

    /// Remove the page from the free list
    fn unlink(&mut self, index: usize) {
        let PageInfo { next, prev, .. } = self.pages[index];
        if next == index {
            self.head = None;
        } else {
            self.pages[prev].next = next;
            self.pages[next].prev = prev;
            if self.head == Some(index) {
                self.head = Some(next);
            }
        }
        self.pages[index].next = NOT_LINKED;
        self.pages[index].prev = NOT_LINKED;
        self.free_pages -= 1;
    }
}

impl<Page> Debug for PageAllocator<'_, Page> {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageAllocator")
            .field("phys_start", &(self.phys_start as *const u8))
            .field("phys_end", &(self.phys_end() as *const u8))
            .field("total_pages", &self.total_pages())
            .field("free_pages", &self.free_pages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use std::vec;
    use std::vec::Vec;

    const PHYS_START: usize = 0x8000_0000;

    #[repr(C, align(4096))]
    struct Page([u8; 4096]);

    fn backing(count: usize) -> (Vec<Page>, Vec<PageInfo>) {
        let pages = (0..count).map(|_| Page([0xAB; 4096])).collect();
        (pages, vec![PageInfo::default(); count])
    }

    fn drain<P>(allocator: &mut PageAllocator<'_, P>) -> Vec<PageIndex> {
        let mut pages = Vec::new();
        while let Ok(page) = allocator.allocate() {
            pages.push(page);
        }
        pages
    }

    #[test]
    fn test_sixteen_pages_with_four_reserved() {
        let (mut memory, mut metadata) = backing(16);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 4);

        let mut allocated = Vec::new();
        for _ in 0..12 {
            allocated.push(allocator.allocate().unwrap());
        }
        assert_eq!(allocator.allocate(), Err(AllocError::OutOfMemory));

        let victim = allocated[5];
        allocator.release(victim);
        assert_eq!(allocator.allocate(), Ok(victim));
        assert_eq!(allocator.allocate(), Err(AllocError::OutOfMemory));
    }

    #[test]
    fn test_reserved_pages_are_never_handed_out() {
        let (mut memory, mut metadata) = backing(8);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 3);
        let pages = drain(&mut allocator);

        assert_eq!(pages.len(), 5);
        assert!(pages.iter().all(|page| page.0 >= 3));
        for reserved in 0..3 {
            assert_eq!(allocator.ref_count(PageIndex(reserved)), 1);
            assert!(!allocator.info(PageIndex(reserved)).is_free());
        }
    }

    #[test]
    fn test_pages_are_handed_out_from_the_top() {
        let (mut memory, mut metadata) = backing(6);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 2);
        let pages = drain(&mut allocator);
        assert_eq!(
            pages,
            vec![PageIndex(5), PageIndex(4), PageIndex(3), PageIndex(2)]
        );
    }

    #[test]
    fn test_allocated_pages_are_zeroed() {
        let (mut memory, mut metadata) = backing(4);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 0);

        let page = allocator.allocate().unwrap();
        let content = unsafe { &mut (*allocator.mapped_ptr(page)).0 };
        assert!(content.iter().all(|&b| b == 0));

        content.fill(0x55);
        allocator.release(page);
        let again = allocator.allocate().unwrap();
        assert_eq!(again, page);
        let content = unsafe { &(*allocator.mapped_ptr(again)).0 };
        assert!(content.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_ref_counting() {
        let (mut memory, mut metadata) = backing(4);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 0);
        let page = allocator.allocate().unwrap();
        assert_eq!(allocator.ref_count(page), 1);

        allocator.ref_inc(page);
        allocator.ref_dec(page);
        assert_eq!(allocator.ref_count(page), 1);
        assert_eq!(allocator.free_pages(), 3);

        allocator.ref_inc(page);
        allocator.ref_dec(page);
        allocator.ref_dec(page);
        assert_eq!(allocator.ref_count(page), 0);
        assert!(allocator.info(page).is_free());
        assert_eq!(allocator.free_pages(), 4);
        assert_eq!(allocator.allocate(), Ok(page));
    }

    #[test]
    fn test_release_ignores_outstanding_references() {
        let (mut memory, mut metadata) = backing(2);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 0);
        let page = allocator.allocate().unwrap();
        allocator.ref_inc(page);
        allocator.release(page);
        assert_eq!(allocator.ref_count(page), 0);
        assert_eq!(allocator.free_pages(), 2);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn test_double_release_is_fatal() {
        let (mut memory, mut metadata) = backing(2);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 0);
        let page = allocator.allocate().unwrap();
        allocator.release(page);
        allocator.release(page);
    }

    #[test]
    #[should_panic(expected = "reference count underflow")]
    fn test_ref_dec_of_free_page_is_fatal() {
        let (mut memory, mut metadata) = backing(2);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 0);
        allocator.ref_dec(PageIndex(1));
    }

    #[test]
    fn test_address_conversions() {
        let (mut memory, mut metadata) = backing(4);
        let allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 0);

        assert_eq!(allocator.paddr_of(PageIndex(2)), PHYS_START + 0x2000);
        assert_eq!(allocator.index_of(PHYS_START + 0x3000), Ok(PageIndex(3)));
        assert_eq!(
            allocator.index_of(PHYS_START + 0x3010),
            Err(AllocError::InvalidAlignment {
                addr: PHYS_START + 0x3010
            })
        );
        assert_eq!(
            allocator.index_of(PHYS_START + 0x4000),
            Err(AllocError::OutOfRange {
                addr: PHYS_START + 0x4000
            })
        );
        assert_eq!(
            allocator.page_index_of(PHYS_START + 0x1fff),
            Some(PageIndex(1))
        );
        assert_eq!(allocator.page_index_of(PHYS_START - 1), None);
        assert_eq!(allocator.phys_end(), PHYS_START + 0x4000);
        assert_eq!(
            allocator.mapped_ptr(PageIndex(1)) as usize - allocator.mapped_ptr(PageIndex(0)) as usize,
            4096
        );
    }

    #[test]
    fn test_init_in_place_reserves_metadata() {
        let (mut memory, _) = backing(16);
        let mut allocator = unsafe {
            PageAllocator::init_in_place(PHYS_START, PHYS_START + 16 * 4096, memory.as_mut_ptr())
        };
        assert_eq!(allocator.total_pages(), 16);
        assert_eq!(allocator.reserved_pages(), 1);
        assert_eq!(allocator.reserved_end(), PHYS_START + 4096);
        assert_eq!(drain(&mut allocator).len(), 15);
    }

    #[test]
    fn test_init_keeps_loaded_image_referenced() {
        let (mut memory, _) = backing(300);
        let image_end = PHYS_START + 3 * 4096;
        let mut allocator = unsafe {
            PageAllocator::init(PHYS_START, image_end, PHYS_START + 300 * 4096, memory.as_mut_ptr())
        };

        // 300 records of 24 bytes need two pages after the image
        assert_eq!(allocator.reserved_pages(), 5);
        assert_eq!(allocator.reserved_end(), image_end + 2 * 4096);
        for page in 0..5 {
            assert_eq!(allocator.ref_count(PageIndex(page)), 1);
            assert!(!allocator.info(PageIndex(page)).is_free());
        }
        // the image itself must be untouched
        assert_eq!(memory_byte(&allocator, PageIndex(0)), 0xAB);
        assert_eq!(memory_byte(&allocator, PageIndex(2)), 0xAB);

        let image_page = allocator.index_of(PHYS_START + 4096).unwrap();
        allocator.ref_inc(image_page);
        allocator.ref_dec(image_page);
        assert_eq!(allocator.ref_count(image_page), 1);

        let pages = drain(&mut allocator);
        assert_eq!(pages.len(), 295);
        assert!(pages.iter().all(|page| page.0 >= 5));
    }

    fn memory_byte<P>(allocator: &PageAllocator<'_, P>, page: PageIndex) -> u8 {
        unsafe { *allocator.mapped_ptr(page).cast::<u8>().add(100) }
    }

    #[test]
    fn test_random_release_order_keeps_free_count() {
        let (mut memory, mut metadata) = backing(32);
        let mut allocator = PageAllocator::new(PHYS_START, &mut memory, &mut metadata, 4);
        let mut held = Vec::new();

        // deterministic pseudo random sequence of allocations and releases
        let mut seed = 0x1234_5678u32;
        for _ in 0..500 {
            seed = seed.wrapping_mul(1_103_515_245).wrapping_add(12345);
            if seed % 3 == 0 && !held.is_empty() {
                let page = held.swap_remove(seed as usize % held.len());
                allocator.release(page);
            } else if let Ok(page) = allocator.allocate() {
                assert!(!held.contains(&page));
                held.push(page);
            }
            assert_eq!(allocator.free_pages() + held.len(), 28);
        }

        for page in held.drain(..) {
            allocator.release(page);
        }
        assert_eq!(drain(&mut allocator).len(), 28);
    }
}
