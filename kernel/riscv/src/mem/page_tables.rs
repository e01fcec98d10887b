use super::{MemoryPage, PageTableEntry, PAGESIZE};
use core::fmt::{Debug, Formatter};
use core::mem;
use static_assertions::{assert_eq_align, assert_eq_size};

/// How many entries a single [`PageTable`] holds
pub const ENTRIES_PER_TABLE: usize = PAGESIZE / mem::size_of::<PageTableEntry>();

/// A PageTable for configuring virtual memory mapping.
///
/// It exactly fills 4096 bytes which is also the size of mapped pages.
/// A zero-filled page is a valid, empty page table.
#[repr(C, align(4096))]
pub struct PageTable {
    pub entries: [PageTableEntry; ENTRIES_PER_TABLE],
}

assert_eq_size!(PageTable, MemoryPage);
assert_eq_align!(PageTable, MemoryPage);
assert_eq_size!(PageTableEntry, u64);

impl PageTable {
    /// Iterate over all entries that are either valid or lazy together with their index
    pub fn used_entries(&self) -> impl Iterator<Item = (usize, &PageTableEntry)> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.is_valid() || entry.is_lazy())
    }
}

impl Debug for PageTable {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.debug_map().entries(self.used_entries()).finish()
    }
}
