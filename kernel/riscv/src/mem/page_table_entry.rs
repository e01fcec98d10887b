use super::PAGESIZE;
use crate::mem::paddr;
use crate::mem::paddr::PAddr;
use bitflags::bitflags;
use core::fmt::{Binary, Debug, Formatter, LowerHex, UpperHex, Write};

/// An entry of a [`PageTable`](super::PageTable) responsible for mapping virtual to phyiscal adresses.
///
/// # Format
/// The PTE format for Sv39 is shown in the below figure.
/// - Bits 9–0 have the meaning as described by [`EntryFlags`].
/// - Bits 9-8 are ignored by the hardware implementation and are used by the kernel as described by
///   [`CopyOnWrite`](EntryFlags::CopyOnWrite) and [`Shared`](EntryFlags::Shared).
/// - Bits 63–54 are reserved by extensions or for future standard use and are always zero.
///
/// ```text
///   63      54 53    28 27    19 18    10 9   8   7   6   5   4   3   2   1   0
/// ┌──────────┬────────┬────────┬────────┬───┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
/// │ reserved │ PPN[2] │ PPN[1] │ PPN[0] │ S │ C │ D │ A │ G │ U │ X │ W │ R │ V │
/// └──────────┴────────┴────────┴────────┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
///     10bit     26bit     9bit     9bit
///                      Sv39 Page Table Entry
/// ```
///
/// Whether a valid entry points to another page table or to a data page only depends on the level of the table it
/// is stored in.
/// Entries in level 0 tables are always leaves.
#[derive(Copy, Clone, Eq, PartialEq, Default)]
#[repr(C, align(8))]
pub struct PageTableEntry {
    pub(crate) entry: u64,
}

const FLAG_BITS: u64 = 10;
const FLAG_MASK: u64 = (1 << FLAG_BITS) - 1;
const PPN_OFFSET: u64 = 10;
const PPN_BITS: u64 = 44;
const PPN_MASK: u64 = ((1 << PPN_BITS) - 1) << PPN_OFFSET;

impl PageTableEntry {
    /// Create a new empty entry.
    ///
    /// This entry does not point to anything and is considered disabled by the hardware.
    pub const fn empty() -> Self {
        Self { entry: 0 }
    }

    /// Whether this entry is currently valid (in other words whether it is considered active)
    pub fn is_valid(&self) -> bool {
        self.get_flags().contains(EntryFlags::Valid)
    }

    /// Whether this is a leaf entry not pointing to further [`PageTable`](super::PageTable)s.
    ///
    /// This is only meaningful in tables above level 0.
    pub fn is_leaf(&self) -> bool {
        self.get_flags().intersects(EntryFlags::RWX)
    }

    /// Whether the entry describes a mapping without a backing page.
    ///
    /// Such an entry carries permissions but is not valid and does not point anywhere.
    pub fn is_lazy(&self) -> bool {
        !self.is_valid() && !self.permissions().is_empty()
    }

    /// Return the flags which are encoded in this entry
    pub fn get_flags(&self) -> EntryFlags {
        EntryFlags::from_bits_truncate(self.entry & FLAG_MASK)
    }

    /// Return the flags of this entry without the [`Valid`](EntryFlags::Valid) bit
    pub fn permissions(&self) -> EntryFlags {
        self.get_flags() - EntryFlags::Valid
    }

    /// Return the address which this entry points to
    pub fn get_addr(&self) -> Result<PAddr, EntryInvalidErr> {
        match self.is_valid() {
            false => Err(EntryInvalidErr),
            true => Ok(self.raw_addr()),
        }
    }

    /// Return the address encoded in this entry, even if the entry is not valid
    pub fn raw_addr(&self) -> PAddr {
        paddr::from_ppn((self.entry & PPN_MASK) >> PPN_OFFSET)
    }

    /// Set the content of this entry.
    ///
    /// This function also automatically enables the entry by setting the [`Valid`](EntryFlags::Valid) flag.
    ///
    /// If you want to disable the entry use [`clear()`](PageTableEntry::clear) instead.
    ///
    /// # Safety
    /// Changing the entry of a PageTable inherently changes virtual address mappings.
    /// This can make other, completely unrelated, references and pointers invalid and must always be done with
    /// care.
    pub unsafe fn set(&mut self, addr: PAddr, flags: EntryFlags) {
        assert!(
            paddr::is_page_aligned(addr),
            "cannot set page table entry to unaligned PAddr {:#x}",
            addr
        );
        log::trace!(
            "setting page table entry {:#x}:{} to {:#x} with flags {flags:?}",
            (self as *mut Self as usize) & !(PAGESIZE - 1),
            ((self as *mut Self as usize) & (PAGESIZE - 1)) / core::mem::size_of::<PageTableEntry>(),
            addr
        );

        self.entry = (paddr::ppn(addr) << PPN_OFFSET) | (flags | EntryFlags::Valid).bits();
    }

    /// Make this entry a lazy one that only carries `flags` but neither points anywhere nor is valid.
    ///
    /// # Safety
    /// See [`set()`](PageTableEntry::set).
    pub unsafe fn set_lazy(&mut self, flags: EntryFlags) {
        log::trace!(
            "setting page table entry {:#x}:{} to lazy with flags {flags:?}",
            (self as *mut Self as usize) & !(PAGESIZE - 1),
            ((self as *mut Self as usize) & (PAGESIZE - 1)) / core::mem::size_of::<PageTableEntry>(),
        );

        self.entry = (flags - EntryFlags::Valid).bits();
    }

    /// Clear the content of this entry, setting it to 0x0 and removing all flags.
    ///
    /// # Safety
    /// Changing the entry of a PageTable inherently changes virtual address mappings.
    /// This can make other, completely unrelated, references and pointers invalid and must always be done with
    /// care.
    pub unsafe fn clear(&mut self) {
        log::trace!(
            "clearing page table entry {:#x}:{}",
            (self as *mut Self as usize) & !(PAGESIZE - 1),
            ((self as *mut Self as usize) & (PAGESIZE - 1)) / 8,
        );

        self.entry = 0;
    }
}

impl Debug for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self.get_addr() {
            Err(_) => f.write_fmt(format_args!(
                "PageTableEntry (invalid) {{ flags: {:?} }}",
                self.get_flags()
            )),
            Ok(addr) => f.write_fmt(format_args!(
                "PageTableEntry {{ addr: {:#012x}, flags: {:?} }}",
                addr,
                self.get_flags()
            )),
        }
    }
}

impl Binary for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        Binary::fmt(&self.entry, f)
    }
}

impl LowerHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        LowerHex::fmt(&self.entry, f)
    }
}

impl UpperHex for PageTableEntry {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        UpperHex::fmt(&self.entry, f)
    }
}

bitflags! {
    /// The flags that can be set on a [`PageTableEntry`]
    #[derive(Copy, Clone, Eq, PartialEq)]
    pub struct EntryFlags: u64 {
        /// If set, the MMU considers this a valid entry in the page table and uses it for address mapping
        const Valid = 1 << 0;
        /// Allows reading from the mapped page
        const Read = 1 << 1;
        /// Allows writing from the mapped page
        const Write = 1 << 2;
        /// Allows executing code from the mapped page
        const Execute = 1 << 3;
        /// Allows reading from the mapped page **from user mode**
        const UserReadable = 1 << 4;
        /// If set, the MMU considers this entry to be present in **all** address space IDs and caches them accordingly.
        /// It is safe to never set this but when setting it, care should be taken to do it correctly.
        const Global = 1 << 5;
        /// Set by the MMU when something has read from the page since the mapping was set up
        const Accessed = 1 << 6;
        /// Set by the MMU when something has written to the page since the mapping was set up
        const Dirty = 1 << 7;

        /// Software bit marking the mapped page to be copied before it is written
        const CopyOnWrite = 1 << 8;
        /// Software bit marking the mapped page as shared, meaning that this entry holds no reference on it
        const Shared = 1 << 9;

        const RWX = Self::Read.bits() | Self::Write.bits() | Self::Execute.bits();
    }
}

impl Debug for EntryFlags {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        fn write_bit(
            flags: EntryFlags,
            bit: EntryFlags,
            c: char,
            f: &mut Formatter<'_>,
        ) -> core::fmt::Result {
            if flags.contains(bit) {
                f.write_char(c)
            } else {
                f.write_char(' ')
            }
        }
        write_bit(*self, EntryFlags::Shared, 'S', f)?;
        write_bit(*self, EntryFlags::CopyOnWrite, 'C', f)?;
        write_bit(*self, EntryFlags::Dirty, 'D', f)?;
        write_bit(*self, EntryFlags::Accessed, 'A', f)?;
        write_bit(*self, EntryFlags::Global, 'G', f)?;
        write_bit(*self, EntryFlags::UserReadable, 'U', f)?;
        write_bit(*self, EntryFlags::Execute, 'X', f)?;
        write_bit(*self, EntryFlags::Write, 'W', f)?;
        write_bit(*self, EntryFlags::Read, 'R', f)?;
        write_bit(*self, EntryFlags::Valid, 'V', f)?;
        Ok(())
    }
}

#[derive(Debug, Eq, PartialEq)]
pub struct EntryInvalidErr;
