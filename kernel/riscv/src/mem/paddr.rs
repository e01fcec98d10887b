/// Type alias for physical addresses.
///
/// This is used by functions that explicitly interpret addresses as physical ones.
pub type PAddr = u64;

pub const PAGE_OFFSET_BITS: u64 = 12;
pub const PAGE_OFFSET_MASK: u64 = (1 << PAGE_OFFSET_BITS) - 1;

pub(crate) const PPN0_BITS: u64 = 9;
pub(crate) const PPN0_MASK: u64 = ((1 << PPN0_BITS) - 1) << PAGE_OFFSET_BITS;
pub(crate) const PPN1_BITS: u64 = 9;
pub(crate) const PPN1_MASK: u64 = ((1 << PPN1_BITS) - 1) << (PAGE_OFFSET_BITS + PPN0_BITS);
pub(crate) const PPN2_BITS: u64 = 26;
pub(crate) const PPN2_MASK: u64 =
    ((1 << PPN2_BITS) - 1) << (PAGE_OFFSET_BITS + PPN0_BITS + PPN1_BITS);
pub(crate) const PPN_MASK: u64 = PPN0_MASK | PPN1_MASK | PPN2_MASK;

/// Get the PPN (physical page number) segments from a physical address
#[inline]
pub fn ppn_segments(paddr: PAddr) -> [u64; 3] {
    [
        (paddr & PPN0_MASK) >> PAGE_OFFSET_BITS,
        (paddr & PPN1_MASK) >> (PAGE_OFFSET_BITS + PPN0_BITS),
        (paddr & PPN2_MASK) >> (PAGE_OFFSET_BITS + PPN0_BITS + PPN1_BITS),
    ]
}

/// Get the physical page number encoded in a physical address
#[inline]
pub fn ppn(paddr: PAddr) -> u64 {
    (paddr & PPN_MASK) >> PAGE_OFFSET_BITS
}

/// Construct the physical address at which the given physical page starts
#[inline]
pub fn from_ppn(ppn: u64) -> PAddr {
    (ppn << PAGE_OFFSET_BITS) & PPN_MASK
}

/// Get the page offset from a physical address
#[inline]
pub fn page_offset(paddr: PAddr) -> u64 {
    paddr & PAGE_OFFSET_MASK
}

#[inline]
pub fn is_page_aligned(paddr: PAddr) -> bool {
    page_offset(paddr) == 0
}
