/// Type alias for virtual addresses.
///
/// This is used by functions that explicitly interpret addresses as virtual ones.
pub type VAddr = u64;

pub(crate) const PAGE_OFFSET_BITS: u64 = 12;
pub(crate) const PAGE_OFFSET_MASK: u64 = (1 << PAGE_OFFSET_BITS) - 1;

const VPN_SEGMENT_BITS: u64 = 9;
const VPN_SEGMENT_MASK: u64 = (1 << VPN_SEGMENT_BITS) - 1;

/// The largest virtual address that can be mapped
pub const MAX_VADDR: VAddr = (1 << 39) - 1;

/// Get the VPN (virtual page number) segments from a virtual address.
///
/// The segment at index `n` selects the entry in the page table of level `n`.
#[inline]
pub fn vpn_segments(vaddr: VAddr) -> [usize; 3] {
    [
        ((vaddr >> PAGE_OFFSET_BITS) & VPN_SEGMENT_MASK) as usize,
        ((vaddr >> (PAGE_OFFSET_BITS + VPN_SEGMENT_BITS)) & VPN_SEGMENT_MASK) as usize,
        ((vaddr >> (PAGE_OFFSET_BITS + 2 * VPN_SEGMENT_BITS)) & VPN_SEGMENT_MASK) as usize,
    ]
}

/// Get the page offset from a virtual address
#[inline]
pub fn page_offset(vaddr: VAddr) -> u64 {
    vaddr & PAGE_OFFSET_MASK
}

/// Round the address down to the start of its page
#[inline]
pub fn page_align_down(vaddr: VAddr) -> VAddr {
    vaddr & !PAGE_OFFSET_MASK
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_vpn_segments() {
        let vaddr: VAddr = (3 << 30) | (7 << 21) | (511 << 12) | 0x123;
        assert_eq!(vpn_segments(vaddr), [511, 7, 3]);
        assert_eq!(page_offset(vaddr), 0x123);
        assert_eq!(page_align_down(vaddr), vaddr - 0x123);
        assert_eq!(vpn_segments(MAX_VADDR), [511, 511, 511]);
    }
}
