//! Access to physical memory from the kernel

use crate::mem::paddr::PAddr;

/// Description of where physical memory is loadable from while the kernel runs.
///
/// The memory management unit works with physical addresses, for example when following page table entries, while the
/// CPU can only load from addresses that are accessible under the currently active translation.
/// A `PhysMapping` translates between both by adding a constant offset.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PhysMapping {
    offset: u64,
}

impl PhysMapping {
    /// Return the mapping which describes addresses being identity-mapped.
    /// That is, physical addresses can be loaded from their value directly and do not need to be
    /// mapped.
    pub const fn identity() -> Self {
        Self { offset: 0 }
    }

    /// Create a new instance describing physical memory at `phys` being loadable from `mapped`
    pub fn new(phys: PAddr, mapped: *const u8) -> Self {
        Self {
            offset: (mapped as u64).wrapping_sub(phys),
        }
    }

    /// Resolve the given physical address into its loadable mapped variant.
    ///
    /// This method is intended to be used when the input is an address that is understood by the memory management
    /// unit while the output is an address that is loadable by the CPU right now.
    pub const fn map(&self, addr: PAddr) -> u64 {
        addr.wrapping_add(self.offset)
    }

    /// Resolve the given physical address into a pointer that is loadable right now
    pub fn map_ptr<T>(&self, addr: PAddr) -> *mut T {
        self.map(addr) as usize as *mut T
    }

    /// Reverse-resolve the given mapped address to its actual hardware address.
    ///
    /// This method is intended to be used when the input is an address that is loadable by the CPU right now while
    /// the output is one that is understood by the memory management unit.
    pub const fn rev_map(&self, addr: u64) -> PAddr {
        addr.wrapping_sub(self.offset)
    }
}
