//! Data-Structures and Definitions for Sv39 Virtual-Addressing
//!
//! # Virtual Addressing Basics
//!
//! Sv39 implementations support a 39-bit virtual address space, divided into 4 KiB pages.
//! An Sv39 address is partitioned as shown in the below figure.
//!
//! ```text
//! 38           30 29          21 20          12 11            0
//! ┌──────────────┬──────────────┬──────────────┬───────────────┐
//! │    VPN[2]    │    VPN[1]    │    VPN[0]    │  page offset  │
//! └──────────────┴──────────────┴──────────────┴───────────────┘
//!      9bits          9bits          9bits           12bits
//!                      Sv39 Virtual Address
//! ```
//!
//! This virtual address is translated into a physical address by transforming the VPN (virtual page number) segments
//! into PPN (physical page number) segments via a three-level page table hierarchy.
//! The 12-bit page offset is untranslated and carried over into the physical address.
//!
//! ```text
//! 55                   30 29          21 20          12 11            0
//! ┌──────────────────────┬──────────────┬──────────────┬───────────────┐
//! │        PPN[2]        │    PPN[1]    │    PPN[0]    │  page offset  │
//! └──────────────────────┴──────────────┴──────────────┴───────────────┘
//!          26bits             9bits          9bits           12bits
//!                      Sv39 Phyiscal Address
//! ```
//!
//! Only the lower half of the address space (`0` up to [`MAX_VADDR`]) is used by this kernel and only 4 KiB pages
//! are ever mapped.
//! The table hierarchy of an address space is managed by the [`AddressSpaceManager`].

mod address_space;
mod mapping;
pub mod paddr;
mod page_table_entry;
mod page_tables;
pub mod vaddr;

use core::ops::{Deref, DerefMut};

pub use address_space::{satp_of, AddressSpaceManager, MapError, PteSlot};
pub use mapping::PhysMapping;
pub use paddr::PAddr;
pub use page_table_entry::*;
pub use page_tables::*;
pub use vaddr::{VAddr, MAX_VADDR};

/// How large each page in the memory of a riscv board is.
///
/// This effects the alignment and sizes of some data structures that directly interface with the CPU e.g. PageTables
pub const PAGESIZE: usize = 4096;

/// Type definition for a slice of bytes that is exactly one page large and aligned to it as well
#[derive(Copy, Clone, Eq, PartialEq)]
#[repr(C, align(4096))]
pub struct MemoryPage([u8; PAGESIZE]);

impl Deref for MemoryPage {
    type Target = [u8; PAGESIZE];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for MemoryPage {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Default for MemoryPage {
    fn default() -> Self {
        Self([0u8; PAGESIZE])
    }
}
