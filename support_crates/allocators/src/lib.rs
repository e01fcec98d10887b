#![no_std]

use thiserror_no_std::Error;

mod page_allocator;

pub use page_allocator::{metadata_bytes, PageAllocator, PageIndex, PageInfo};

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum AllocError {
    #[error("the allocator has no free page left")]
    OutOfMemory,
    #[error("address {addr:#x} is not aligned to the page size")]
    InvalidAlignment { addr: usize },
    #[error("address {addr:#x} is outside of the memory managed by the allocator")]
    OutOfRange { addr: usize },
}
