//! Address translation cache (TLB) maintenance
//!
//! Changing a valid page table entry is only globally visible once every hart that could have cached the old
//! translation has invalidated it.
//! Harts cannot do that for each other directly, which is why the request is passed to the SBI firmware which
//! interrupts the targeted harts and executes `sfence.vma` on each of them before returning.

use crate::cpu::SatpData;
use crate::mem::VAddr;
use thiserror_no_std::Error;

#[derive(Debug, Error, Copy, Clone, Eq, PartialEq)]
pub enum FenceError {
    #[error("the firmware failed to fence {size:#x} bytes at {vaddr:#x} on harts {hart_mask:#b} (base {hart_mask_base})")]
    TranslationFenceFailed {
        hart_mask: usize,
        hart_mask_base: usize,
        vaddr: VAddr,
        size: u64,
    },
}

/// Access to the memory management unit
pub trait Mmu {
    /// Synchronously invalidate cached translations of `size` bytes starting at `vaddr` on all harts whose bit is set in
    /// `hart_mask`.
    ///
    /// Bit `n` of `hart_mask` selects the hart `hart_mask_base + n`.
    /// When this returns successfully, no selected hart uses a stale translation of the range anymore.
    fn remote_sfence_vma(
        &self,
        hart_mask: usize,
        hart_mask_base: usize,
        vaddr: VAddr,
        size: u64,
    ) -> Result<(), FenceError>;

    /// Make `satp` the active address translation of the executing hart and flush its whole translation cache.
    ///
    /// # Safety
    /// The new address translation must keep the currently executing code and stack accessible.
    unsafe fn activate(&self, satp: SatpData);
}

/// The memory management unit of a riscv hart, with remote fences delegated to the SBI firmware
#[cfg(target_arch = "riscv64")]
#[derive(Debug, Default, Copy, Clone)]
pub struct SbiMmu;

#[cfg(target_arch = "riscv64")]
impl Mmu for SbiMmu {
    fn remote_sfence_vma(
        &self,
        hart_mask: usize,
        hart_mask_base: usize,
        vaddr: VAddr,
        size: u64,
    ) -> Result<(), FenceError> {
        let mask = (0..usize::BITS as usize)
            .filter(|bit| hart_mask & (1 << bit) != 0)
            .fold(sbi::HartMask::new(hart_mask_base), |mask, bit| {
                mask.with(hart_mask_base + bit)
            });
        sbi::rfence::remote_sfence_vma(mask, vaddr as usize, size as usize).map_err(|e| {
            log::error!("sbi remote_sfence_vma error: {}", e);
            FenceError::TranslationFenceFailed {
                hart_mask,
                hart_mask_base,
                vaddr,
                size,
            }
        })
    }

    unsafe fn activate(&self, satp: SatpData) {
        crate::cpu::Satp::write(satp);
    }
}
