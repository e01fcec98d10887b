//! Handling of CPU control and status registers
//!
//! This module implements some dummy structs which each model a certain cpu register as it is defined in
//! Chapter 4 of the [Risc-V Privileged Specification](https://github.com/riscv/riscv-isa-manual/releases/download/Priv-v1.12/riscv-privileged-20211203.pdf)
//!
//! The register *contents* are plain data types that are usable on every architecture while the register *access*
//! is only available when compiling for riscv64.

use bitflags::bitflags;
#[cfg(target_arch = "riscv64")]
use core::arch::asm;

/// Generate code to set specific register bits but leave others untouched and return the previous register value
#[cfg(target_arch = "riscv64")]
macro_rules! read_set_reg {
    ($csr:literal, $value:expr) => {{
        let res: u64;
        asm!(concat!("csrrs {}, ", $csr, ", {}"), out(reg) res, in(reg) $value);
        res
    }};
}

/// Generate code to clear specific register bits but leave others untouched and return the previous register value
#[cfg(target_arch = "riscv64")]
macro_rules! read_clear_reg {
    ($csr:literal, $value:expr) => {{
        let res: u64;
        asm!(concat!("csrrc {}, ", $csr, ", {}"), out(reg) res, in(reg) $value);
        res
    }};
}

/// Supervisor Status Register.
///
/// It keeps track of the processor's current operating state.
#[allow(dead_code)]
pub struct SStatus {}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct SStatusFlags: u64 {
        /// The SIE bit enables or disables all interrupts in supervisor mode.
        /// When SIE is clear, interrupts are not taken while in supervisor mode.
        /// When the hart is running in user-mode, the value in SIE is ignored, and supervisor-level interrupts are enabled.
        const SIE = 1 << 1;
    }
}

#[cfg(target_arch = "riscv64")]
impl SStatus {
    /// Set only those bits of the register to `1` where `mask` is set while leaving all other register bits untouched.
    ///
    /// The register content from before the modification is returned.
    ///
    /// # Safety
    /// Because writing to this register can change how the processor operates it is fundamentally unsafe.
    pub unsafe fn set(mask: SStatusFlags) -> SStatusFlags {
        SStatusFlags::from_bits_truncate(read_set_reg!("sstatus", mask.bits()))
    }

    /// Clear all register bits, setting them to `0` where `mask` is set.
    ///
    /// The register content from before the modification is returned.
    ///
    /// # Safety
    /// Because writing to this register can change how the processor operates it is fundamentally unsafe.
    pub unsafe fn clear(mask: SStatusFlags) -> SStatusFlags {
        SStatusFlags::from_bits_truncate(read_clear_reg!("sstatus", mask.bits()))
    }
}

/// The data that is held by the [`Satp`] register.
///
/// Generally this register holds the physical page number (PPN) of the root page table, i.e., its supervisor physical address divided by 4 KiB;
/// an address space identifier (ASID), which facilitates address-translation fences on a per-address-space basis; and the MODE field, which selects the current address-translation scheme.
///
/// **Warning**: Read the mode variant descriptions carefully as they impose restrictions on valid values for the other fields.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct SatpData {
    pub mode: SatpMode,
    pub asid: u64,
    pub ppn: u64,
}

impl From<u64> for SatpData {
    fn from(value: u64) -> Self {
        SatpData {
            mode: SatpMode::from(value >> 60),   // bits 60-63
            asid: value >> 44 & ((1 << 16) - 1), // bits 44-59
            ppn: value & ((1 << 44) - 1),        // bits 0-43
        }
    }
}

impl From<SatpData> for u64 {
    fn from(value: SatpData) -> Self {
        u64::from(value.mode) << 60
            | (value.asid & ((1 << 16) - 1)) << 44
            | value.ppn & ((1 << 44) - 1)
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SatpMode {
    /// No translation or protection
    ///
    /// When MODE=Bare, supervisor virtual addresses are equal to supervisor physical addresses, and there is no additional memory protection beyond the physical memory protection scheme.
    /// **To select MODE=Bare, software must write zero to the remaining fields of satp.**
    Bare,
    /// Page-based 39-bit virtual addressing
    Sv39,
    /// Page-based 48-bit virtual addressing
    Sv48,
    /// Page-based 57-bit virtual addressing
    Sv57,
    /// A mode value that is reserved by the privileged specification
    Reserved(u64),
}

impl From<u64> for SatpMode {
    fn from(value: u64) -> Self {
        match value {
            0 => SatpMode::Bare,
            8 => SatpMode::Sv39,
            9 => SatpMode::Sv48,
            10 => SatpMode::Sv57,
            other => SatpMode::Reserved(other),
        }
    }
}

impl From<SatpMode> for u64 {
    fn from(value: SatpMode) -> Self {
        match value {
            SatpMode::Bare => 0,
            SatpMode::Sv39 => 8,
            SatpMode::Sv48 => 9,
            SatpMode::Sv57 => 10,
            SatpMode::Reserved(other) => other & 0xf,
        }
    }
}

/// Supervisor Address Translation and Protection Register
///
/// The satp register is a  read/write register, which controls supervisor-mode address translation and protection.
#[allow(unused)]
pub struct Satp {}

#[cfg(target_arch = "riscv64")]
impl Satp {
    /// Write the register and flush all address translation caches of the executing hart
    ///
    /// # Safety
    /// The new address translation must keep the currently executing code and stack accessible.
    pub unsafe fn write_raw(val: u64) {
        asm!("
            csrw satp, {}
            sfence.vma zero, zero
        ", in(reg) val);
    }

    /// # Safety
    /// See [`write_raw`](Satp::write_raw).
    pub unsafe fn write(val: SatpData) {
        Self::write_raw(val.into())
    }
}

/// Read the `tp` register which the kernel uses to hold the id of the executing hart
#[cfg(target_arch = "riscv64")]
#[inline(always)]
pub fn hart_id() -> usize {
    let id: usize;
    unsafe { asm!("mv {}, tp", out(reg) id, options(nomem, nostack)) };
    id
}
