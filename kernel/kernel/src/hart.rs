//! Per-hart kernel state

use crate::config::NUM_HARTS;
use ksync::{HartState, InterruptControl};

/// The [`HartState`] of every supported hart, indexed by hart id.
///
/// Each entry must only ever be used by the hart it belongs to, which is what makes sharing the table between
/// harts sound even though a single [`HartState`] is not `Sync`.
pub struct HartTable<I: InterruptControl> {
    harts: [HartState<I>; NUM_HARTS],
}

unsafe impl<I: InterruptControl + Send> Sync for HartTable<I> {}

impl<I: InterruptControl> HartTable<I> {
    /// Create a table from the given states.
    ///
    /// The state at index `n` must belong to hart `n`.
    pub const fn new(harts: [HartState<I>; NUM_HARTS]) -> Self {
        Self { harts }
    }

    /// Get the state of the hart with the given id.
    ///
    /// The caller must be executing on that hart.
    pub fn get(&self, hart_id: usize) -> Option<&HartState<I>> {
        let state = self.harts.get(hart_id)?;
        debug_assert_eq!(state.hart_id(), hart_id, "hart table is not indexed by hart id");
        Some(state)
    }
}

#[cfg(target_arch = "riscv64")]
impl HartTable<riscv::interrupts::SupervisorInterrupts> {
    /// Get the state of the executing hart
    pub fn current(&self) -> &HartState<riscv::interrupts::SupervisorInterrupts> {
        let hart_id = riscv::cpu::hart_id();
        match self.get(hart_id) {
            Some(state) => state,
            None => panic!("hart {hart_id} has no kernel state"),
        }
    }
}
