//! Masking of supervisor interrupts on the executing hart

use crate::cpu::{SStatus, SStatusFlags};
use ksync::InterruptControl;

/// Controls the `SIE` bit of the [`SStatus`] register of whichever hart executes the call
#[derive(Debug, Default, Copy, Clone)]
pub struct SupervisorInterrupts;

impl InterruptControl for SupervisorInterrupts {
    #[inline]
    fn disable(&self) -> bool {
        // Safety: masking interrupts cannot break memory safety
        let previous = unsafe { SStatus::clear(SStatusFlags::SIE) };
        previous.contains(SStatusFlags::SIE)
    }

    #[inline]
    fn restore(&self, enabled: bool) {
        // Safety: interrupts are only re-enabled if they were enabled before being masked by `disable()`
        unsafe {
            match enabled {
                true => SStatus::set(SStatusFlags::SIE),
                false => SStatus::clear(SStatusFlags::SIE),
            }
        };
    }
}
