//! Power state management
use log::error;
use sbi::system_reset::*;

/// Turn the machine off after the kernel hit an unrecoverable error
#[inline(always)]
pub fn abort() -> ! {
    if let Err(e) = system_reset(ResetType::Shutdown, ResetReason::SystemFailure) {
        error!("system reset failed: {}", e);
    }
    // firmware without the reset extension only knows the legacy call
    sbi::legacy::shutdown();
}
