//! Interrupt-source gating.
//!
//! Device paths bracket buffer manipulation with `block_io`/`unblock_io` so a
//! driver callback cannot observe a half-updated buffer. The hosted kernel has
//! no asynchronous interrupts; the guard keeps the contract (and catches a
//! driver callback firing inside a blocked section, which on hardware would be
//! a masked-interrupt violation).

use crate::kernel::Kernel;

pub struct IoGuard<'s> {
    kernel: &'s Kernel,
}

/// Disables delivery of device input until the guard is dropped.
pub fn block_io(kernel: &Kernel) -> IoGuard<'_> {
    assert!(!kernel.io_blocked(), "block_io: already blocked");
    kernel.set_io_blocked(true);
    IoGuard { kernel }
}

impl Drop for IoGuard<'_> {
    fn drop(&mut self) {
        self.kernel.set_io_blocked(false);
    }
}

/// Called on the emulated interrupt path before touching device buffers.
pub(crate) fn assert_deliverable(kernel: &Kernel) {
    assert!(!kernel.io_blocked(), "device input delivered while io is blocked");
}
