//! Chipset drivers.
//!
//! Every driver reaches its hardware through [`PortIo`](crate::io::PortIo)
//! only, so the same code runs against real ports and against the scripted
//! bus used by the tests. Waiting for hardware is always a bounded poll.

use core::hint;

pub mod ata;
pub mod cmos;
pub mod kbdctl;
pub mod pci;
pub mod pic;
pub mod pit;
pub mod serial;

/// Calls `ready` up to `limit` times until it returns `true`.
///
/// Returns `false` if the hardware never became ready.
pub(crate) fn poll_until<F>(limit: u32, mut ready: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..limit {
        if ready() {
            return true;
        }
        hint::spin_loop();
    }
    false
}
