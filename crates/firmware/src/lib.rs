//! Early-boot firmware for PC-compatible boards.
//!
//! The crate brings up the chipset of a PC-compatible machine before any
//! operating system exists: it establishes a serial console, initializes the
//! legacy interrupt controller, timer, keyboard controller and RTC, then
//! enumerates PCI and probes ATA/IDE controllers. Every dynamic structure it
//! builds lives on a freestanding [`heap::Heap`] backed by
//! [`allocator::block_list::BlockHeap`].
//!
//! Hardware is only reached through the [`io::PortIo`] trait, so everything
//! except the bare-metal entry point and the register capture in
//! [`diagnostics`] runs (and is tested) on the host.

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

#[macro_use]
pub mod console;
#[macro_use]
pub mod log;

pub mod boot;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod drivers;
pub mod error;
pub mod heap;
pub mod io;

#[cfg(test)]
mod testing;
