//! Board configuration.
//!
//! Fixed properties of the chipset are constants. Choices that differ between
//! boards or builds are collected in [`BootConfig`].

use allocator::block_list::DEFAULT_SPLIT_FACTOR;
use bitflags::bitflags;

use crate::log::LogLevel;

pub const FIRMWARE_NAME: &str = "TinyBIOS";
pub const FIRMWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Base port of the first serial port.
pub const COM1_PORT: u16 = 0x3F8;
/// Input clock of the 16550 baud rate generator, divided by 16.
pub const UART_CLOCK_HZ: u32 = 115_200;
pub const DEFAULT_BAUD_RATE: u32 = 38_400;
/// 8 data bits, no parity, 1 stop bit.
pub const UART_LINE_CONTROL: u8 = 0x03;
pub const UART_FIFO_CONTROL: u8 = 0x01;
/// DTR and RTS asserted.
pub const UART_MODEM_CONTROL: u8 = 0x03;
pub const UART_TX_POLL_LIMIT: u32 = 50_000;

pub const PIC_PRIMARY_VECTOR_OFFSET: u8 = 0x20;
pub const PIC_SECONDARY_VECTOR_OFFSET: u8 = 0x28;
pub const PIC_IO_DELAY: u16 = 50;

/// Input clock of the 8254 timer.
pub const PIT_FREQUENCY_HZ: u32 = 1_193_182;
/// Reload value for channel 0, giving a tick of roughly 100 Hz.
pub const PIT_DEFAULT_RELOAD: u16 = 11_932;

pub const KBDCTL_POLL_LIMIT: u32 = 5_000;

pub const CMOS_MAX_IO_DELAY: u16 = 0x500;
pub const CMOS_UPDATE_POLL_LIMIT: u32 = 100_000;

pub const PCI_SLOTS_PER_BUS: u8 = 32;
pub const PCI_FUNCTIONS_PER_SLOT: u8 = 8;

/// Base ports of the four legacy ATA buses.
pub const ATA_COMPAT_BASES: [u16; 4] = [0x1F0, 0x170, 0x1E8, 0x168];
/// Distance from a legacy bus base to its control block.
pub const ATA_CONTROL_OFFSET: u16 = 0x206;
pub const ATA_POLL_LIMIT: u32 = 10_000;

/// QEMU places usable RAM from 1 MiB upwards.
pub const DEFAULT_HEAP_START: usize = 0x0010_0000;
pub const DEFAULT_HEAP_SIZE: usize = 0x0010_0000;

bitflags! {
    /// Devices whose failure stops the boot.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CriticalDevices: u8 {
        const UART = 1 << 0;
        const PIC = 1 << 1;
        const KBDCTL = 1 << 2;
        const PIT = 1 << 3;
        const CMOS = 1 << 4;
    }
}

/// Runtime parameters of the boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    pub heap_start: usize,
    pub heap_size: usize,
    pub split_factor: usize,
    pub log_level: LogLevel,
    pub baud_rate: u32,
    pub pit_reload: u16,
    pub critical: CriticalDevices,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            heap_start: DEFAULT_HEAP_START,
            heap_size: DEFAULT_HEAP_SIZE,
            split_factor: DEFAULT_SPLIT_FACTOR,
            log_level: LogLevel::Info,
            baud_rate: DEFAULT_BAUD_RATE,
            pit_reload: PIT_DEFAULT_RELOAD,
            critical: CriticalDevices::empty(),
        }
    }
}

impl BootConfig {
    /// Divisor programmed into the UART for the configured baud rate.
    ///
    /// Rates that do not divide the clock evenly round down to the next
    /// faster rate; zero and rates above the clock yield divisor 1.
    #[must_use]
    pub fn uart_divisor(&self) -> u16 {
        let divisor = UART_CLOCK_HZ.checked_div(self.baud_rate).unwrap_or(1).max(1);
        u16::try_from(divisor).unwrap_or(u16::MAX)
    }
}
