//! 8254 programmable interval timer.

use bitflags::bitflags;

use super::pic::Pic;
use crate::{
    config::PIT_FREQUENCY_HZ,
    device::{Device, DeviceData, DeviceStatus, Initialize},
    heap::Heap,
    io::PortIo,
};

const CHANNEL0_DATA: u16 = 0x40;
const COMMAND: u16 = 0x43;

const TIMER_IRQ: u8 = 0;

bitflags! {
    /// Mode/command register, and the status byte returned by read-back.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Command : u8 {
        const BCD = 1 << 0;
        const MODE_RATE_GENERATOR = 0b010 << 1;
        const ACCESS_LOW = 1 << 4;
        const ACCESS_HIGH = 1 << 5;
        const ACCESS_LOW_HIGH = Self::ACCESS_LOW.bits() | Self::ACCESS_HIGH.bits();
        const SELECT_READ_BACK = 0b11 << 6;
    }

    /// Read-back command.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct ReadBack : u8 {
        const CHANNEL0 = 1 << 1;
        /// Active low: do not latch the status.
        const NO_LATCH_STATUS = 1 << 4;
        /// Active low: do not latch the count.
        const NO_LATCH_COUNT = 1 << 5;
        const READ_BACK = Command::SELECT_READ_BACK.bits();
    }
}

/// Mode, access and BCD bits of the status byte.
const STATUS_CONFIG_MASK: u8 = 0x3f;

/// Settings programmed into channel 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitConfig {
    pub reload: u16,
}

impl PitConfig {
    /// Frequency of the timer interrupt in Hz.
    #[must_use]
    pub fn frequency_hz(&self) -> u32 {
        PIT_FREQUENCY_HZ / u32::from(self.reload.max(1))
    }
}

/// Channel 0 as a binary rate generator raising IRQ 0.
#[derive(Debug)]
pub struct Pit<P> {
    ports: P,
    reload: u16,
}

impl<P> Pit<P>
where
    P: PortIo,
{
    pub fn new(ports: P, reload: u16) -> Self {
        Self { ports, reload }
    }

    fn expected_command() -> Command {
        Command::ACCESS_LOW_HIGH | Command::MODE_RATE_GENERATOR
    }

    /// Latches and returns the status byte of channel 0.
    pub fn channel0_status(&mut self) -> u8 {
        let read_back = ReadBack::READ_BACK | ReadBack::NO_LATCH_COUNT | ReadBack::CHANNEL0;
        self.ports.write_u8(COMMAND, read_back.bits());
        self.ports.read_u8(CHANNEL0_DATA)
    }
}

impl<'h, P> Initialize<'h> for Pit<P>
where
    P: PortIo,
{
    fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus {
        let command = Self::expected_command();
        self.ports.write_u8(COMMAND, command.bits());
        let [low, high] = self.reload.to_le_bytes();
        self.ports.write_u8(CHANNEL0_DATA, low);
        self.ports.write_u8(CHANNEL0_DATA, high);

        let status = self.channel0_status();
        if status & STATUS_CONFIG_MASK != command.bits() {
            if status == 0x00 || status == 0xff {
                return DeviceStatus::NotPresent;
            }
            debug!("8254: unexpected status {status:#04x}");
            return DeviceStatus::Faulty;
        }

        let config = PitConfig {
            reload: self.reload,
        };
        debug!("8254: {} Hz tick", config.frequency_hz());
        Pic::new(&mut self.ports).unmask_irq(TIMER_IRQ);
        device.complete(heap, DeviceData::Pit(config))
    }
}
