//! CMOS memory and the real-time clock.
//!
//! Some chipsets need a pause between selecting a CMOS register and reading
//! it. Bring-up searches for the shortest pause that returns a plausible and
//! stable month, and every later access uses that pause.

use bitflags::bitflags;
use snafu::{Snafu, ensure};

use super::poll_until;
use crate::{
    config::{CMOS_MAX_IO_DELAY, CMOS_UPDATE_POLL_LIMIT},
    device::{Device, DeviceData, DeviceStatus, Initialize},
    heap::Heap,
    io::PortIo,
};

const INDEX: u16 = 0x70;
const DATA: u16 = 0x71;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Register(u8);

impl Register {
    const SECONDS: Self = Self(0x00);
    const MINUTES: Self = Self(0x02);
    const HOURS: Self = Self(0x04);
    const DAY_OF_WEEK: Self = Self(0x06);
    const DAY_OF_MONTH: Self = Self(0x07);
    const MONTH: Self = Self(0x08);
    const YEAR: Self = Self(0x09);
    const STATUS_A: Self = Self(0x0a);
    const STATUS_B: Self = Self(0x0b);
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StatusA : u8 {
        const UPDATE_IN_PROGRESS = 1 << 7;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct StatusB : u8 {
        const HOUR_24 = 1 << 1;
        const BINARY = 1 << 2;
    }
}

const HOUR_PM: u8 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum CmosError {
    #[snafu(display("RTC update did not finish"))]
    UpdateTimeout,
}

/// What bring-up learned about the CMOS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmosData {
    pub io_delay: u16,
    pub bcd: bool,
    pub twelve_hour: bool,
}

/// A decoded RTC reading. The year is the two-digit year of the century.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtcTime {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day_of_week: u8,
    pub day_of_month: u8,
    pub month: u8,
    pub year: u8,
}

fn bcd_to_binary(value: u8) -> u8 {
    (value >> 4) * 10 + (value & 0x0f)
}

/// Accepts months in both binary and BCD encoding.
fn is_plausible_month(raw: u8) -> bool {
    matches!(raw, 0x01..=0x0c | 0x10..=0x12)
}

#[derive(Debug)]
pub struct Cmos<P> {
    ports: P,
    io_delay: u16,
}

impl<P> Cmos<P>
where
    P: PortIo,
{
    pub fn new(ports: P) -> Self {
        Self { ports, io_delay: 0 }
    }

    /// Uses the pause found by an earlier bring-up.
    pub fn with_data(ports: P, data: &CmosData) -> Self {
        Self {
            ports,
            io_delay: data.io_delay,
        }
    }

    fn read(&mut self, reg: Register) -> u8 {
        self.ports.write_u8(INDEX, reg.0);
        self.ports.io_delay(self.io_delay);
        self.ports.read_u8(DATA)
    }

    fn update_in_progress(&mut self) -> bool {
        StatusA::from_bits_retain(self.read(Register::STATUS_A))
            .contains(StatusA::UPDATE_IN_PROGRESS)
    }

    fn wait_for_update(&mut self) -> Result<(), CmosError> {
        let done = poll_until(CMOS_UPDATE_POLL_LIMIT, || !self.update_in_progress());
        ensure!(done, UpdateTimeoutSnafu);
        Ok(())
    }

    /// Reads the current date and time.
    pub fn read_time(&mut self, data: &CmosData) -> Result<RtcTime, CmosError> {
        self.wait_for_update()?;
        let decode = |value: u8| if data.bcd { bcd_to_binary(value) } else { value };

        let second = decode(self.read(Register::SECONDS));
        let minute = decode(self.read(Register::MINUTES));
        let raw_hour = self.read(Register::HOURS);
        let day_of_week = decode(self.read(Register::DAY_OF_WEEK));
        let day_of_month = decode(self.read(Register::DAY_OF_MONTH));
        let month = decode(self.read(Register::MONTH));
        let year = decode(self.read(Register::YEAR));

        let mut hour = decode(raw_hour & !HOUR_PM);
        if data.twelve_hour {
            let pm = raw_hour & HOUR_PM != 0;
            hour %= 12;
            if pm {
                hour += 12;
            }
        }

        Ok(RtcTime {
            second,
            minute,
            hour,
            day_of_week,
            day_of_month,
            month,
            year,
        })
    }
}

impl<'h, P> Initialize<'h> for Cmos<P>
where
    P: PortIo,
{
    fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus {
        for io_delay in 0..CMOS_MAX_IO_DELAY {
            self.io_delay = io_delay;
            if self.wait_for_update().is_err() {
                return DeviceStatus::NotPresent;
            }
            let month = self.read(Register::MONTH);
            if !is_plausible_month(month) || self.read(Register::MONTH) != month {
                continue;
            }

            let status_b = StatusB::from_bits_retain(self.read(Register::STATUS_B));
            debug!("CMOS: I/O delay {io_delay}, status B {:#04x}", status_b.bits());
            return device.complete(
                heap,
                DeviceData::Cmos(CmosData {
                    io_delay,
                    bcd: !status_b.contains(StatusB::BINARY),
                    twelve_hour: !status_b.contains(StatusB::HOUR_24),
                }),
            );
        }
        DeviceStatus::Faulty
    }
}
