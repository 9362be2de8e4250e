//! 8042 PS/2 keyboard controller.

use bitflags::bitflags;
use snafu::{Snafu, ensure};

use super::poll_until;
use crate::{
    config::KBDCTL_POLL_LIMIT,
    device::{Device, DeviceData, DeviceStatus, Initialize},
    heap::Heap,
    io::PortIo,
};

const DATA: u16 = 0x60;
/// Status register when read, command register when written.
const STATUS: u16 = 0x64;
const COMMAND: u16 = 0x64;

const CMD_READ_CONFIG: u8 = 0x20;
const CMD_WRITE_CONFIG: u8 = 0x60;
const CMD_DISABLE_SECOND: u8 = 0xa7;
const CMD_ENABLE_SECOND: u8 = 0xa8;
const CMD_SELF_TEST: u8 = 0xaa;
const CMD_DISABLE_FIRST: u8 = 0xad;
const CMD_ENABLE_FIRST: u8 = 0xae;
const CMD_WRITE_SECOND_INPUT: u8 = 0xd4;

const DEVICE_RESET: u8 = 0xff;
const DEVICE_ACK: u8 = 0xfa;
const SELF_TEST_PASSED: u8 = 0x55;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Status : u8 {
        const OUTPUT_FULL = 1 << 0;
        const INPUT_FULL = 1 << 1;
    }

    /// Controller configuration byte.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Configuration : u8 {
        const FIRST_INTERRUPT = 1 << 0;
        const SECOND_INTERRUPT = 1 << 1;
        const SYSTEM_FLAG = 1 << 2;
        const FIRST_CLOCK_DISABLED = 1 << 4;
        const SECOND_CLOCK_DISABLED = 1 << 5;
        const TRANSLATION = 1 << 6;
    }
}

/// Bits kept when bring-up rewrites the configuration byte: interrupts and
/// translation are turned off.
const CONFIG_KEEP_MASK: u8 = 0xbc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Snafu)]
pub enum KbdctlError {
    #[snafu(display("8042 did not become ready for {operation}"))]
    Timeout { operation: &'static str },
    #[snafu(display("8042 answered {response:#04x} to {operation}"))]
    UnexpectedResponse {
        operation: &'static str,
        response: u8,
    },
}

/// State recorded for the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KbdctlConfig {
    pub configuration: u8,
    pub dual_channel: bool,
}

#[derive(Debug)]
pub struct Kbdctl<P> {
    ports: P,
}

impl<P> Kbdctl<P>
where
    P: PortIo,
{
    pub fn new(ports: P) -> Self {
        Self { ports }
    }

    fn status(&mut self) -> Status {
        Status::from_bits_retain(self.ports.read_u8(STATUS))
    }

    fn wait_writable(&mut self, operation: &'static str) -> Result<(), KbdctlError> {
        let ready = poll_until(KBDCTL_POLL_LIMIT, || {
            !self.status().contains(Status::INPUT_FULL)
        });
        ensure!(ready, TimeoutSnafu { operation });
        Ok(())
    }

    fn send_command(&mut self, command: u8, operation: &'static str) -> Result<(), KbdctlError> {
        self.wait_writable(operation)?;
        self.ports.write_u8(COMMAND, command);
        Ok(())
    }

    fn send_data(&mut self, data: u8, operation: &'static str) -> Result<(), KbdctlError> {
        self.wait_writable(operation)?;
        self.ports.write_u8(DATA, data);
        Ok(())
    }

    fn receive_data(&mut self, operation: &'static str) -> Result<u8, KbdctlError> {
        let ready = poll_until(KBDCTL_POLL_LIMIT, || {
            self.status().contains(Status::OUTPUT_FULL)
        });
        ensure!(ready, TimeoutSnafu { operation });
        Ok(self.ports.read_u8(DATA))
    }

    pub fn read_config(&mut self) -> Result<u8, KbdctlError> {
        self.send_command(CMD_READ_CONFIG, "read config")?;
        self.receive_data("read config")
    }

    /// Writes the configuration byte and checks that it sticks.
    pub fn write_config(&mut self, config: u8) -> Result<(), KbdctlError> {
        self.send_command(CMD_WRITE_CONFIG, "write config")?;
        self.send_data(config, "write config")?;
        let response = self.read_config()?;
        ensure!(
            response == config,
            UnexpectedResponseSnafu {
                operation: "write config",
                response,
            }
        );
        Ok(())
    }

    pub fn self_test(&mut self) -> Result<(), KbdctlError> {
        self.send_command(CMD_SELF_TEST, "self test")?;
        let response = self.receive_data("self test")?;
        ensure!(
            response == SELF_TEST_PASSED,
            UnexpectedResponseSnafu {
                operation: "self test",
                response,
            }
        );
        Ok(())
    }

    pub fn disable_ports(&mut self) -> Result<(), KbdctlError> {
        self.send_command(CMD_DISABLE_FIRST, "disable first port")?;
        self.send_command(CMD_DISABLE_SECOND, "disable second port")
    }

    pub fn enable_ports(&mut self, dual_channel: bool) -> Result<(), KbdctlError> {
        self.send_command(CMD_ENABLE_FIRST, "enable first port")?;
        if dual_channel {
            self.send_command(CMD_ENABLE_SECOND, "enable second port")?;
        }
        Ok(())
    }

    /// Resets the device on the first or, if `second`, the second port.
    pub fn reset_device(&mut self, second: bool) -> Result<(), KbdctlError> {
        if second {
            self.send_command(CMD_WRITE_SECOND_INPUT, "reset device")?;
        }
        self.send_data(DEVICE_RESET, "reset device")?;
        let response = self.receive_data("reset device")?;
        ensure!(
            response == DEVICE_ACK,
            UnexpectedResponseSnafu {
                operation: "reset device",
                response,
            }
        );
        Ok(())
    }
}

impl<'h, P> Initialize<'h> for Kbdctl<P>
where
    P: PortIo,
{
    fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus {
        let initial = match self.read_config() {
            Ok(config) => config,
            Err(err) => {
                debug!("{err}");
                return DeviceStatus::NotPresent;
            }
        };
        let config = initial & CONFIG_KEEP_MASK;
        if let Err(err) = self.write_config(config) {
            debug!("{err}");
            return DeviceStatus::Faulty;
        }
        if let Err(err) = self.self_test() {
            debug!("{err}");
            if let Err(err) = self.write_config(initial) {
                error!("8042 stopped responding, restoring config failed: {err}");
            }
            return DeviceStatus::Faulty;
        }

        let dual_channel =
            Configuration::from_bits_retain(initial).contains(Configuration::SECOND_CLOCK_DISABLED);
        device.complete(
            heap,
            DeviceData::Kbdctl(KbdctlConfig {
                configuration: config,
                dual_channel,
            }),
        )
    }
}
