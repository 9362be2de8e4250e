//! 16550 UART.

use bitflags::bitflags;
use spin::Mutex;

use super::poll_until;
use crate::{
    config::{
        UART_FIFO_CONTROL, UART_LINE_CONTROL, UART_MODEM_CONTROL, UART_TX_POLL_LIMIT,
    },
    console::ByteSink,
    device::{Device, DeviceData, DeviceStatus, Initialize},
    heap::Heap,
    io::PortIo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct Register {
    offset: u16,
}

// Some registers have different meanings for read and write.
impl Register {
    /// Receive Holding Register (readonly)
    const RX_HOLDING: Self = Self::new(0);
    /// Transmit Holding Register (writeonly)
    const TX_HOLDING: Self = Self::new(0);
    /// Interrupt Enable Register
    const INTERRUPT_ENABLE: Self = Self::new(1);
    /// FIFO Control Register (writeonly)
    const FIFO_CONTROL: Self = Self::new(2);
    /// Line Control Register
    const LINE_CONTROL: Self = Self::new(3);
    /// Modem Control Register
    const MODEM_CONTROL: Self = Self::new(4);
    /// Line Status Register (readonly)
    const LINE_STATUS: Self = Self::new(5);

    /// LSB of Divisor Latch
    const DIVISOR_LATCH_LSB: Self = Self::new(0);
    /// MSB of Divisor Latch
    const DIVISOR_LATCH_MSB: Self = Self::new(1);

    const fn new(offset: u16) -> Self {
        Self { offset }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct LineControl : u8 {
        const DIVISOR_LATCH = 1 << 7;
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct LineStatus : u8 {
        const RX_READY = 1 << 0;
        const TX_IDLE = 1 << 5;
    }
}

/// Settings programmed into a UART.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UartConfig {
    pub base_port: u16,
    pub divisor: u16,
    pub line_control: u8,
    pub fifo_control: u8,
}

/// Register-level access to one UART.
#[derive(Debug)]
pub struct SerialPort<P> {
    ports: P,
    base: u16,
}

impl<P> SerialPort<P>
where
    P: PortIo,
{
    pub const fn new(ports: P, base: u16) -> Self {
        Self { ports, base }
    }

    #[must_use]
    pub fn base(&self) -> u16 {
        self.base
    }

    fn write_register(&mut self, reg: Register, value: u8) {
        self.ports.write_u8(self.base + reg.offset, value);
    }

    fn read_register(&mut self, reg: Register) -> u8 {
        self.ports.read_u8(self.base + reg.offset)
    }

    fn line_status(&mut self) -> LineStatus {
        LineStatus::from_bits_retain(self.read_register(Register::LINE_STATUS))
    }

    /// Returns `false` if nothing drives the line status register.
    pub fn is_present(&mut self) -> bool {
        self.read_register(Register::LINE_STATUS) != 0xff
    }

    pub fn is_tx_idle(&mut self) -> bool {
        self.line_status().contains(LineStatus::TX_IDLE)
    }

    pub fn is_rx_ready(&mut self) -> bool {
        self.line_status().contains(LineStatus::RX_READY)
    }

    /// Programs the divisor, 8N1 framing, the FIFO and the modem lines.
    pub fn configure(&mut self, divisor: u16) -> UartConfig {
        // disable interrupts
        self.write_register(Register::INTERRUPT_ENABLE, 0x00);

        // special mode to set baud rate
        self.write_register(Register::LINE_CONTROL, LineControl::DIVISOR_LATCH.bits());
        let [divisor_msb, divisor_lsb] = divisor.to_be_bytes();
        self.write_register(Register::DIVISOR_LATCH_LSB, divisor_lsb);
        self.write_register(Register::DIVISOR_LATCH_MSB, divisor_msb);

        // leave set-baud mode
        self.write_register(Register::LINE_CONTROL, UART_LINE_CONTROL);
        self.write_register(Register::FIFO_CONTROL, UART_FIFO_CONTROL);
        self.write_register(Register::MODEM_CONTROL, UART_MODEM_CONTROL);

        UartConfig {
            base_port: self.base,
            divisor,
            line_control: UART_LINE_CONTROL,
            fifo_control: UART_FIFO_CONTROL,
        }
    }

    fn wait_tx_idle(&mut self) -> bool {
        poll_until(UART_TX_POLL_LIMIT, || self.is_tx_idle())
    }

    /// Transmits `bytes`, sending `\r` before every `\n`.
    ///
    /// Returns the number of bytes of `bytes` sent before the transmitter
    /// stopped draining.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> usize {
        for (count, &byte) in bytes.iter().enumerate() {
            if byte == b'\n' {
                if !self.wait_tx_idle() {
                    return count;
                }
                self.write_register(Register::TX_HOLDING, b'\r');
            }
            if !self.wait_tx_idle() {
                return count;
            }
            self.write_register(Register::TX_HOLDING, byte);
        }
        bytes.len()
    }

    /// Reads the bytes already received, up to `bytes.len()`.
    pub fn read_bytes(&mut self, bytes: &mut [u8]) -> usize {
        let mut count = 0;
        for byte in bytes {
            if !self.is_rx_ready() {
                break;
            }
            *byte = self.read_register(Register::RX_HOLDING);
            count += 1;
        }
        count
    }
}

/// Bring-up of a UART.
#[derive(Debug)]
pub struct Uart<P> {
    port: SerialPort<P>,
    divisor: u16,
}

impl<P> Uart<P>
where
    P: PortIo,
{
    pub fn new(ports: P, base: u16, divisor: u16) -> Self {
        Self {
            port: SerialPort::new(ports, base),
            divisor,
        }
    }
}

impl<'h, P> Initialize<'h> for Uart<P>
where
    P: PortIo,
{
    fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus {
        if !self.port.is_present() {
            return DeviceStatus::NotPresent;
        }
        let config = self.port.configure(self.divisor);
        device.complete(heap, DeviceData::Uart(config))
    }
}

/// A UART used as the console.
pub struct SerialConsole<P> {
    port: Mutex<SerialPort<P>>,
}

impl<P> SerialConsole<P>
where
    P: PortIo,
{
    pub const fn new(port: SerialPort<P>) -> Self {
        Self {
            port: Mutex::new(port),
        }
    }
}

impl<P> ByteSink for SerialConsole<P>
where
    P: PortIo + Send,
{
    fn write_bytes(&self, bytes: &[u8]) {
        self.port.lock().write_bytes(bytes);
    }
}
