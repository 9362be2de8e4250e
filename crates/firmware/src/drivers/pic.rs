//! Cascaded 8259 programmable interrupt controllers.
//!
//! The secondary controller hangs off IRQ 2 of the primary. After bring-up
//! every line except the cascade is masked; drivers unmask the lines they
//! handle.

use crate::{
    config::{PIC_IO_DELAY, PIC_PRIMARY_VECTOR_OFFSET, PIC_SECONDARY_VECTOR_OFFSET},
    device::{Device, DeviceData, DeviceStatus, Initialize},
    heap::Heap,
    io::PortIo,
};

const PRIMARY_COMMAND: u16 = 0x20;
const PRIMARY_DATA: u16 = 0x21;
const SECONDARY_COMMAND: u16 = 0xa0;
const SECONDARY_DATA: u16 = 0xa1;
/// Edge/level control registers.
const ELCR_LOW: u16 = 0x4d0;
const ELCR_HIGH: u16 = 0x4d1;

/// ICW1: edge triggered, cascaded, ICW4 follows.
const ICW1_INIT: u8 = 0x11;
/// ICW3 of the primary: a secondary is attached to IRQ 2.
const ICW3_PRIMARY: u8 = 1 << CASCADE_IRQ;
/// ICW3 of the secondary: its cascade identity.
const ICW3_SECONDARY: u8 = CASCADE_IRQ;
/// ICW4: 8086 mode.
const ICW4_8086: u8 = 0x01;
const OCW2_EOI: u8 = 0x20;
const OCW3_READ_IRR: u8 = 0x0a;
const OCW3_READ_ISR: u8 = 0x0b;

const CASCADE_IRQ: u8 = 2;
const PRIMARY_MASK: u8 = !(1 << CASCADE_IRQ);
const SECONDARY_MASK: u8 = 0xff;
/// IRQ 9 is level triggered on PCI chipsets.
const ELCR_LEVEL_TRIGGERED: u16 = 1 << 9;

/// Settings programmed into the controller pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PicConfig {
    pub primary_offset: u8,
    pub secondary_offset: u8,
    pub primary_mask: u8,
    pub secondary_mask: u8,
    pub elcr: u16,
}

#[derive(Debug)]
pub struct Pic<P> {
    ports: P,
}

impl<P> Pic<P>
where
    P: PortIo,
{
    pub fn new(ports: P) -> Self {
        Self { ports }
    }

    fn command(&mut self, port: u16, value: u8) {
        self.ports.write_u8(port, value);
        self.ports.io_delay(PIC_IO_DELAY);
    }

    fn data(&mut self, port: u16, value: u8) {
        self.ports.write_u8(port, value);
        self.ports.io_delay(PIC_IO_DELAY);
    }

    /// Returns the interrupt masks, secondary in the high byte.
    pub fn masks(&mut self) -> u16 {
        let primary = self.ports.read_u8(PRIMARY_DATA);
        let secondary = self.ports.read_u8(SECONDARY_DATA);
        u16::from_le_bytes([primary, secondary])
    }

    fn line(irq: u8) -> (u16, u8) {
        if irq < 8 {
            (PRIMARY_DATA, irq)
        } else {
            (SECONDARY_DATA, irq - 8)
        }
    }

    pub fn mask_irq(&mut self, irq: u8) {
        let (port, line) = Self::line(irq);
        let mask = self.ports.read_u8(port) | (1 << line);
        self.data(port, mask);
    }

    pub fn unmask_irq(&mut self, irq: u8) {
        let (port, line) = Self::line(irq);
        let mask = self.ports.read_u8(port) & !(1 << line);
        self.data(port, mask);
    }

    /// Acknowledges `irq`. Secondary lines need both controllers to be told.
    pub fn send_eoi(&mut self, irq: u8) {
        if irq >= 8 {
            self.ports.write_u8(SECONDARY_COMMAND, OCW2_EOI);
        }
        self.ports.write_u8(PRIMARY_COMMAND, OCW2_EOI);
    }

    fn read_register(&mut self, ocw3: u8) -> u16 {
        self.command(PRIMARY_COMMAND, ocw3);
        self.command(SECONDARY_COMMAND, ocw3);
        let primary = self.ports.read_u8(PRIMARY_COMMAND);
        let secondary = self.ports.read_u8(SECONDARY_COMMAND);
        u16::from_le_bytes([primary, secondary])
    }

    /// In-service register of both controllers.
    pub fn read_isr(&mut self) -> u16 {
        self.read_register(OCW3_READ_ISR)
    }

    /// Interrupt request register of both controllers.
    pub fn read_irr(&mut self) -> u16 {
        self.read_register(OCW3_READ_IRR)
    }

    fn set_level_triggered(&mut self, lines: u16) -> u16 {
        let low = self.ports.read_u8(ELCR_LOW);
        let high = self.ports.read_u8(ELCR_HIGH);
        let elcr = u16::from_le_bytes([low, high]) | lines;
        let [low, high] = elcr.to_le_bytes();
        self.ports.write_u8(ELCR_LOW, low);
        self.ports.write_u8(ELCR_HIGH, high);
        elcr
    }
}

impl<'h, P> Initialize<'h> for Pic<P>
where
    P: PortIo,
{
    fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus {
        self.command(PRIMARY_COMMAND, ICW1_INIT);
        self.command(SECONDARY_COMMAND, ICW1_INIT);
        self.data(PRIMARY_DATA, PIC_PRIMARY_VECTOR_OFFSET);
        self.data(SECONDARY_DATA, PIC_SECONDARY_VECTOR_OFFSET);
        self.data(PRIMARY_DATA, ICW3_PRIMARY);
        self.data(SECONDARY_DATA, ICW3_SECONDARY);
        self.data(PRIMARY_DATA, ICW4_8086);
        self.data(SECONDARY_DATA, ICW4_8086);

        self.data(PRIMARY_DATA, PRIMARY_MASK);
        self.data(SECONDARY_DATA, SECONDARY_MASK);

        let [primary, secondary] = self.masks().to_le_bytes();
        if primary != PRIMARY_MASK || secondary != SECONDARY_MASK {
            if primary == 0xff {
                return DeviceStatus::NotPresent;
            }
            debug!("8259: mask readback {primary:#04x}/{secondary:#04x}");
            return DeviceStatus::Faulty;
        }

        let elcr = self.set_level_triggered(ELCR_LEVEL_TRIGGERED);
        device.complete(
            heap,
            DeviceData::Pic(PicConfig {
                primary_offset: PIC_PRIMARY_VECTOR_OFFSET,
                secondary_offset: PIC_SECONDARY_VECTOR_OFFSET,
                primary_mask: primary,
                secondary_mask: secondary,
                elcr,
            }),
        )
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::DeviceAccess,
        testing::{FakePorts, with_heap},
    };

    fn pic_ports() -> FakePorts {
        let mut ports = FakePorts::new();
        ports
            .echo(PRIMARY_DATA)
            .echo(SECONDARY_DATA)
            .set(ELCR_LOW, 0x00)
            .set(ELCR_HIGH, 0x00);
        ports
    }

    #[test]
    fn test_init_sequence() {
        with_heap(4096, |heap| {
            let mut ports = pic_ports();
            let mut device = Device::new("8259/PIC", DeviceAccess::Pio);
            let status = Pic::new(&mut ports).init(heap, &mut device);
            assert_eq!(status, DeviceStatus::Initialised);
            assert_eq!(ports.writes_to(PRIMARY_COMMAND), [0x11]);
            assert_eq!(ports.writes_to(SECONDARY_COMMAND), [0x11]);
            assert_eq!(ports.writes_to(PRIMARY_DATA), [0x20, 0x04, 0x01, 0xfb]);
            assert_eq!(ports.writes_to(SECONDARY_DATA), [0x28, 0x02, 0x01, 0xff]);
            assert_eq!(ports.writes_to(ELCR_LOW), [0x00]);
            assert_eq!(ports.writes_to(ELCR_HIGH), [0x02]);
            let Some(DeviceData::Pic(config)) = device.data() else {
                panic!("missing PIC data");
            };
            assert_eq!(config.elcr, 0x0200);
            assert_eq!(config.primary_mask, 0xfb);
        });
    }

    #[test]
    fn test_floating_bus_is_not_present() {
        with_heap(4096, |heap| {
            let mut ports = FakePorts::new();
            let mut device = Device::new("8259/PIC", DeviceAccess::Pio);
            let status = Pic::new(&mut ports).init(heap, &mut device);
            assert_eq!(status, DeviceStatus::NotPresent);
        });
    }

    #[test]
    fn test_wrong_mask_is_faulty() {
        with_heap(4096, |heap| {
            let mut ports = FakePorts::new();
            ports.set(PRIMARY_DATA, 0x12).set(SECONDARY_DATA, 0xff);
            let mut device = Device::new("8259/PIC", DeviceAccess::Pio);
            let status = Pic::new(&mut ports).init(heap, &mut device);
            assert_eq!(status, DeviceStatus::Faulty);
            assert!(device.data().is_none());
        });
    }

    #[test]
    fn test_mask_and_unmask() {
        let mut ports = pic_ports();
        let mut pic = Pic::new(&mut ports);
        pic.data(PRIMARY_DATA, PRIMARY_MASK);
        pic.data(SECONDARY_DATA, SECONDARY_MASK);
        pic.unmask_irq(0);
        pic.unmask_irq(12);
        assert_eq!(pic.masks(), 0xeffa);
        pic.mask_irq(0);
        assert_eq!(pic.masks(), 0xeffb);
    }

    #[test]
    fn test_eoi_and_status_registers() {
        let mut ports = FakePorts::new();
        ports.set(PRIMARY_COMMAND, 0x01).set(SECONDARY_COMMAND, 0x10);
        let mut pic = Pic::new(&mut ports);
        pic.send_eoi(3);
        pic.send_eoi(9);
        assert_eq!(pic.read_isr(), 0x1001);
        assert_eq!(pic.read_irr(), 0x1001);
        assert_eq!(ports.writes_to(SECONDARY_COMMAND), [0x20, 0x0b, 0x0a]);
        assert_eq!(ports.writes_to(PRIMARY_COMMAND), [0x20, 0x20, 0x0b, 0x0a]);
    }
}
