//! ATA/IDE controllers found on PCI.
//!
//! Controllers running in compatibility mode answer on the four legacy bus
//! addresses; every bus is probed for a master and a slave drive with
//! IDENTIFY. Controllers in native PCI mode are recorded but not probed.

use allocator::block_list::HeapError;
use arrayvec::{ArrayString, ArrayVec};
use bitflags::bitflags;
use derive_more::Display;

use super::{
    pci::{CLASS_MASS_STORAGE, PciDeviceData},
    poll_until,
};
use crate::{
    config::{ATA_COMPAT_BASES, ATA_CONTROL_OFFSET, ATA_POLL_LIMIT},
    device::{DeviceAccess, DeviceData, DeviceList},
    error,
    heap::{Heap, HeapBox, HeapVec},
    io::PortIo,
};

const SUBCLASS_IDE: u8 = 0x01;
const SUBCLASS_ATA: u8 = 0x05;
const SUBCLASS_SATA: u8 = 0x06;
/// Programming interface bit: primary channel in native PCI mode.
const PROG_IF_PRIMARY_NATIVE: u8 = 1 << 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Register {
    offset: u16,
}

impl Register {
    const DATA: Self = Self::new(0);
    const SECTOR_COUNT: Self = Self::new(2);
    const LBA_LOW: Self = Self::new(3);
    const LBA_MID: Self = Self::new(4);
    const LBA_HIGH: Self = Self::new(5);
    const DRIVE_SELECT: Self = Self::new(6);
    /// Status when read, command when written.
    const STATUS: Self = Self::new(7);
    const COMMAND: Self = Self::new(7);

    const fn new(offset: u16) -> Self {
        Self { offset }
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Status : u8 {
        const ERROR = 1 << 0;
        const DATA_REQUEST = 1 << 3;
        const READY = 1 << 6;
        const BUSY = 1 << 7;
    }
}

const CMD_IDENTIFY: u8 = 0xec;
const DRIVE_SELECT_BASE: u8 = 0xa0;
/// Status of a bus without drives.
const STATUS_FLOATING: u8 = 0xff;

const SIGNATURE_ATAPI: (u8, u8) = (0x14, 0xeb);
const SIGNATURE_SATA: (u8, u8) = (0x3c, 0xc3);

pub const IDENTIFY_WORDS: usize = 256;
const MODEL_WORDS: core::ops::Range<usize> = 27..47;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DrivePosition {
    #[display("master")]
    Master,
    #[display("slave")]
    Slave,
}

impl DrivePosition {
    fn select_bits(self) -> u8 {
        match self {
            Self::Master => DRIVE_SELECT_BASE,
            Self::Slave => DRIVE_SELECT_BASE | (1 << 4),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum DriveKind {
    #[display("ATA")]
    Ata,
    #[display("ATAPI")]
    Atapi,
    #[display("SATA")]
    Sata,
}

#[derive(Debug)]
pub struct AtaDrive<'h> {
    pub position: DrivePosition,
    pub kind: DriveKind,
    /// The IDENTIFY block, if it could be stored.
    pub identify: Option<HeapBox<'h, [u16; IDENTIFY_WORDS]>>,
    pub model: ArrayString<40>,
}

#[derive(Debug)]
pub struct AtaBus<'h> {
    pub base: u16,
    pub control: u16,
    pub drives: [Option<AtaDrive<'h>>; 2],
}

#[derive(Debug)]
pub struct IdeController<'h> {
    pub pci: PciDeviceData,
    pub native: bool,
    pub buses: ArrayVec<AtaBus<'h>, 4>,
}

/// Decodes the model string: each identify word holds two characters, high
/// byte first. Trailing padding is dropped.
#[must_use]
pub fn model_string(identify: &[u16; IDENTIFY_WORDS]) -> ArrayString<40> {
    let mut model = ArrayString::new();
    for &word in &identify[MODEL_WORDS] {
        for byte in word.to_be_bytes() {
            let ch = if byte.is_ascii_graphic() || byte == b' ' {
                char::from(byte)
            } else {
                '?'
            };
            model.push(ch);
        }
    }
    let len = model.trim_end().len();
    model.truncate(len);
    model
}

fn is_ide_controller(data: &PciDeviceData) -> bool {
    data.class == CLASS_MASS_STORAGE
        && matches!(data.subclass, SUBCLASS_IDE | SUBCLASS_ATA | SUBCLASS_SATA)
}

struct BusProbe<'a, P> {
    ports: &'a mut P,
    base: u16,
}

impl<P> BusProbe<'_, P>
where
    P: PortIo,
{
    fn read(&mut self, reg: Register) -> u8 {
        self.ports.read_u8(self.base + reg.offset)
    }

    fn write(&mut self, reg: Register, value: u8) {
        self.ports.write_u8(self.base + reg.offset, value);
    }

    fn status(&mut self) -> Status {
        Status::from_bits_retain(self.read(Register::STATUS))
    }

    fn signature(&mut self) -> (u8, u8) {
        (self.read(Register::LBA_MID), self.read(Register::LBA_HIGH))
    }

    fn identify(&mut self, position: DrivePosition) -> Option<DriveKind> {
        self.write(Register::DRIVE_SELECT, position.select_bits());
        self.ports.io_delay(4);
        for reg in [
            Register::SECTOR_COUNT,
            Register::LBA_LOW,
            Register::LBA_MID,
            Register::LBA_HIGH,
        ] {
            self.write(reg, 0);
        }
        self.write(Register::COMMAND, CMD_IDENTIFY);
        if self.status().is_empty() {
            return None;
        }

        match self.signature() {
            SIGNATURE_ATAPI => return Some(DriveKind::Atapi),
            SIGNATURE_SATA => return Some(DriveKind::Sata),
            _ => {}
        }
        if !poll_until(ATA_POLL_LIMIT, || !self.status().contains(Status::BUSY)) {
            return None;
        }
        if self.signature() != (0, 0) {
            return None;
        }
        let mut status = Status::empty();
        let ready = poll_until(ATA_POLL_LIMIT, || {
            status = self.status();
            status.intersects(Status::DATA_REQUEST | Status::ERROR)
        });
        (ready && !status.contains(Status::ERROR)).then_some(DriveKind::Ata)
    }

    fn read_identify(&mut self) -> [u16; IDENTIFY_WORDS] {
        let mut words = [0; IDENTIFY_WORDS];
        for word in &mut words {
            *word = self.ports.read_u16(self.base + Register::DATA.offset);
        }
        words
    }

    fn probe_drive<'h>(&mut self, heap: &'h Heap, position: DrivePosition) -> Option<AtaDrive<'h>> {
        let kind = self.identify(position)?;
        let mut drive = AtaDrive {
            position,
            kind,
            identify: None,
            model: ArrayString::new(),
        };
        if kind == DriveKind::Ata {
            let words = self.read_identify();
            drive.model = model_string(&words);
            match HeapBox::new(heap, words) {
                Ok(words) => drive.identify = Some(words),
                Err(err) if err.is_fatal() => error::report(err),
                Err(err) => warn!("ATA {:#x} {position}: identify block dropped: {err}", self.base),
            }
        }
        info!(
            "ATA {:#x} {position}: {kind} {}",
            self.base,
            drive.model.as_str()
        );
        Some(drive)
    }
}

fn probe_bus<'h, P>(heap: &'h Heap, ports: &mut P, base: u16) -> Option<AtaBus<'h>>
where
    P: PortIo,
{
    let mut probe = BusProbe { ports, base };
    if probe.read(Register::STATUS) == STATUS_FLOATING {
        return None;
    }
    let drives = [
        probe.probe_drive(heap, DrivePosition::Master),
        probe.probe_drive(heap, DrivePosition::Slave),
    ];
    Some(AtaBus {
        base,
        control: base + ATA_CONTROL_OFFSET,
        drives,
    })
}

/// Finds the IDE controllers among the PCI `devices` and probes their buses.
///
/// Matching devices are switched to port I/O access.
pub fn scan_controllers<'h, P>(
    heap: &'h Heap,
    mut ports: P,
    devices: &mut DeviceList<'h>,
) -> Result<HeapVec<'h, IdeController<'h>>, HeapError>
where
    P: PortIo,
{
    let mut controllers = HeapVec::new(heap);
    for device in devices.iter_mut() {
        let Some(DeviceData::Pci(pci)) = device.data().copied() else {
            continue;
        };
        if !is_ide_controller(&pci) {
            continue;
        }
        device.access = DeviceAccess::Pio;

        let native = pci.prog_if & PROG_IF_PRIMARY_NATIVE != 0;
        let mut buses = ArrayVec::new();
        if native {
            info!("ATA {}: native PCI mode, not probed", pci.address);
        } else {
            for base in ATA_COMPAT_BASES {
                if let Some(bus) = probe_bus(heap, &mut ports, base) {
                    buses.push(bus);
                }
            }
        }
        controllers.push(IdeController { pci, native, buses })?;
    }
    Ok(controllers)
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        drivers::pci,
        testing::{FakePorts, pci_header, with_heap},
    };

    fn identify_block(model: &str) -> [u16; IDENTIFY_WORDS] {
        let mut words = [0; IDENTIFY_WORDS];
        let mut padded = [b' '; 40];
        padded[..model.len()].copy_from_slice(model.as_bytes());
        for (word, pair) in words[MODEL_WORDS].iter_mut().zip(padded.chunks_exact(2)) {
            *word = u16::from_be_bytes([pair[0], pair[1]]);
        }
        words
    }

    #[test]
    fn test_model_string() {
        assert_eq!(model_string(&identify_block("QEMU HARDDISK")).as_str(), "QEMU HARDDISK");
        assert_eq!(model_string(&[0; IDENTIFY_WORDS]).as_str(), "????????????????????????????????????????");
    }

    #[test]
    fn test_scan_compatibility_controller() {
        with_heap(16384, |heap| {
            let mut ports = FakePorts::new();
            ports.add_pci_function(0, 0, 0, pci_header(0x8086, 0x1237, 0x06, 0x00, 0, 0));
            ports.add_pci_function(0, 1, 0, pci_header(0x8086, 0x7000, 0x06, 0x01, 0, 0x80));
            ports.add_pci_function(0, 1, 1, pci_header(0x8086, 0x7010, 0x01, 0x01, 0x80, 0));

            // Primary bus: ATA master, empty slave.
            let words: Vec<u32> = identify_block("QEMU HARDDISK")
                .iter()
                .map(|&w| u32::from(w))
                .collect();
            ports
                .script(0x1f7, &[0x50, 0x58, 0x58, 0x58, 0x00])
                .set(0x1f4, 0)
                .set(0x1f5, 0)
                .script(0x1f0, &words);
            // Secondary bus: ATAPI master, empty slave.
            ports
                .script(0x177, &[0x00, 0x41, 0x00])
                .script(0x174, &[0x14])
                .script(0x175, &[0xeb]);

            let mut devices = DeviceList::new(heap);
            pci::enumerate(heap, &mut ports, &mut devices).unwrap();
            let controllers = scan_controllers(heap, &mut ports, &mut devices).unwrap();

            assert_eq!(controllers.len(), 1);
            let ide = &controllers[0];
            assert!(!ide.native);
            assert_eq!(ide.pci.address, pci::PciAddress::new(0, 1, 1));
            assert_eq!(ide.buses.len(), 2);

            let primary = &ide.buses[0];
            assert_eq!((primary.base, primary.control), (0x1f0, 0x3f6));
            let master = primary.drives[0].as_ref().unwrap();
            assert_eq!(master.kind, DriveKind::Ata);
            assert_eq!(master.model.as_str(), "QEMU HARDDISK");
            assert_eq!(master.identify.as_ref().unwrap()[27], u16::from_be_bytes(*b"QE"));
            assert!(primary.drives[1].is_none());

            let secondary = &ide.buses[1];
            assert_eq!(secondary.base, 0x170);
            let master = secondary.drives[0].as_ref().unwrap();
            assert_eq!(master.kind, DriveKind::Atapi);
            assert!(master.identify.is_none());

            assert_eq!(ports.writes_to(0x1f6), [0xa0, 0xb0]);
            assert_eq!(ports.writes_to(0x1f7), [0xec, 0xec]);
            assert_eq!(
                devices.find("IDE controller").unwrap().access,
                DeviceAccess::Pio
            );
            assert_eq!(devices.find("ISA bridge").unwrap().access, DeviceAccess::Mmio);
        });
    }

    #[test]
    fn test_native_controller_is_not_probed() {
        with_heap(8192, |heap| {
            let mut ports = FakePorts::new();
            ports.add_pci_function(0, 0, 0, pci_header(0x8086, 0x29c0, 0x06, 0x00, 0, 0));
            ports.add_pci_function(0, 4, 0, pci_header(0x8086, 0x2922, 0x01, 0x06, 0x01, 0));
            let mut devices = DeviceList::new(heap);
            pci::enumerate(heap, &mut ports, &mut devices).unwrap();
            ports.clear_writes();

            let controllers = scan_controllers(heap, &mut ports, &mut devices).unwrap();
            assert_eq!(controllers.len(), 1);
            assert!(controllers[0].native);
            assert!(controllers[0].buses.is_empty());
            assert!(ports.writes().is_empty());
        });
    }

    #[test]
    fn test_drive_with_foreign_signature_is_skipped() {
        with_heap(4096, |heap| {
            let mut ports = FakePorts::new();
            ports
                .script(0x1f7, &[0x50, 0x50, 0x50, 0x00])
                .script(0x1f4, &[0x00, 0x69])
                .script(0x1f5, &[0x00, 0x96]);
            let bus = probe_bus(heap, &mut ports, 0x1f0).unwrap();
            assert!(bus.drives.iter().all(Option::is_none));
        });
    }

    #[test]
    #[should_panic(expected = "heap corruption detected")]
    fn test_identify_on_corrupted_heap_is_fatal() {
        with_heap(4096, |heap| {
            let a = heap.malloc(32).unwrap();
            // Overrun `a` into the tag of the free block behind it.
            unsafe {
                a.as_ptr().add(32).cast::<u64>().write_unaligned(0xdead_beef);
            }
            let mut ports = FakePorts::new();
            ports
                .script(0x1f7, &[0x50, 0x58, 0x58, 0x58])
                .set(0x1f4, 0)
                .set(0x1f5, 0)
                .set(0x1f0, 0x2020);
            let _ = probe_bus(heap, &mut ports, 0x1f0);
        });
    }
}
