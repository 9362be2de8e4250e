//! PCI enumeration over configuration mechanism #1.
//!
//! Every function found gets its own heap-allocated [`Device`] record with a
//! [`PciDeviceData`] payload. The host bridge decides how many buses are
//! scanned: a multi-function host bridge has one bus per responding function.

use core::fmt;

use allocator::block_list::HeapError;
use snafu::{ResultExt as _, Snafu};

use crate::{
    config::{PCI_FUNCTIONS_PER_SLOT, PCI_SLOTS_PER_BUS},
    device::{Device, DeviceAccess, DeviceData, DeviceList, DeviceStatus},
    error::Location,
    heap::{Heap, HeapBox},
    io::PortIo,
};

const CONFIG_ADDRESS: u16 = 0xcf8;
const CONFIG_DATA: u16 = 0xcfc;

const REG_ID: u8 = 0x00;
const REG_CLASS: u8 = 0x08;
/// Cache line size, latency timer, header type and BIST.
const REG_HEADER: u8 = 0x0c;
const REG_INTERRUPT: u8 = 0x3c;

const VENDOR_NONE: u16 = 0xffff;
const HEADER_MULTI_FUNCTION: u8 = 0x80;
const BIST_CAPABLE: u8 = 0x80;
const BIST_START: u8 = 0x40;

pub const CLASS_MASS_STORAGE: u8 = 0x01;
pub const CLASS_BRIDGE: u8 = 0x06;
pub const SUBCLASS_PCI_BRIDGE: u8 = 0x04;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PciAddress {
    pub bus: u8,
    pub device: u8,
    pub function: u8,
}

impl PciAddress {
    #[must_use]
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self {
            bus,
            device,
            function,
        }
    }

    /// Value written to `CONFIG_ADDRESS` to reach register `offset`.
    #[must_use]
    pub fn config_address(&self, offset: u8) -> u32 {
        0x8000_0000
            | (u32::from(self.bus) << 16)
            | (u32::from(self.device & 0x1f) << 11)
            | (u32::from(self.function & 0x07) << 8)
            | u32::from(offset & 0xfc)
    }
}

impl fmt::Display for PciAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus, self.device, self.function)
    }
}

/// Identification of one PCI function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PciDeviceData {
    pub address: PciAddress,
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub prog_if: u8,
    pub revision: u8,
    pub header_type: u8,
    pub interrupt_line: u8,
    pub bist_started: bool,
}

impl PciDeviceData {
    #[must_use]
    pub fn is_bridge(&self) -> bool {
        self.class == CLASS_BRIDGE && self.subclass == SUBCLASS_PCI_BRIDGE
    }

    #[must_use]
    pub fn is_multi_function(&self) -> bool {
        self.header_type & HEADER_MULTI_FUNCTION != 0
    }
}

/// Returns a short human readable name for a class code.
#[must_use]
pub fn class_name(class: u8, subclass: u8) -> &'static str {
    match (class, subclass) {
        (0x01, 0x01) => "IDE controller",
        (0x01, 0x05) => "ATA controller",
        (0x01, 0x06) => "SATA controller",
        (0x01, _) => "mass storage controller",
        (0x02, _) => "network controller",
        (0x03, _) => "display controller",
        (0x04, _) => "multimedia controller",
        (0x05, _) => "memory controller",
        (0x06, 0x00) => "host bridge",
        (0x06, 0x01) => "ISA bridge",
        (0x06, 0x04) => "PCI-to-PCI bridge",
        (0x06, _) => "bridge",
        (0x0c, 0x03) => "USB controller",
        (0x0c, _) => "serial bus controller",
        _ => "PCI device",
    }
}

#[derive(Debug, Snafu)]
pub enum PciError {
    #[snafu(display("out of memory while recording PCI function {address}"))]
    Allocate {
        address: PciAddress,
        #[snafu(source)]
        source: HeapError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Access to PCI configuration space.
#[derive(Debug)]
pub struct ConfigSpace<P> {
    ports: P,
}

impl<P> ConfigSpace<P>
where
    P: PortIo,
{
    pub fn new(ports: P) -> Self {
        Self { ports }
    }

    pub fn read(&mut self, address: PciAddress, offset: u8) -> u32 {
        self.ports
            .write_u32(CONFIG_ADDRESS, address.config_address(offset));
        self.ports.read_u32(CONFIG_DATA)
    }

    pub fn write(&mut self, address: PciAddress, offset: u8, value: u32) {
        self.ports
            .write_u32(CONFIG_ADDRESS, address.config_address(offset));
        self.ports.write_u32(CONFIG_DATA, value);
    }

    fn vendor_id(&mut self, address: PciAddress) -> u16 {
        let [vendor_low, vendor_high, ..] = self.read(address, REG_ID).to_le_bytes();
        u16::from_le_bytes([vendor_low, vendor_high])
    }

    fn is_present(&mut self, address: PciAddress) -> bool {
        self.vendor_id(address) != VENDOR_NONE
    }

    fn header_type(&mut self, address: PciAddress) -> u8 {
        self.read(address, REG_HEADER).to_le_bytes()[2]
    }

    /// Starts the built-in self test if the function has one.
    pub fn start_bist(&mut self, address: PciAddress) -> bool {
        let header = self.read(address, REG_HEADER);
        let [.., bist] = header.to_le_bytes();
        if bist & BIST_CAPABLE == 0 {
            return false;
        }
        self.write(
            address,
            REG_HEADER,
            header | (u32::from(BIST_START) << 24),
        );
        true
    }

    /// Reads the identification registers of a present function.
    pub fn read_function(&mut self, address: PciAddress) -> PciDeviceData {
        let id = self.read(address, REG_ID);
        let [revision, prog_if, subclass, class] = self.read(address, REG_CLASS).to_le_bytes();
        let [interrupt_line, ..] = self.read(address, REG_INTERRUPT).to_le_bytes();
        let header_type = self.header_type(address);
        let bist_started = self.start_bist(address);
        let [vendor_low, vendor_high, device_low, device_high] = id.to_le_bytes();
        PciDeviceData {
            address,
            vendor_id: u16::from_le_bytes([vendor_low, vendor_high]),
            device_id: u16::from_le_bytes([device_low, device_high]),
            class,
            subclass,
            prog_if,
            revision,
            header_type,
            interrupt_line,
            bist_started,
        }
    }
}

/// Records every PCI function in `devices`.
///
/// Returns the number of functions found. Running out of heap aborts the
/// scan with the functions recorded so far kept in `devices`.
pub fn enumerate<'h, P>(
    heap: &'h Heap,
    ports: P,
    devices: &mut DeviceList<'h>,
) -> Result<usize, PciError>
where
    P: PortIo,
{
    let mut config = ConfigSpace::new(ports);
    let host = PciAddress::default();
    if !config.is_present(host) {
        info!("PCI: no host bridge");
        return Ok(0);
    }

    let mut count = scan_bus(heap, &mut config, 0, devices)?;
    if config.header_type(host) & HEADER_MULTI_FUNCTION != 0 {
        for function in 1..PCI_FUNCTIONS_PER_SLOT {
            if !config.is_present(PciAddress::new(0, 0, function)) {
                break;
            }
            count += scan_bus(heap, &mut config, function, devices)?;
        }
    }
    info!("PCI: {count} functions");
    Ok(count)
}

fn scan_bus<'h, P>(
    heap: &'h Heap,
    config: &mut ConfigSpace<P>,
    bus: u8,
    devices: &mut DeviceList<'h>,
) -> Result<usize, PciError>
where
    P: PortIo,
{
    let mut count = 0;
    for slot in 0..PCI_SLOTS_PER_BUS {
        let address = PciAddress::new(bus, slot, 0);
        if !config.is_present(address) {
            continue;
        }
        let functions = if config.header_type(address) & HEADER_MULTI_FUNCTION != 0 {
            PCI_FUNCTIONS_PER_SLOT
        } else {
            1
        };
        for function in 0..functions {
            let address = PciAddress::new(bus, slot, function);
            if !config.is_present(address) {
                continue;
            }
            record_function(heap, config, address, devices)?;
            count += 1;
        }
    }
    Ok(count)
}

fn record_function<'h, P>(
    heap: &'h Heap,
    config: &mut ConfigSpace<P>,
    address: PciAddress,
    devices: &mut DeviceList<'h>,
) -> Result<(), PciError>
where
    P: PortIo,
{
    let data = config.read_function(address);
    let name = class_name(data.class, data.subclass);
    let access = if data.is_bridge() {
        DeviceAccess::Bridge
    } else {
        DeviceAccess::Mmio
    };
    debug!(
        "PCI {address}: {:04x}:{:04x} {name}",
        data.vendor_id, data.device_id
    );

    let mut device = Device::new(name, access);
    device.status = DeviceStatus::Present;
    device
        .attach(heap, DeviceData::Pci(data))
        .context(AllocateSnafu { address })?;
    let device = HeapBox::new(heap, device).context(AllocateSnafu { address })?;
    devices.push(device).context(AllocateSnafu { address })
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakePorts, pci_header, with_heap};

    fn pci_data(device: &Device<'_>) -> PciDeviceData {
        match device.data() {
            Some(DeviceData::Pci(data)) => *data,
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_config_address() {
        assert_eq!(PciAddress::new(0, 3, 0).config_address(0), 0x8000_1800);
        assert_eq!(PciAddress::new(1, 31, 7).config_address(0x0e), 0x8001_ff0c);
        assert_eq!(PciAddress::new(0, 1, 2).to_string(), "00:01.2");
    }

    #[test]
    fn test_no_host_bridge() {
        with_heap(4096, |heap| {
            let mut ports = FakePorts::new();
            let mut devices = DeviceList::new(heap);
            assert_eq!(enumerate(heap, &mut ports, &mut devices).unwrap(), 0);
            assert!(devices.is_empty());
        });
    }

    #[test]
    fn test_single_bus_enumeration() {
        with_heap(16384, |heap| {
            let mut ports = FakePorts::new();
            ports.add_pci_function(0, 0, 0, pci_header(0x8086, 0x1237, 0x06, 0x00, 0, 0));
            ports.add_pci_function(0, 1, 0, pci_header(0x8086, 0x7000, 0x06, 0x01, 0, 0x80));
            ports.add_pci_function(0, 1, 1, pci_header(0x8086, 0x7010, 0x01, 0x01, 0x80, 0));
            ports.add_pci_function(0, 5, 0, pci_header(0x1b36, 0x0001, 0x06, 0x04, 0, 1));
            let mut nic = pci_header(0x8086, 0x100e, 0x02, 0x00, 0, 0);
            nic[3] |= 0x8000_0000;
            ports.add_pci_function(0, 31, 0, nic);

            let mut devices = DeviceList::new(heap);
            let count = enumerate(heap, &mut ports, &mut devices).unwrap();
            assert_eq!(count, 5);
            assert_eq!(devices.len(), 5);

            let names: Vec<_> = devices.iter().map(|device| device.name).collect();
            assert_eq!(
                names,
                [
                    "host bridge",
                    "ISA bridge",
                    "IDE controller",
                    "PCI-to-PCI bridge",
                    "network controller"
                ]
            );
            assert!(devices.iter().all(|d| d.status == DeviceStatus::Present));

            let bridge = devices.find("PCI-to-PCI bridge").unwrap();
            assert_eq!(bridge.access, DeviceAccess::Bridge);
            let ide = pci_data(devices.find("IDE controller").unwrap());
            assert_eq!(ide.address, PciAddress::new(0, 1, 1));
            assert_eq!(ide.prog_if, 0x80);
            assert_eq!(devices.find("IDE controller").unwrap().access, DeviceAccess::Mmio);

            let nic = pci_data(devices.find("network controller").unwrap());
            assert!(nic.bist_started);
            assert_eq!(ports.pci_register(0, 31, 0, 0x0c), Some(0xc000_0000));
            assert!(!ide.bist_started);
        });
    }

    #[test]
    fn test_multi_function_host_bridge_adds_buses() {
        with_heap(16384, |heap| {
            let mut ports = FakePorts::new();
            ports.add_pci_function(0, 0, 0, pci_header(0x8086, 0x29c0, 0x06, 0x00, 0, 0x80));
            ports.add_pci_function(0, 0, 1, pci_header(0x8086, 0x29c1, 0x06, 0x00, 0, 0));
            ports.add_pci_function(1, 2, 0, pci_header(0x1af4, 0x1000, 0x02, 0x00, 0, 0));
            ports.add_pci_function(2, 2, 0, pci_header(0x1af4, 0x1001, 0x01, 0x00, 0, 0));

            let mut devices = DeviceList::new(heap);
            let count = enumerate(heap, &mut ports, &mut devices).unwrap();
            // bus 0 holds both host functions, bus 1 the NIC, bus 2 is not scanned
            assert_eq!(count, 3);
            let nic = pci_data(devices.find("network controller").unwrap());
            assert_eq!(nic.address.bus, 1);
            assert!(devices.find("mass storage controller").is_none());
        });
    }

    #[test]
    fn test_out_of_memory_is_reported() {
        with_heap(256, |heap| {
            let mut ports = FakePorts::new();
            for slot in 0..8 {
                ports.add_pci_function(0, slot, 0, pci_header(0x1234, 0x5678, 0x02, 0x00, 0, 0));
            }
            let mut devices = DeviceList::new(heap);
            let err = enumerate(heap, &mut ports, &mut devices).unwrap_err();
            assert!(matches!(err, PciError::Allocate { .. }));
            heap.check().unwrap();
        });
    }
}
