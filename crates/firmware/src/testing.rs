//! Host-side stand-ins for chipset hardware.

use std::{
    alloc::{self, Layout},
    collections::{BTreeMap, BTreeSet, VecDeque},
};

use allocator::block_list::ALIGNMENT;

use crate::{
    heap::Heap,
    io::{DELAY_PORT, PortIo},
};

const PCI_ADDRESS_PORT: u16 = 0xCF8;
const PCI_DATA_PORT: u16 = 0xCFC;

/// A scripted I/O port bus.
///
/// Reads are served, in order of preference, from the per-port script queue,
/// from the last value written to an echoing port, from a fixed per-port
/// value, and finally as a floating bus (all ones). Writes are recorded,
/// except those to the delay port. Configuration mechanism #1 is emulated for
/// the PCI functions registered with [`add_pci_function`](Self::add_pci_function).
#[derive(Debug, Default)]
pub struct FakePorts {
    scripts: BTreeMap<u16, VecDeque<u32>>,
    fixed: BTreeMap<u16, u32>,
    echo: BTreeSet<u16>,
    last_written: BTreeMap<u16, u32>,
    writes: Vec<(u16, u32)>,
    pci_address: u32,
    pci_functions: BTreeMap<u32, [u32; 64]>,
}

impl FakePorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every read of `port` return `value` once scripts run dry.
    pub fn set(&mut self, port: u16, value: u32) -> &mut Self {
        self.fixed.insert(port, value);
        self
    }

    /// Queues `values` to be returned by the next reads of `port`.
    pub fn script(&mut self, port: u16, values: &[u32]) -> &mut Self {
        self.scripts.entry(port).or_default().extend(values);
        self
    }

    /// Makes reads of `port` return the last value written to it.
    pub fn echo(&mut self, port: u16) -> &mut Self {
        self.echo.insert(port);
        self
    }

    /// Registers a PCI function whose first 16 configuration registers are
    /// `header`.
    pub fn add_pci_function(&mut self, bus: u8, device: u8, function: u8, header: [u32; 16]) {
        let mut space = [0; 64];
        space[..16].copy_from_slice(&header);
        self.pci_functions
            .insert(pci_function_key(bus, device, function), space);
    }

    pub fn pci_register(&self, bus: u8, device: u8, function: u8, offset: u8) -> Option<u32> {
        self.pci_functions
            .get(&pci_function_key(bus, device, function))
            .map(|space| space[usize::from(offset / 4)])
    }

    pub fn writes(&self) -> &[(u16, u32)] {
        &self.writes
    }

    pub fn writes_to(&self, port: u16) -> Vec<u32> {
        self.writes
            .iter()
            .filter(|(p, _)| *p == port)
            .map(|(_, value)| *value)
            .collect()
    }

    pub fn clear_writes(&mut self) {
        self.writes.clear();
    }

    fn read(&mut self, port: u16, mask: u32) -> u32 {
        if port == PCI_DATA_PORT {
            return self.read_pci() & mask;
        }
        if let Some(value) = self.scripts.get_mut(&port).and_then(VecDeque::pop_front) {
            return value & mask;
        }
        if self.echo.contains(&port) {
            if let Some(value) = self.last_written.get(&port) {
                return value & mask;
            }
        }
        self.fixed.get(&port).copied().unwrap_or(u32::MAX) & mask
    }

    fn write(&mut self, port: u16, value: u32) {
        if port == DELAY_PORT {
            return;
        }
        if port == PCI_ADDRESS_PORT {
            self.pci_address = value;
        } else if port == PCI_DATA_PORT {
            self.write_pci(value);
        }
        self.last_written.insert(port, value);
        self.writes.push((port, value));
    }

    fn pci_slot(&mut self) -> Option<(&mut [u32; 64], usize)> {
        if self.pci_address & 0x8000_0000 == 0 {
            return None;
        }
        let key = self.pci_address & 0x00ff_ff00;
        let index = (self.pci_address & 0xfc) as usize / 4;
        self.pci_functions.get_mut(&key).map(|space| (space, index))
    }

    fn read_pci(&mut self) -> u32 {
        self.pci_slot()
            .map_or(u32::MAX, |(space, index)| space[index])
    }

    fn write_pci(&mut self, value: u32) {
        if let Some((space, index)) = self.pci_slot() {
            space[index] = value;
        }
    }
}

fn pci_function_key(bus: u8, device: u8, function: u8) -> u32 {
    (u32::from(bus) << 16) | (u32::from(device) << 11) | (u32::from(function) << 8)
}

impl PortIo for FakePorts {
    fn read_u8(&mut self, port: u16) -> u8 {
        self.read(port, 0xff) as u8
    }

    fn write_u8(&mut self, port: u16, value: u8) {
        self.write(port, value.into());
    }

    fn read_u16(&mut self, port: u16) -> u16 {
        self.read(port, 0xffff) as u16
    }

    fn write_u16(&mut self, port: u16, value: u16) {
        self.write(port, value.into());
    }

    fn read_u32(&mut self, port: u16) -> u32 {
        self.read(port, u32::MAX)
    }

    fn write_u32(&mut self, port: u16, value: u32) {
        self.write(port, value);
    }
}

/// Runs `f` with a freshly initialized heap over a `size`-byte arena.
pub fn with_heap<F, R>(size: usize, f: F) -> R
where
    F: FnOnce(&Heap) -> R,
{
    let layout = Layout::from_size_align(size, ALIGNMENT).unwrap();
    unsafe {
        let start = alloc::alloc(layout);
        let heap = Heap::new();
        heap.init(start, size).unwrap();
        let result = f(&heap);
        alloc::dealloc(start, layout);
        result
    }
}

/// Builds the first 16 configuration registers of a type 0 PCI function.
pub fn pci_header(
    vendor_id: u16,
    device_id: u16,
    class: u8,
    subclass: u8,
    prog_if: u8,
    header_type: u8,
) -> [u32; 16] {
    let mut header = [0; 16];
    header[0] = (u32::from(device_id) << 16) | u32::from(vendor_id);
    header[2] = (u32::from(class) << 24) | (u32::from(subclass) << 16) | (u32::from(prog_if) << 8);
    header[3] = u32::from(header_type) << 16;
    header
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_precedence() {
        let mut ports = FakePorts::new();
        assert_eq!(ports.read_u8(0x10), 0xff);

        ports.set(0x10, 0x12).script(0x10, &[1, 2]).echo(0x11);
        assert_eq!(ports.read_u8(0x10), 1);
        assert_eq!(ports.read_u8(0x10), 2);
        assert_eq!(ports.read_u8(0x10), 0x12);

        ports.write_u8(0x11, 0x5a);
        ports.io_delay(3);
        assert_eq!(ports.read_u8(0x11), 0x5a);
        assert_eq!(ports.writes(), [(0x11_u16, 0x5a_u32)]);
    }

    #[test]
    fn test_pci_configuration_space() {
        let mut ports = FakePorts::new();
        ports.add_pci_function(0, 3, 0, pci_header(0x8086, 0x100e, 0x02, 0x00, 0, 0));

        ports.write_u32(PCI_ADDRESS_PORT, 0x8000_1800);
        assert_eq!(ports.read_u32(PCI_DATA_PORT), 0x100e_8086);
        ports.write_u32(PCI_ADDRESS_PORT, 0x8000_1000);
        assert_eq!(ports.read_u32(PCI_DATA_PORT), u32::MAX);

        ports.write_u32(PCI_ADDRESS_PORT, 0x8000_180c);
        ports.write_u32(PCI_DATA_PORT, 0x4000_0000);
        assert_eq!(ports.pci_register(0, 3, 0, 0x0c), Some(0x4000_0000));
    }
}
