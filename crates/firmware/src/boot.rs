//! Chipset bring-up.
//!
//! [`bring_up`] walks the legacy devices of a PC in a fixed order, then
//! enumerates PCI and probes the IDE controllers found there. The bare-metal
//! entry point wires it to the real port space and halts once it is done.

use allocator::block_list::HeapError;
use snafu::{ResultExt as _, Snafu};

use crate::{
    config::{BootConfig, COM1_PORT, CriticalDevices, FIRMWARE_NAME, FIRMWARE_VERSION},
    console::{self, ByteSink},
    device::{DeviceAccess, DeviceData, DeviceInitError, DeviceList},
    drivers::{
        ata::{self, IdeController},
        cmos::Cmos,
        kbdctl::Kbdctl,
        pci::{self, PciError},
        pic::Pic,
        pit::Pit,
        serial::Uart,
    },
    error::Location,
    heap::{Heap, HeapVec},
    io::PortIo,
};

#[derive(Debug, Snafu)]
pub enum BootError {
    #[snafu(display("legacy device bring-up failed"))]
    LegacyDevice {
        #[snafu(source)]
        source: DeviceInitError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("PCI enumeration failed"))]
    PciEnumeration {
        #[snafu(source)]
        source: PciError,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to record ATA controllers"))]
    AtaScan {
        #[snafu(source)]
        source: HeapError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Everything bring-up found.
#[derive(Debug)]
pub struct Platform<'h> {
    /// Legacy devices in bring-up order.
    pub devices: DeviceList<'h>,
    /// One record per PCI function.
    pub pci: DeviceList<'h>,
    pub ide: HeapVec<'h, IdeController<'h>>,
}

impl Platform<'_> {
    /// Logs the PCI device tree and the drives found.
    pub fn log_summary(&self) {
        for device in self.pci.iter() {
            let Some(DeviceData::Pci(data)) = device.data() else {
                continue;
            };
            let indent = if data.address.bus == 0 { "" } else { "  " };
            info!(
                "{indent}{} [{:04x}:{:04x}] {} ({})",
                data.address, data.vendor_id, data.device_id, device.name, device.access
            );
        }
        for controller in self.ide.iter() {
            for bus in &controller.buses {
                for drive in bus.drives.iter().flatten() {
                    info!(
                        "ATA {:#x} {}: {} {}",
                        bus.base, drive.position, drive.kind, drive.model
                    );
                }
            }
        }
    }
}

/// Brings up the chipset behind `ports`.
///
/// `console` is installed as soon as the UART works, so every later message
/// reaches it.
pub fn bring_up<'h, P>(
    heap: &'h Heap,
    ports: &mut P,
    config: &BootConfig,
    console: Option<&'static dyn ByteSink>,
) -> Result<Platform<'h>, BootError>
where
    P: PortIo,
{
    let critical = config.critical;
    let mut devices = DeviceList::new(heap);

    let uart = devices
        .initialize(
            &mut Uart::new(&mut *ports, COM1_PORT, config.uart_divisor()),
            "UART 1",
            DeviceAccess::Pio,
            critical.contains(CriticalDevices::UART),
        )
        .context(LegacyDeviceSnafu)?;
    if let Some(sink) = console.filter(|_| uart.is_initialised()) {
        console::install(sink);
    }
    info!("{FIRMWARE_NAME} {FIRMWARE_VERSION}");
    if uart.is_initialised() {
        info!(
            "Default output device: UART 1 at {COM1_PORT:#x} with {} baud",
            config.baud_rate
        );
    }

    devices
        .initialize(
            &mut Pic::new(&mut *ports),
            "8259/PIC",
            DeviceAccess::Pio,
            critical.contains(CriticalDevices::PIC),
        )
        .context(LegacyDeviceSnafu)?;
    devices
        .initialize(
            &mut Cmos::new(&mut *ports),
            "CMOS/RTC",
            DeviceAccess::Pio,
            critical.contains(CriticalDevices::CMOS),
        )
        .context(LegacyDeviceSnafu)?;
    devices
        .initialize(
            &mut Kbdctl::new(&mut *ports),
            "8042/PS2",
            DeviceAccess::Pio,
            critical.contains(CriticalDevices::KBDCTL),
        )
        .context(LegacyDeviceSnafu)?;
    devices
        .initialize(
            &mut Pit::new(&mut *ports, config.pit_reload),
            "825X/PIT",
            DeviceAccess::Pio,
            critical.contains(CriticalDevices::PIT),
        )
        .context(LegacyDeviceSnafu)?;

    let mut pci = DeviceList::new(heap);
    pci::enumerate(heap, &mut *ports, &mut pci).context(PciEnumerationSnafu)?;
    let ide = ata::scan_controllers(heap, &mut *ports, &mut pci).context(AtaScanSnafu)?;

    let platform = Platform { devices, pci, ide };
    platform.log_summary();
    Ok(platform)
}

#[cfg(target_os = "none")]
mod entry {
    use allocator::block_list::HeapError;

    use super::bring_up;
    use crate::{
        config::{BootConfig, COM1_PORT},
        console::ByteSink,
        diagnostics,
        drivers::serial::{SerialConsole, SerialPort},
        error,
        heap::Heap,
        io::X86Ports,
        log,
    };

    #[global_allocator]
    static HEAP: Heap = Heap::new();

    static CONSOLE: SerialConsole<X86Ports> =
        SerialConsole::new(SerialPort::new(unsafe { X86Ports::new() }, COM1_PORT));

    fn init_heap(config: &BootConfig) -> Result<(), HeapError> {
        HEAP.set_split_factor(config.split_factor);
        let start = core::ptr::with_exposed_provenance_mut(config.heap_start);
        // The region is RAM reserved for the heap on every supported board.
        unsafe { HEAP.init(start, config.heap_size) }
    }

    /// Entered from the reset stub once a stack is set up.
    #[unsafe(export_name = "c_main")]
    extern "C" fn firmware_main() -> ! {
        let config = BootConfig::default();
        log::set_max_level(config.log_level);
        if let Err(err) = init_heap(&config) {
            error::report(err);
        }

        let console: &'static dyn ByteSink = &CONSOLE;
        let mut ports = unsafe { X86Ports::new() };
        match bring_up(&HEAP, &mut ports, &config, Some(console)) {
            Ok(_platform) => info!("Early chipset initialisation done, halt"),
            Err(err) => error::report(err),
        }
        diagnostics::halt()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        device::DeviceStatus,
        drivers::ata::DriveKind,
        testing::{FakePorts, pci_header, with_heap},
    };

    /// Legacy devices answering the way QEMU's i440FX machine does.
    fn legacy_ports() -> FakePorts {
        let mut ports = FakePorts::new();
        ports
            // UART line status: transmitter idle
            .set(0x3fd, 0x60)
            // PIC masks read back, ELCR clear
            .echo(0x21)
            .echo(0xa1)
            .set(0x4d0, 0x00)
            .set(0x4d1, 0x00)
            // RTC: status A, month, month, status B
            .script(0x71, &[0x00, 0x03, 0x03, 0x02])
            // 8042: config, config readback, self test
            .set(0x64, 0x01)
            .script(0x60, &[0x67, 0x24, 0x55])
            // PIT read-back status
            .script(0x40, &[0x34]);
        ports
    }

    #[test]
    fn test_bring_up_legacy_and_pci() {
        with_heap(64 * 1024, |heap| {
            let mut ports = legacy_ports();
            ports.add_pci_function(0, 0, 0, pci_header(0x8086, 0x1237, 0x06, 0x00, 0, 0));
            ports.add_pci_function(0, 1, 0, pci_header(0x8086, 0x7000, 0x06, 0x01, 0, 0x80));
            ports.add_pci_function(0, 1, 1, pci_header(0x8086, 0x7010, 0x01, 0x01, 0x8a, 0));
            ports.add_pci_function(0, 3, 0, pci_header(0x8086, 0x100e, 0x02, 0x00, 0, 0));

            let config = BootConfig::default();
            let platform = bring_up(heap, &mut ports, &config, None).unwrap();

            let names: Vec<_> = platform.devices.iter().map(|d| d.name).collect();
            assert_eq!(names, ["UART 1", "8259/PIC", "CMOS/RTC", "8042/PS2", "825X/PIT"]);
            assert!(platform.devices.iter().all(|d| d.status.is_initialised()));
            assert!(matches!(
                platform.devices.find("UART 1").unwrap().data(),
                Some(DeviceData::Uart(uart)) if uart.divisor == 3
            ));

            assert_eq!(platform.pci.len(), 4);
            assert_eq!(platform.ide.len(), 1);
            assert!(platform.ide[0].buses.is_empty());
            heap.check().unwrap();
        });
    }

    #[test]
    fn test_bring_up_with_missing_devices() {
        with_heap(16 * 1024, |heap| {
            let mut ports = FakePorts::new();
            let config = BootConfig::default();
            let platform = bring_up(heap, &mut ports, &config, None).unwrap();

            assert_eq!(platform.devices.len(), 5);
            assert_eq!(
                platform.devices.find("UART 1").unwrap().status,
                DeviceStatus::NotPresent
            );
            assert!(platform.pci.is_empty());
            assert!(platform.ide.is_empty());
        });
    }

    #[test]
    fn test_critical_device_stops_bring_up() {
        with_heap(16 * 1024, |heap| {
            let mut ports = FakePorts::new();
            // UART present, PIC mask readback wrong
            ports.set(0x3fd, 0x60).set(0x21, 0x12).set(0xa1, 0xff);
            let config = BootConfig {
                critical: CriticalDevices::UART | CriticalDevices::PIC,
                ..BootConfig::default()
            };
            let err = bring_up(heap, &mut ports, &config, None).unwrap_err();
            let BootError::LegacyDevice { source, .. } = &err else {
                panic!("unexpected error: {err}");
            };
            assert_eq!(source.to_string(), "critical device 8259/PIC is faulty");
            // Nothing past the PIC was touched
            assert!(ports.writes_to(0x70).is_empty());
        });
    }

    #[test]
    fn test_ide_drives_are_probed() {
        with_heap(64 * 1024, |heap| {
            let mut ports = legacy_ports();
            ports.add_pci_function(0, 0, 0, pci_header(0x8086, 0x1237, 0x06, 0x00, 0, 0));
            ports.add_pci_function(0, 1, 0, pci_header(0x8086, 0x7000, 0x06, 0x01, 0, 0x80));
            ports.add_pci_function(0, 1, 1, pci_header(0x8086, 0x7010, 0x01, 0x01, 0x80, 0));
            // Secondary bus: ATAPI master, empty slave; the others float
            ports
                .script(0x177, &[0x00, 0x41, 0x00])
                .script(0x174, &[0x14])
                .script(0x175, &[0xeb]);

            let platform = bring_up(heap, &mut ports, &BootConfig::default(), None).unwrap();
            assert_eq!(platform.pci.len(), 3);
            assert_eq!(platform.ide.len(), 1);
            let buses = &platform.ide[0].buses;
            assert_eq!(buses.len(), 1);
            assert_eq!(buses[0].base, 0x170);
            let drive = buses[0].drives[0].as_ref().unwrap();
            assert_eq!(drive.kind, DriveKind::Atapi);
        });
    }
}
