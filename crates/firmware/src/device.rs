//! Device records and the bring-up sequencer.
//!
//! Every piece of hardware the firmware touches is described by a [`Device`]
//! record allocated from the firmware heap. A driver implementing
//! [`Initialize`] probes the hardware and reports a [`DeviceStatus`];
//! [`initialize`] records the outcome, logs it and decides whether the boot
//! can go on.

use allocator::block_list::HeapError;
use derive_more::{Display, IsVariant};
use snafu::{ResultExt as _, Snafu, ensure};

use crate::{
    drivers::{
        cmos::CmosData, kbdctl::KbdctlConfig, pci::PciDeviceData, pic::PicConfig,
        pit::PitConfig, serial::UartConfig,
    },
    error::{self, Location},
    heap::{Heap, HeapBox, HeapVec},
};

/// Lifecycle state of a device.
///
/// ```text
/// Unknown ──┬─> NotPresent
///           └─> Present ──┬─> Faulty
///                         └─> Initialised
/// ```
///
/// A driver may report a final state directly from `Unknown`; passing through
/// `Present` is implied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, IsVariant)]
pub enum DeviceStatus {
    #[default]
    #[display("unknown")]
    Unknown,
    #[display("not present")]
    NotPresent,
    #[display("present")]
    Present,
    #[display("faulty")]
    Faulty,
    #[display("initialised")]
    Initialised,
}

impl DeviceStatus {
    /// Returns `true` if a device in this state may move to `next`.
    #[must_use]
    pub fn can_become(self, next: Self) -> bool {
        match self {
            Self::Unknown => next != Self::Unknown,
            Self::Present => matches!(next, Self::Faulty | Self::Initialised),
            Self::NotPresent | Self::Faulty | Self::Initialised => false,
        }
    }
}

/// How the CPU reaches a device's registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
pub enum DeviceAccess {
    #[default]
    #[display("pio")]
    Pio,
    #[display("mmio")]
    Mmio,
    #[display("bridge")]
    Bridge,
}

/// Driver-specific state kept with a device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IsVariant)]
pub enum DeviceData {
    Uart(UartConfig),
    Pic(PicConfig),
    Pit(PitConfig),
    Kbdctl(KbdctlConfig),
    Cmos(CmosData),
    Pci(PciDeviceData),
}

#[derive(Debug)]
pub struct Device<'h> {
    pub name: &'static str,
    pub status: DeviceStatus,
    pub access: DeviceAccess,
    pub data: Option<HeapBox<'h, DeviceData>>,
}

impl<'h> Device<'h> {
    #[must_use]
    pub fn new(name: &'static str, access: DeviceAccess) -> Self {
        Self {
            name,
            status: DeviceStatus::Unknown,
            access,
            data: None,
        }
    }

    /// Stores `data` on the heap and attaches it to the record, replacing any
    /// previous payload.
    pub fn attach(&mut self, heap: &'h Heap, data: DeviceData) -> Result<(), HeapError> {
        self.data = Some(HeapBox::new(heap, data)?);
        Ok(())
    }

    /// Attaches the payload of a successfully configured device.
    ///
    /// Returns [`DeviceStatus::Initialised`], or [`DeviceStatus::Faulty`] if
    /// the payload does not fit on the heap. A corrupted heap is fatal.
    #[track_caller]
    pub fn complete(&mut self, heap: &'h Heap, data: DeviceData) -> DeviceStatus {
        match self.attach(heap, data) {
            Ok(()) => DeviceStatus::Initialised,
            Err(err) if err.is_fatal() => error::report(err),
            Err(err) => {
                error!("{}: cannot store device data: {err}", self.name);
                DeviceStatus::Faulty
            }
        }
    }

    #[must_use]
    pub fn data(&self) -> Option<&DeviceData> {
        self.data.as_deref()
    }
}

/// Hardware bring-up for one kind of device.
pub trait Initialize<'h> {
    /// Probes and configures the hardware behind `device`.
    ///
    /// Drivers attach their payload to `device` and return the resulting
    /// state. They must not change `device.status` themselves.
    fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus;
}

#[derive(Debug, Snafu)]
pub enum DeviceInitError {
    #[snafu(display("critical device {name} is {status}"))]
    CriticalDevice {
        name: &'static str,
        status: DeviceStatus,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("failed to allocate the record for {name}"))]
    AllocateRecord {
        name: &'static str,
        #[snafu(source)]
        source: HeapError,
        #[snafu(implicit)]
        location: Location,
    },
}

/// Runs `driver` against `device` and records the outcome.
///
/// Anything but [`DeviceStatus::Initialised`] is logged as a failure. A failed
/// `critical` device is returned as [`DeviceInitError::CriticalDevice`];
/// other failures leave the device unavailable and return its status.
#[track_caller]
pub fn initialize<'h>(
    heap: &'h Heap,
    driver: &mut dyn Initialize<'h>,
    device: &mut Device<'h>,
    name: &'static str,
    critical: bool,
) -> Result<DeviceStatus, DeviceInitError> {
    info!("Initializing {name}...");
    device.name = name;
    let previous = device.status;
    let mut status = driver.init(heap, device);
    if !previous.can_become(status) {
        warn!("{name}: driver reported {status} while {previous}");
        status = DeviceStatus::Faulty;
    }
    device.status = status;

    if status.is_initialised() {
        info!("{name}: ok");
        return Ok(status);
    }
    warn!("{name}: failed ({status})");
    ensure!(!critical, CriticalDeviceSnafu { name, status });
    Ok(status)
}

/// The devices brought up so far.
///
/// Both the list and every record live on the firmware heap.
#[derive(Debug)]
pub struct DeviceList<'h> {
    heap: &'h Heap,
    devices: HeapVec<'h, HeapBox<'h, Device<'h>>>,
}

impl<'h> DeviceList<'h> {
    #[must_use]
    pub fn new(heap: &'h Heap) -> Self {
        Self {
            heap,
            devices: HeapVec::new(heap),
        }
    }

    /// Allocates a record for `name`, runs the sequencer on it and keeps it.
    ///
    /// The record is kept whatever the outcome, except for a critical failure.
    #[track_caller]
    pub fn initialize(
        &mut self,
        driver: &mut dyn Initialize<'h>,
        name: &'static str,
        access: DeviceAccess,
        critical: bool,
    ) -> Result<DeviceStatus, DeviceInitError> {
        let mut device = HeapBox::new(self.heap, Device::new(name, access))
            .context(AllocateRecordSnafu { name })?;
        let status = initialize(self.heap, driver, &mut device, name, critical)?;
        self.devices
            .push(device)
            .context(AllocateRecordSnafu { name })?;
        Ok(status)
    }

    pub fn push(&mut self, device: HeapBox<'h, Device<'h>>) -> Result<(), HeapError> {
        self.devices.push(device)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device<'h>> {
        self.devices.iter().map(|device| &**device)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Device<'h>> {
        self.devices.iter_mut().map(|device| &mut **device)
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&Device<'h>> {
        self.iter().find(|device| device.name == name)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.devices.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::with_heap;

    struct Fixed(DeviceStatus);

    impl<'h> Initialize<'h> for Fixed {
        fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus {
            if self.0.is_initialised() {
                device
                    .attach(heap, DeviceData::Pit(PitConfig { reload: 7 }))
                    .unwrap();
            }
            self.0
        }
    }

    struct Complete;

    impl<'h> Initialize<'h> for Complete {
        fn init(&mut self, heap: &'h Heap, device: &mut Device<'h>) -> DeviceStatus {
            device.complete(heap, DeviceData::Pit(PitConfig { reload: 7 }))
        }
    }

    #[test]
    fn test_transition_table() {
        use DeviceStatus as S;
        assert!(S::Unknown.can_become(S::Present));
        assert!(S::Unknown.can_become(S::NotPresent));
        assert!(S::Unknown.can_become(S::Initialised));
        assert!(!S::Unknown.can_become(S::Unknown));
        assert!(S::Present.can_become(S::Faulty));
        assert!(!S::Present.can_become(S::NotPresent));
        assert!(!S::Initialised.can_become(S::Faulty));
        assert!(!S::NotPresent.can_become(S::Present));
    }

    #[test]
    fn test_initialize_records_status_and_name() {
        with_heap(4096, |heap| {
            let mut device = Device::new("", DeviceAccess::Pio);
            let status = initialize(
                heap,
                &mut Fixed(DeviceStatus::Initialised),
                &mut device,
                "825X/PIT",
                true,
            )
            .unwrap();
            assert_eq!(status, DeviceStatus::Initialised);
            assert_eq!(device.name, "825X/PIT");
            assert_eq!(device.status, DeviceStatus::Initialised);
            assert_eq!(
                device.data(),
                Some(&DeviceData::Pit(PitConfig { reload: 7 }))
            );
        });
    }

    #[test]
    fn test_non_critical_failure_continues() {
        with_heap(4096, |heap| {
            let mut device = Device::new("", DeviceAccess::Pio);
            let status = initialize(
                heap,
                &mut Fixed(DeviceStatus::NotPresent),
                &mut device,
                "8042/PS2",
                false,
            )
            .unwrap();
            assert_eq!(status, DeviceStatus::NotPresent);
            assert!(device.data.is_none());
        });
    }

    #[test]
    fn test_critical_failure_is_an_error() {
        with_heap(4096, |heap| {
            let mut device = Device::new("", DeviceAccess::Pio);
            let err = initialize(
                heap,
                &mut Fixed(DeviceStatus::Faulty),
                &mut device,
                "8259/PIC",
                true,
            )
            .unwrap_err();
            assert!(matches!(
                err,
                DeviceInitError::CriticalDevice {
                    name: "8259/PIC",
                    status: DeviceStatus::Faulty,
                    ..
                }
            ));
            assert_eq!(err.to_string(), "critical device 8259/PIC is faulty");
            assert_eq!(device.status, DeviceStatus::Faulty);
        });
    }

    #[test]
    fn test_invalid_report_becomes_faulty() {
        with_heap(4096, |heap| {
            let mut device = Device::new("", DeviceAccess::Pio);
            let status = initialize(
                heap,
                &mut Fixed(DeviceStatus::Unknown),
                &mut device,
                "UART 1",
                false,
            )
            .unwrap();
            assert_eq!(status, DeviceStatus::Faulty);
        });
    }

    #[test]
    fn test_payload_out_of_memory_is_faulty() {
        with_heap(64, |heap| {
            let _hog = heap.malloc(32).unwrap();
            let mut device = Device::new("", DeviceAccess::Pio);
            let status = initialize(heap, &mut Complete, &mut device, "825X/PIT", false).unwrap();
            assert_eq!(status, DeviceStatus::Faulty);
            assert!(device.data.is_none());
        });
    }

    #[test]
    #[should_panic(expected = "heap corruption detected")]
    fn test_corrupted_heap_halts_bring_up() {
        with_heap(4096, |heap| {
            let a = heap.malloc(32).unwrap();
            // Overrun `a` into the tag of the free block behind it.
            unsafe {
                a.as_ptr().add(32).cast::<u64>().write_unaligned(0xdead_beef);
            }
            let mut device = Device::new("", DeviceAccess::Pio);
            let _ = initialize(heap, &mut Complete, &mut device, "825X/PIT", false);
        });
    }

    #[test]
    fn test_device_list_keeps_records_on_heap() {
        with_heap(8192, |heap| {
            let mut devices = DeviceList::new(heap);
            let names = ["a", "b", "c", "d", "e", "f"];
            for (i, name) in names.into_iter().enumerate() {
                let status = if i % 2 == 0 {
                    DeviceStatus::Initialised
                } else {
                    DeviceStatus::NotPresent
                };
                devices
                    .initialize(&mut Fixed(status), name, DeviceAccess::Pio, false)
                    .unwrap();
            }
            assert_eq!(devices.len(), 6);
            assert_eq!(devices.find("c").unwrap().status, DeviceStatus::Initialised);
            assert_eq!(devices.find("d").unwrap().status, DeviceStatus::NotPresent);
            assert!(devices.find("z").is_none());
            assert!(devices.iter().map(|d| d.name).eq(names));
            heap.check().unwrap();

            drop(devices);
            assert_eq!(heap.stats().used, 0);
        });
    }

    #[test]
    fn test_device_list_out_of_memory() {
        with_heap(64, |heap| {
            let mut devices = DeviceList::new(heap);
            let err = devices
                .initialize(
                    &mut Fixed(DeviceStatus::Initialised),
                    "big",
                    DeviceAccess::Pio,
                    false,
                )
                .unwrap_err();
            assert!(matches!(err, DeviceInitError::AllocateRecord { .. }));
        });
    }
}
