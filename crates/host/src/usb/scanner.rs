//! Device discovery and firmware state classification
//!
//! A device is a candidate when its vendor ID matches. Its product ID tells
//! whether it still runs the boot image (firmware must be loaded first) or
//! already runs the streaming image.

use common::DeviceError;
use nusb::MaybeFuture;
use rusb::{Context, Device, UsbContext};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Vendor ID shared by both firmware images
pub const VENDOR_ID: u16 = 0x1209;
/// Product ID of the streaming firmware image
pub const PRODUCT_STREAM: u16 = 0xF010;
/// Product ID of the boot loader
pub const PRODUCT_BOOT: u16 = 0x00F3;

/// Which image a candidate device is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FirmwareState {
    /// Boot loader; firmware must be loaded before streaming
    Boot,
    /// Streaming image
    Streaming,
}

/// Vendor/product identity the scanner matches against
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_stream: u16,
    pub product_boot: u16,
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            vendor_id: VENDOR_ID,
            product_stream: PRODUCT_STREAM,
            product_boot: PRODUCT_BOOT,
        }
    }
}

impl DeviceIdentity {
    pub fn classify(&self, vendor_id: u16, product_id: u16) -> Option<FirmwareState> {
        if vendor_id != self.vendor_id {
            return None;
        }
        if product_id == self.product_stream {
            Some(FirmwareState::Streaming)
        } else if product_id == self.product_boot {
            Some(FirmwareState::Boot)
        } else {
            None
        }
    }
}

/// Descriptor fields the scanner inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSummary {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub num_configurations: u8,
}

/// A matched device and its firmware state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FoundDevice {
    pub summary: DescriptorSummary,
    pub state: FirmwareState,
}

/// Counts of matched devices per firmware state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// Devices in the boot image that need firmware
    pub loadable: usize,
    /// Devices already running the streaming image
    pub streamable: usize,
}

/// Classify every summary against `identity`
///
/// Fails with `NoDeviceFound` when nothing matches and `BadDevice` when a
/// matched device reports no configurations.
pub fn classify_all(
    identity: &DeviceIdentity,
    summaries: impl IntoIterator<Item = DescriptorSummary>,
) -> Result<Vec<FoundDevice>, DeviceError> {
    let mut found = Vec::new();
    for summary in summaries {
        let Some(state) = identity.classify(summary.vendor_id, summary.product_id) else {
            continue;
        };
        if summary.num_configurations == 0 {
            warn!(
                "Device {:04x}:{:04x} at bus {} addr {} has no configurations",
                summary.vendor_id, summary.product_id, summary.bus, summary.address
            );
            return Err(DeviceError::BadDevice);
        }
        found.push(FoundDevice { summary, state });
    }

    if found.is_empty() {
        return Err(DeviceError::NoDeviceFound);
    }
    Ok(found)
}

/// Tally classified devices by firmware state
pub fn tally(found: &[FoundDevice]) -> ScanReport {
    found.iter().fold(ScanReport::default(), |mut report, dev| {
        match dev.state {
            FirmwareState::Boot => report.loadable += 1,
            FirmwareState::Streaming => report.streamable += 1,
        }
        report
    })
}

/// External collaborator that downloads the streaming image
///
/// The device is identified by its bus location; after a successful load it
/// re-enumerates with the streaming product ID.
pub trait FirmwareLoader: Send + Sync {
    fn load(&self, bus: u8, address: u8) -> Result<(), DeviceError>;
}

/// Scanner bound to one libusb context
pub struct DeviceScanner {
    context: Context,
    identity: DeviceIdentity,
    rescan_attempts: u32,
    rescan_delay: Duration,
}

impl DeviceScanner {
    pub fn new(identity: DeviceIdentity) -> Result<Self, DeviceError> {
        let context = Context::new().map_err(|e| {
            warn!("Failed to initialize libusb: {}", e);
            DeviceError::UsbInitFail
        })?;

        Ok(Self {
            context,
            identity,
            rescan_attempts: 10,
            rescan_delay: Duration::from_millis(500),
        })
    }

    /// Poll parameters used while waiting for re-enumeration after a load
    pub fn with_rescan(mut self, attempts: u32, delay: Duration) -> Self {
        self.rescan_attempts = attempts.max(1);
        self.rescan_delay = delay;
        self
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Count matched devices per firmware state
    pub fn scan(&self) -> Result<ScanReport, DeviceError> {
        let found = self.list()?;
        let report = tally(&found);
        debug!(
            "Scan: {} loadable, {} streamable",
            report.loadable, report.streamable
        );
        Ok(report)
    }

    /// Enumerate and classify matched devices
    pub fn list(&self) -> Result<Vec<FoundDevice>, DeviceError> {
        classify_all(&self.identity, self.summaries()?)
    }

    fn summaries(&self) -> Result<Vec<DescriptorSummary>, DeviceError> {
        let devices = self.context.devices().map_err(|e| {
            warn!("Failed to enumerate USB devices: {}", e);
            DeviceError::UsbInitFail
        })?;

        let mut summaries = Vec::new();
        for device in devices.iter() {
            match device.device_descriptor() {
                Ok(desc) => summaries.push(DescriptorSummary {
                    bus: device.bus_number(),
                    address: device.address(),
                    vendor_id: desc.vendor_id(),
                    product_id: desc.product_id(),
                    num_configurations: desc.num_configurations(),
                }),
                Err(e) => debug!(
                    "Skipping device at bus {} addr {}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                ),
            }
        }
        Ok(summaries)
    }

    /// Open the first streaming-capable device, loading firmware if needed
    pub fn open_streaming(
        &self,
        loader: Option<&dyn FirmwareLoader>,
    ) -> Result<(Device<Context>, nusb::Device), DeviceError> {
        let found = self.list()?;
        if let Some(dev) = found.iter().find(|d| d.state == FirmwareState::Streaming) {
            return self.open_at(dev.summary.bus, dev.summary.address);
        }

        let Some(loader) = loader else {
            warn!("Only boot-image devices present and no firmware loader configured");
            return Err(DeviceError::DriverNotImplemented);
        };

        for dev in found.iter().filter(|d| d.state == FirmwareState::Boot) {
            info!(
                "Loading firmware into device at bus {} addr {}",
                dev.summary.bus, dev.summary.address
            );
            loader.load(dev.summary.bus, dev.summary.address)?;
        }

        for attempt in 1..=self.rescan_attempts {
            std::thread::sleep(self.rescan_delay);
            match self.list() {
                Ok(found) => {
                    if let Some(dev) = found.iter().find(|d| d.state == FirmwareState::Streaming) {
                        info!("Streaming device appeared after {} rescans", attempt);
                        return self.open_at(dev.summary.bus, dev.summary.address);
                    }
                }
                Err(DeviceError::NoDeviceFound) => {
                    debug!("Rescan {}: device still re-enumerating", attempt);
                }
                Err(e) => return Err(e),
            }
        }

        Err(DeviceError::NoDeviceFound)
    }

    /// Open the device at `bus`/`address`
    ///
    /// The rusb device carries the descriptors; the nusb handle carries the
    /// session. The two are matched by identity and device address.
    fn open_at(
        &self,
        bus: u8,
        address: u8,
    ) -> Result<(Device<Context>, nusb::Device), DeviceError> {
        let devices = self.context.devices().map_err(|_| DeviceError::UsbInitFail)?;
        let device = devices
            .iter()
            .find(|d| d.bus_number() == bus && d.address() == address)
            .ok_or(DeviceError::NoDeviceFound)?;
        let desc = device.device_descriptor().map_err(|e| {
            warn!("Failed to read device descriptor: {}", e);
            DeviceError::BadDevice
        })?;

        let info = nusb::list_devices()
            .wait()
            .map_err(|e| {
                warn!("Failed to enumerate USB devices: {}", e);
                DeviceError::UsbInitFail
            })?
            .find(|info| {
                info.vendor_id() == desc.vendor_id()
                    && info.product_id() == desc.product_id()
                    && info.device_address() == address
            })
            .ok_or(DeviceError::NoDeviceFound)?;

        let handle = info.open().wait().map_err(|e| {
            warn!("Failed to open device: {}", e);
            DeviceError::BadDevice
        })?;

        debug!("Opened device at bus {} addr {}", bus, address);
        Ok((device, handle))
    }
}
