//! FX3 device facade
//!
//! Opens the streaming device, claims the interface of the selected
//! endpoint and exposes the control-path operations. Descriptors are read
//! through rusb during discovery; the opened session (claim, vendor
//! requests, bulk streaming) runs on nusb. Every operation reports a
//! [`DeviceError`] instead of panicking.

use crate::config::HostConfig;
use crate::stream::StreamController;
use crate::usb::endpoints::{
    EndpointParams, EndpointSelection, configure, endpoint_params_by_index, link_speed,
    read_endpoints,
};
use crate::usb::integrity::LinkIntegrityChecker;
use crate::usb::scanner::{DeviceScanner, FirmwareLoader, ScanReport};
use crate::usb::transfers::BulkTransport;
use common::{DeviceError, EventBus};
use nusb::MaybeFuture;
use nusb::transfer::{ControlIn, ControlOut, ControlType, Recipient};
use processor::DataProcessor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Vendor request writing one SPI register (`wValue` data, `wIndex` address)
pub const SPI_WRITE_REQUEST: u8 = 0xB3;
/// Vendor request reading one SPI register (`wIndex` address)
pub const SPI_READ_REQUEST: u8 = 0xB5;
/// Vendor request resetting the device-side streaming logic
pub const RESET_REQUEST: u8 = 0xB1;

const CONTROL_TIMEOUT: Duration = Duration::from_millis(1000);

fn vendor_out(request: u8, value: u16, index: u16) -> ControlOut<'static> {
    ControlOut {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request,
        value,
        index,
        data: &[],
    }
}

fn vendor_in(request: u8, value: u16, index: u16, length: u16) -> ControlIn {
    ControlIn {
        control_type: ControlType::Vendor,
        recipient: Recipient::Device,
        request,
        value,
        index,
        length,
    }
}

/// An opened device with its chosen streaming endpoint
struct OpenDevice {
    bus: u8,
    address: u8,
    // Keeps the device open for as long as the interface is claimed
    _handle: nusb::Device,
    interface: nusb::Interface,
    endpoints: Vec<EndpointParams>,
    selection: EndpointSelection,
}

pub struct Fx3Device {
    config: HostConfig,
    events: EventBus,
    loader: Option<Box<dyn FirmwareLoader>>,
    open: Option<OpenDevice>,
    controller: StreamController,
}

impl Fx3Device {
    pub fn new(config: HostConfig, events: EventBus) -> Self {
        let processor = Arc::new(Mutex::new(DataProcessor::new(
            events.clone(),
            &config.processing.pipeline,
        )));
        let integrity = Arc::new(LinkIntegrityChecker::new(
            config.thresholds.integrity_window,
            config.thresholds.integrity_gap_ratio,
        ));
        let controller = StreamController::new(
            events.clone(),
            processor,
            integrity,
            config.stream.options(),
        );

        Self {
            config,
            events,
            loader: None,
            open: None,
            controller,
        }
    }

    /// Firmware loader consulted when only boot-image devices are present
    pub fn with_loader(mut self, loader: Box<dyn FirmwareLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    fn scanner(&self) -> Result<DeviceScanner, DeviceError> {
        Ok(DeviceScanner::new(self.config.usb.identity())?.with_rescan(
            self.config.usb.rescan_attempts,
            Duration::from_millis(self.config.usb.rescan_delay_ms),
        ))
    }

    /// Count attached devices per firmware state
    pub fn scan(&self) -> Result<ScanReport, DeviceError> {
        self.scanner()?.scan()
    }

    /// Open a streaming device and select its streaming endpoint
    ///
    /// Opening an already open device is a no-op.
    pub fn open_device(&mut self) -> Result<(), DeviceError> {
        if self.open.is_some() {
            return Ok(());
        }

        let scanner = self.scanner()?;
        let (device, handle) = scanner.open_streaming(self.loader.as_deref())?;

        let endpoints = read_endpoints(&device)?;
        let speed = link_speed(&device);
        let selection = configure(&endpoints, speed, self.config.stream.ppx)?;

        let interface_number = selection.endpoint.interface;
        let interface = handle
            .detach_and_claim_interface(interface_number)
            .wait()
            .map_err(|e| {
                warn!("Failed to claim interface {}: {}", interface_number, e);
                DeviceError::BadDevice
            })?;
        debug!("Claimed interface {}", interface_number);

        let message = format!(
            "Opened device {:03}:{:03} ({:?}), endpoint {:#04x} ({:?}), transfer size {} x {}",
            device.bus_number(),
            device.address(),
            selection.speed,
            selection.endpoint.address,
            selection.endpoint.kind,
            selection.transfer_size,
            selection.ppx
        );
        info!("{}", message);
        self.events.message(message);

        self.open = Some(OpenDevice {
            bus: device.bus_number(),
            address: device.address(),
            _handle: handle,
            interface,
            endpoints,
            selection,
        });
        Ok(())
    }

    /// Stop streaming, release the claimed interface and close the device
    pub fn close_device(&mut self) -> Result<(), DeviceError> {
        self.controller.stop()?;

        let Some(open) = self.open.take() else {
            return Ok(());
        };

        // The streaming thread has been joined, so nothing else holds the
        // interface; dropping it releases the claim.
        let OpenDevice {
            bus,
            address,
            interface,
            selection,
            ..
        } = open;
        drop(interface);
        debug!("Released interface {}", selection.endpoint.interface);

        info!("Closed device {:03}:{:03}", bus, address);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    fn interface(&self) -> Result<&nusb::Interface, DeviceError> {
        self.open
            .as_ref()
            .map(|open| &open.interface)
            .ok_or(DeviceError::NoDeviceFound)
    }

    /// Write one SPI register through the device's vendor request
    pub fn write_spi(&self, address: u8, data: u8) -> Result<(), DeviceError> {
        let interface = self.interface()?;
        interface
            .control_out(
                vendor_out(SPI_WRITE_REQUEST, u16::from(data), u16::from(address)),
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| {
                warn!("SPI write to {:#04x} failed: {}", address, e);
                DeviceError::RegisterWriteFail
            })?;
        debug!("SPI write {:#04x} <- {:#04x}", address, data);
        Ok(())
    }

    /// Read one SPI register through the device's vendor request
    pub fn read_spi(&self, address: u8) -> Result<u8, DeviceError> {
        let interface = self.interface()?;
        let data = interface
            .control_in(
                vendor_in(SPI_READ_REQUEST, 0, u16::from(address), 1),
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| {
                warn!("SPI read from {:#04x} failed: {}", address, e);
                DeviceError::ControlTransferFail
            })?;

        let &[value] = data.as_slice() else {
            warn!("SPI read from {:#04x} returned {} bytes", address, data.len());
            return Err(DeviceError::ControlTransferFail);
        };
        debug!("SPI read {:#04x} -> {:#04x}", address, value);
        Ok(value)
    }

    /// Reset the device-side logic; does not touch the streaming session
    pub fn reset(&self) -> Result<(), DeviceError> {
        let interface = self.interface()?;
        interface
            .control_out(vendor_out(RESET_REQUEST, 0, 0), CONTROL_TIMEOUT)
            .wait()
            .map_err(|e| {
                warn!("Device reset failed: {}", e);
                DeviceError::ControlTransferFail
            })?;
        info!("Device reset");
        Ok(())
    }

    /// Start (`true`) or stop (`false`) streaming from the selected endpoint
    pub fn start_stop(&mut self, start: bool) -> Result<(), DeviceError> {
        if !start {
            return self.controller.stop();
        }

        let open = self.open.as_ref().ok_or(DeviceError::NoDeviceFound)?;
        let interface = open.interface.clone();
        let endpoint = open.selection.endpoint;
        let params = self.config.queue_params(open.selection.request_len());

        self.controller.start_stop(true, params, move || {
            BulkTransport::open(&interface, &endpoint)
        })
    }

    /// Endpoint record by discovery index
    pub fn endpoint_params(&self, index: usize) -> Result<EndpointParams, DeviceError> {
        let open = self.open.as_ref().ok_or(DeviceError::NoDeviceFound)?;
        endpoint_params_by_index(&open.endpoints, index)
    }

    pub fn endpoint_count(&self) -> usize {
        self.open.as_ref().map_or(0, |open| open.endpoints.len())
    }

    pub fn selection(&self) -> Option<&EndpointSelection> {
        self.open.as_ref().map(|open| &open.selection)
    }

    pub fn controller(&self) -> &StreamController {
        &self.controller
    }

    pub fn processor(&self) -> Arc<Mutex<DataProcessor>> {
        self.controller.processor()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }
}

impl Drop for Fx3Device {
    fn drop(&mut self) {
        let _ = self.close_device();
    }
}
