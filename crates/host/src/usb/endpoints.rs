//! Endpoint discovery and streaming parameter selection
//!
//! Reads the endpoint descriptors of the active configuration, picks the
//! first bulk or isochronous IN endpoint as the streaming endpoint and sizes
//! each transfer from the negotiated link speed.

use common::DeviceError;
use rusb::{Device, UsbContext};
use tracing::{debug, warn};

/// Largest single request in bytes (`TransferSize * PPX`)
pub const MAX_TRANSFER_LENGTH: usize = 0x40_0000;

/// SuperSpeed endpoint companion descriptor type
const SS_ENDPOINT_COMPANION: u8 = 0x30;

/// Endpoint transfer type (bmAttributes bits 0-1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointKind {
    pub fn from_attributes(attr: u8) -> Self {
        match attr & 0x03 {
            0 => EndpointKind::Control,
            1 => EndpointKind::Isochronous,
            2 => EndpointKind::Bulk,
            _ => EndpointKind::Interrupt,
        }
    }

    /// Whether this kind can carry the sample stream
    pub fn is_streaming(self) -> bool {
        matches!(self, EndpointKind::Bulk | EndpointKind::Isochronous)
    }
}

/// Negotiated link speed class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkSpeed {
    /// Low or full speed
    Full,
    /// USB 2.0 high speed
    High,
    /// USB 3.x SuperSpeed or faster
    Super,
}

impl LinkSpeed {
    pub fn is_high_speed(self) -> bool {
        self == LinkSpeed::High
    }

    pub fn is_super_speed(self) -> bool {
        self == LinkSpeed::Super
    }

    /// Default packets-per-transfer multiplier for this speed
    pub fn default_ppx(self) -> usize {
        match self {
            LinkSpeed::Super => 16,
            LinkSpeed::High => 64,
            LinkSpeed::Full => 8,
        }
    }
}

/// Map rusb device speed to the speed classes we size transfers for
pub fn map_link_speed(speed: rusb::Speed) -> LinkSpeed {
    match speed {
        rusb::Speed::Super | rusb::Speed::SuperPlus => LinkSpeed::Super,
        rusb::Speed::High => LinkSpeed::High,
        _ => LinkSpeed::Full,
    }
}

/// Attributes of one endpoint as recorded during discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointParams {
    pub kind: EndpointKind,
    pub is_in: bool,
    /// Raw wMaxPacketSize (bits 11-12 carry the high-bandwidth multiplier)
    pub max_packet_size: u16,
    /// Packets per burst (1 when no SuperSpeed companion is present)
    pub max_burst: u8,
    pub interface: u8,
    pub address: u8,
}

impl EndpointParams {
    /// Payload bytes per packet
    pub fn packet_bytes(&self) -> usize {
        usize::from(self.max_packet_size & 0x07FF)
    }

    /// Transactions per microframe for high-bandwidth endpoints
    pub fn transactions_per_microframe(&self) -> usize {
        usize::from((self.max_packet_size >> 11) & 0x03) + 1
    }

    /// Bytes of one base transfer unit at `speed`
    pub fn transfer_size(&self, speed: LinkSpeed) -> usize {
        match speed {
            LinkSpeed::Super => self.packet_bytes() * usize::from(self.max_burst.max(1)),
            LinkSpeed::High => self.packet_bytes() * self.transactions_per_microframe(),
            LinkSpeed::Full => self.packet_bytes(),
        }
    }
}

/// Streaming endpoint and transfer sizing chosen for a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSelection {
    /// Index into the discovered endpoint list
    pub index: usize,
    pub endpoint: EndpointParams,
    pub speed: LinkSpeed,
    pub transfer_size: usize,
    pub ppx: usize,
}

impl EndpointSelection {
    /// Bytes per queued request
    pub fn request_len(&self) -> usize {
        self.transfer_size * self.ppx
    }
}

/// Index of the first bulk or isochronous IN endpoint
pub fn select_active(endpoints: &[EndpointParams]) -> Result<usize, DeviceError> {
    endpoints
        .iter()
        .position(|ep| ep.is_in && ep.kind.is_streaming())
        .ok_or_else(|| {
            warn!("No bulk/isochronous IN endpoint among {} endpoints", endpoints.len());
            DeviceError::BadDevice
        })
}

/// Endpoint record by discovery index
pub fn endpoint_params_by_index(
    endpoints: &[EndpointParams],
    index: usize,
) -> Result<EndpointParams, DeviceError> {
    endpoints.get(index).copied().ok_or(DeviceError::BadDevice)
}

/// Select the streaming endpoint and size requests
///
/// `ppx` of `None` uses the speed default. PPX is reduced when a request
/// would exceed [`MAX_TRANSFER_LENGTH`].
pub fn configure(
    endpoints: &[EndpointParams],
    speed: LinkSpeed,
    ppx: Option<usize>,
) -> Result<EndpointSelection, DeviceError> {
    let index = select_active(endpoints)?;
    let endpoint = endpoints[index];

    let transfer_size = endpoint.transfer_size(speed);
    if transfer_size == 0 {
        warn!("Endpoint {:#04x} reports zero packet size", endpoint.address);
        return Err(DeviceError::BadDevice);
    }

    let requested = ppx.unwrap_or_else(|| speed.default_ppx()).max(1);
    let max_ppx = (MAX_TRANSFER_LENGTH / transfer_size).max(1);
    let ppx = if requested > max_ppx {
        warn!(
            "PPX {} exceeds maximum transfer length, using {}",
            requested, max_ppx
        );
        max_ppx
    } else {
        requested
    };

    debug!(
        "Streaming endpoint {:#04x} ({:?}, {:?}): transfer_size={}, ppx={}",
        endpoint.address, endpoint.kind, speed, transfer_size, ppx
    );

    Ok(EndpointSelection {
        index,
        endpoint,
        speed,
        transfer_size,
        ppx,
    })
}

/// Read every endpoint of the active configuration
pub fn read_endpoints<T: UsbContext>(device: &Device<T>) -> Result<Vec<EndpointParams>, DeviceError> {
    let config = device.active_config_descriptor().map_err(|e| {
        warn!("Failed to get active config descriptor: {}", e);
        DeviceError::BadDevice
    })?;

    let mut endpoints = Vec::new();
    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            for ep in alt.endpoint_descriptors() {
                let params = EndpointParams {
                    kind: match ep.transfer_type() {
                        rusb::TransferType::Control => EndpointKind::Control,
                        rusb::TransferType::Isochronous => EndpointKind::Isochronous,
                        rusb::TransferType::Bulk => EndpointKind::Bulk,
                        rusb::TransferType::Interrupt => EndpointKind::Interrupt,
                    },
                    is_in: ep.direction() == rusb::Direction::In,
                    max_packet_size: ep.max_packet_size(),
                    max_burst: ep.extra().map(parse_max_burst).unwrap_or(1),
                    interface: alt.interface_number(),
                    address: ep.address(),
                };
                debug!("Found endpoint {:?}", params);
                endpoints.push(params);
            }
        }
    }

    Ok(endpoints)
}

/// Negotiated speed of an enumerated device
pub fn link_speed<T: UsbContext>(device: &Device<T>) -> LinkSpeed {
    map_link_speed(device.speed())
}

/// Extract bMaxBurst from a SuperSpeed endpoint companion descriptor
///
/// Returns packets per burst (bMaxBurst + 1), or 1 when absent.
pub fn parse_max_burst(extra: &[u8]) -> u8 {
    let mut rest = extra;
    while rest.len() >= 2 {
        let len = usize::from(rest[0]);
        if len < 2 || len > rest.len() {
            break;
        }
        if rest[1] == SS_ENDPOINT_COMPANION && len >= 3 {
            return rest[2].saturating_add(1);
        }
        rest = &rest[len..];
    }
    1
}
