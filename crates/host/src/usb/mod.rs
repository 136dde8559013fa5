//! USB subsystem
//!
//! Device discovery, endpoint configuration and the streaming transfer
//! engine. The completion loop runs on its own thread so it never blocks
//! the Tokio runtime.
//!
//! - [`scanner`]: enumeration and firmware-state classification
//! - [`endpoints`]: endpoint discovery and transfer sizing
//! - [`transport`] / [`transfers`]: the request transport and its nusb bulk implementation
//! - [`queue`]: the sliding-window transfer queue
//! - [`integrity`]: self-test pattern verification

pub mod device;
pub mod endpoints;
pub mod integrity;
pub mod queue;
pub mod scanner;
pub mod transfers;
pub mod transport;

pub use device::Fx3Device;
pub use endpoints::{EndpointKind, EndpointParams, EndpointSelection, LinkSpeed, MAX_TRANSFER_LENGTH};
pub use integrity::{ContinuitySnapshot, LinkIntegrityChecker};
pub use queue::{MAX_QUEUE_SZ, QueueParams, ServiceError, TransferQueue};
pub use scanner::{
    DeviceIdentity, DeviceScanner, FirmwareLoader, FirmwareState, PRODUCT_BOOT, PRODUCT_STREAM,
    ScanReport, VENDOR_ID,
};
pub use transfers::BulkTransport;
pub use transport::{Completion, CompletionStatus, Transport};
