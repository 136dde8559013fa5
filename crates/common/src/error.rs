//! Common error types
//!
//! [`DeviceError`] is the status-code surface of the control path: every
//! fallible device operation returns `Result<_, DeviceError>` and callers that
//! need the numeric code use [`DeviceError::code`] or [`status_code`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("USB error: {0}")]
    Usb(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Status code reported for a successful control-path operation
pub const STATUS_OK: i32 = 0;

/// Device-level failures, one per non-zero status code
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceError {
    /// The requested driver path does not exist on this platform
    #[error("driver not implemented")]
    DriverNotImplemented,

    /// The USB stack could not be initialized
    #[error("USB init failed")]
    UsbInitFail,

    /// No device with a matching vendor identity is attached
    #[error("no device found")]
    NoDeviceFound,

    /// A matched device has inconsistent or unusable descriptors
    #[error("bad device")]
    BadDevice,

    /// The firmware image could not be read
    #[error("firmware file IO error")]
    FirmwareFileIoError,

    /// The firmware image failed validation
    #[error("firmware file corrupted")]
    FirmwareFileCorrupted,

    /// The additional firmware image could not be read
    #[error("additional firmware file IO error")]
    AddFirmwareFileIoError,

    /// A register write was rejected by the device
    #[error("register write failed")]
    RegisterWriteFail,

    /// The link self-test pattern showed too many gaps
    #[error("too many firmware errors")]
    FwTooManyErrors,

    /// A control transfer failed
    #[error("control transfer failed")]
    ControlTransferFail,

    /// Streaming transfers failed too often
    #[error("bulk IO error")]
    BulkIoError,

    /// A streaming session is already active on this device
    #[error("streaming session already active")]
    SessionActive,
}

impl DeviceError {
    /// Numeric status code (always negative)
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::DriverNotImplemented => -5,
            DeviceError::UsbInitFail => -10,
            DeviceError::NoDeviceFound => -11,
            DeviceError::BadDevice => -12,
            DeviceError::FirmwareFileIoError => -20,
            DeviceError::FirmwareFileCorrupted => -21,
            DeviceError::AddFirmwareFileIoError => -25,
            DeviceError::RegisterWriteFail => -32,
            DeviceError::FwTooManyErrors => -33,
            DeviceError::ControlTransferFail => -35,
            DeviceError::BulkIoError => -37,
            DeviceError::SessionActive => -38,
        }
    }

    /// Inverse of [`DeviceError::code`]; `None` for `STATUS_OK` and unknown codes
    pub fn from_code(code: i32) -> Option<Self> {
        let err = match code {
            -5 => DeviceError::DriverNotImplemented,
            -10 => DeviceError::UsbInitFail,
            -11 => DeviceError::NoDeviceFound,
            -12 => DeviceError::BadDevice,
            -20 => DeviceError::FirmwareFileIoError,
            -21 => DeviceError::FirmwareFileCorrupted,
            -25 => DeviceError::AddFirmwareFileIoError,
            -32 => DeviceError::RegisterWriteFail,
            -33 => DeviceError::FwTooManyErrors,
            -35 => DeviceError::ControlTransferFail,
            -37 => DeviceError::BulkIoError,
            -38 => DeviceError::SessionActive,
            _ => return None,
        };
        Some(err)
    }

    /// Human readable description suitable for UI status lines
    pub fn description(&self) -> &'static str {
        match self {
            DeviceError::DriverNotImplemented => {
                "Driver path is not implemented on this platform"
            }
            DeviceError::UsbInitFail => "Failed to initialize the USB subsystem",
            DeviceError::NoDeviceFound => "No compatible device found",
            DeviceError::BadDevice => "Device descriptors are inconsistent or unusable",
            DeviceError::FirmwareFileIoError => "Cannot read firmware image",
            DeviceError::FirmwareFileCorrupted => "Firmware image is corrupted",
            DeviceError::AddFirmwareFileIoError => "Cannot read additional firmware image",
            DeviceError::RegisterWriteFail => "Register write failed",
            DeviceError::FwTooManyErrors => "Too many errors in the link self-test pattern",
            DeviceError::ControlTransferFail => "Control transfer failed",
            DeviceError::BulkIoError => "Streaming transfer error rate too high",
            DeviceError::SessionActive => "A streaming session is already running",
        }
    }
}

/// Map any control-path result to its numeric status code
pub fn status_code<T>(result: &std::result::Result<T, DeviceError>) -> i32 {
    match result {
        Ok(_) => STATUS_OK,
        Err(e) => e.code(),
    }
}
