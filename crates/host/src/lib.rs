//! FX3 streaming host
//!
//! Finds an FX3-class digitizer, keeps a fixed-depth queue of bulk reads in
//! flight against its streaming endpoint and feeds every completed buffer
//! through link-integrity verification and the sample pipelines of the
//! `processor` crate.

pub mod config;
pub mod stream;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod usb;

pub use config::HostConfig;
pub use stream::{StreamController, StreamOptions, StreamState};
pub use usb::Fx3Device;
