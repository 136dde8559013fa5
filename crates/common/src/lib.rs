//! Shared building blocks for the FX3 streaming host
//!
//! This crate provides the status-code error surface, logging setup, the typed
//! event bus used to notify listeners, and the atomic stream counters shared
//! between the streaming thread and monitors.

pub mod channel;
pub mod error;
pub mod logging;
pub mod metrics;

pub use channel::{
    DEFAULT_EVENT_CAPACITY, EventBus, EventReceiver, FillReport, StopReason, StreamEvent,
};
pub use error::{DeviceError, Error, Result, STATUS_OK, status_code};
pub use logging::setup_logging;
pub use metrics::{CounterSnapshot, StreamCounters};
