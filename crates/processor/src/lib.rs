//! Real-time sample processing for the FX3 digitizer stream
//!
//! Decoded sample words flow through three independently enabled pipelines:
//!
//! - [`fill`]: windowed per-channel code histogram
//! - [`dump`]: flat raw-byte file dump with an optional byte limit
//! - [`spectrum`]: decimated per-channel log-power FFT
//!
//! [`DataProcessor`] dispatches to them and publishes results on a
//! [`common::EventBus`].

pub mod decode;
pub mod dump;
pub mod fill;
pub mod processor;
pub mod spectrum;

pub use decode::{CHANNELS, LEVELS, channel_code, decode_level, words_from_bytes};
pub use dump::{DumpProgress, FileDump};
pub use fill::{DEFAULT_FILL_THRESHOLD, FillMonitor, format_report};
pub use processor::{DataProcessor, ProcessorSettings};
pub use spectrum::{DEFAULT_FFT_WINDOW, DEFAULT_SKIP_FRAMES, SpectrumEstimator};
