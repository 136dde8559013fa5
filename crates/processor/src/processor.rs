//! DataProcessor: the three sample pipelines
//!
//! `process_data` runs, in order, the fill-histogram monitor, the file dump
//! and the spectrum estimator, each gated by its own enable. Everything runs
//! synchronously on the caller's thread, which is the streaming completion
//! loop, so slow pipelines directly throttle streaming.

use crate::decode::{CHANNELS, words_from_bytes};
use crate::dump::{DumpProgress, FileDump};
use crate::fill::{DEFAULT_FILL_THRESHOLD, FillMonitor, format_report};
use crate::spectrum::{DEFAULT_FFT_WINDOW, SpectrumEstimator};
use common::{EventBus, StreamEvent};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Fixed parameters of the processing pipelines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorSettings {
    /// Fill window length in sample words
    #[serde(default = "ProcessorSettings::default_fill_threshold")]
    pub fill_threshold: u64,
    /// FFT length in sample words
    #[serde(default = "ProcessorSettings::default_fft_window")]
    pub fft_window: usize,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            fill_threshold: Self::default_fill_threshold(),
            fft_window: Self::default_fft_window(),
        }
    }
}

impl ProcessorSettings {
    fn default_fill_threshold() -> u64 {
        DEFAULT_FILL_THRESHOLD
    }

    fn default_fft_window() -> usize {
        DEFAULT_FFT_WINDOW
    }
}

pub struct DataProcessor {
    events: EventBus,
    fill_enabled: bool,
    fill: FillMonitor,
    dump: Option<FileDump>,
    dump_path: PathBuf,
    fft_enabled: bool,
    spectrum: SpectrumEstimator,
}

impl DataProcessor {
    pub fn new(events: EventBus, settings: &ProcessorSettings) -> Self {
        Self {
            events,
            fill_enabled: false,
            fill: FillMonitor::new(settings.fill_threshold),
            dump: None,
            dump_path: PathBuf::new(),
            fft_enabled: false,
            spectrum: SpectrumEstimator::new(settings.fft_window),
        }
    }

    /// Decode a raw transfer buffer into sample words and process it
    pub fn process_bytes(&mut self, bytes: &[u8]) {
        let words = words_from_bytes(bytes);
        self.process_data(&words);
    }

    pub fn process_data(&mut self, words: &[u16]) {
        if self.fill_enabled {
            self.fill_calc(words);
        }

        if self.dump.is_some() {
            self.file_dump(words);
        }

        if self.fft_enabled {
            self.fft_calc(words);
        }
    }

    pub fn enable_fill_calc(&mut self, enable: bool) {
        debug!("Fill calculation {}", if enable { "enabled" } else { "disabled" });
        self.fill_enabled = enable;
    }

    /// Start or stop dumping low sample bytes to `path`
    ///
    /// Enabling while already enabled (or disabling while disabled) does
    /// nothing. `byte_limit == 0` means unlimited.
    pub fn enable_file_dump(
        &mut self,
        enable: bool,
        path: impl AsRef<Path>,
        byte_limit: u64,
    ) -> common::Result<()> {
        if enable == self.dump.is_some() {
            return Ok(());
        }

        if enable {
            let path = path.as_ref();
            let dump = FileDump::create(path, byte_limit).inspect_err(|e| {
                warn!("Cannot open dump file {}: {}", path.display(), e);
                self.events
                    .message(format!("Cannot dump to {}: {}", path.display(), e));
            })?;
            self.dump_path = path.to_path_buf();
            self.dump = Some(dump);
            self.events
                .message(format!("Started dumping to {}", path.display()));
        } else {
            self.close_dump()?;
        }
        Ok(())
    }

    /// Enable the spectrum pipeline with decimation and per-channel enables
    pub fn enable_fft_calc(&mut self, enable: bool, skip_frames: u32, channels: [bool; CHANNELS]) {
        self.fft_enabled = enable;
        if enable {
            self.spectrum.configure(skip_frames, channels);
            debug!(
                "FFT enabled: skip_frames={}, channels={:?}",
                self.spectrum.skip_frames(),
                channels
            );
        }
    }

    pub fn fill_enabled(&self) -> bool {
        self.fill_enabled
    }

    pub fn is_dumping(&self) -> bool {
        self.dump.is_some()
    }

    /// Bytes written to the current dump, if one is open
    pub fn dump_count(&self) -> Option<u64> {
        self.dump.as_ref().map(FileDump::written)
    }

    pub fn fft_enabled(&self) -> bool {
        self.fft_enabled
    }

    pub fn fill_monitor(&self) -> &FillMonitor {
        &self.fill
    }

    pub fn spectrum(&self) -> &SpectrumEstimator {
        &self.spectrum
    }

    fn fill_calc(&mut self, words: &[u16]) {
        if let Some(report) = self.fill.accumulate(words) {
            let msg = format_report(&report);
            debug!("{}", msg);
            self.events.message(msg);
            self.events.publish(StreamEvent::Fill(report));
        }
    }

    fn file_dump(&mut self, words: &[u16]) {
        let Some(dump) = self.dump.as_mut() else {
            return;
        };

        match dump.write_words(words) {
            Ok(DumpProgress::Written(_)) => {}
            Ok(DumpProgress::LimitReached(_)) => {
                let bytes = dump.written();
                info!("Dump limit of {} bytes reached", bytes);
                if let Err(e) = self.close_dump() {
                    warn!("Error closing dump file: {}", e);
                }
                self.events.publish(StreamEvent::DumpAborted { bytes });
            }
            Err(e) => {
                warn!("Dump write failed, disabling dump: {}", e);
                self.events.message(format!(
                    "Dump to {} failed: {}",
                    self.dump_path.display(),
                    e
                ));
                if let Err(e) = self.close_dump() {
                    debug!("Error closing failed dump file: {}", e);
                }
            }
        }
    }

    fn fft_calc(&mut self, words: &[u16]) {
        let events = &self.events;
        self.spectrum.process(words, |channel, bins| {
            events.publish(StreamEvent::Spectrum {
                channel,
                bins: Arc::from(bins),
            });
        });
    }

    fn close_dump(&mut self) -> common::Result<()> {
        let Some(dump) = self.dump.take() else {
            return Ok(());
        };

        let written = dump.finish()?;
        if written > 0 {
            self.events.message(format!(
                "Dumped {} bytes to {}",
                written,
                self.dump_path.display()
            ));
        }
        Ok(())
    }
}

impl Drop for DataProcessor {
    fn drop(&mut self) {
        if let Err(e) = self.close_dump() {
            warn!("Error closing dump file: {}", e);
        }
    }
}
