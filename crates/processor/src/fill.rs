//! Fill-histogram monitor
//!
//! Counts how often each 2-bit code occurs per channel over a window of
//! sample words. Once the window holds more than `threshold` words the
//! percentages are reported and every count restarts from zero.

use crate::decode::{CHANNELS, CODES_BY_LEVEL, channel_code};
use common::FillReport;

/// Default window length in sample words
pub const DEFAULT_FILL_THRESHOLD: u64 = 1 << 20;

/// Self-resetting per-channel code histogram
#[derive(Debug, Clone)]
pub struct FillMonitor {
    counts: [[u64; 4]; CHANNELS],
    samples: u64,
    threshold: u64,
}

impl Default for FillMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_FILL_THRESHOLD)
    }
}

impl FillMonitor {
    pub fn new(threshold: u64) -> Self {
        Self {
            counts: [[0; 4]; CHANNELS],
            samples: 0,
            threshold: threshold.max(1),
        }
    }

    /// Add a buffer of words; returns a report when the window closed
    pub fn accumulate(&mut self, words: &[u16]) -> Option<FillReport> {
        for &word in words {
            for (channel, counts) in self.counts.iter_mut().enumerate() {
                counts[channel_code(word, channel)] += 1;
            }
        }
        self.samples += words.len() as u64;

        if self.samples <= self.threshold {
            return None;
        }

        let report = FillReport {
            timestamp: chrono::Local::now().format("%H:%M:%S%.3f").to_string(),
            samples: self.samples,
            percent: self.percentages(),
        };
        self.reset();
        Some(report)
    }

    /// Current percentages ordered by level (`-3, -1, +1, +3`)
    pub fn percentages(&self) -> [[f64; 4]; CHANNELS] {
        let mut percent = [[0.0; 4]; CHANNELS];
        if self.samples == 0 {
            return percent;
        }

        for (channel, counts) in self.counts.iter().enumerate() {
            for (slot, &code) in CODES_BY_LEVEL.iter().enumerate() {
                percent[channel][slot] = 100.0 * counts[code] as f64 / self.samples as f64;
            }
        }
        percent
    }

    pub fn reset(&mut self) {
        self.counts = [[0; 4]; CHANNELS];
        self.samples = 0;
    }

    /// Words accumulated in the current window
    pub fn sample_count(&self) -> u64 {
        self.samples
    }

    /// Raw counts indexed by `[channel][code]`
    pub fn counts(&self) -> &[[u64; 4]; CHANNELS] {
        &self.counts
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }
}

/// Render a report as the multi-line status message
pub fn format_report(report: &FillReport) -> String {
    let mut msg = format!("{}\n", report.timestamp);
    for (channel, p) in report.percent.iter().enumerate() {
        msg.push_str(&format!(
            "Channel{} fill: {:.3} {:.3} {:.3} {:.3}\n",
            channel + 1,
            p[0],
            p[1],
            p[2],
            p[3]
        ));
    }
    msg
}
