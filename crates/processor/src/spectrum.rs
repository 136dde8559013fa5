//! Decimated FFT spectrum estimator
//!
//! Channels are transformed one after another through a single shared plan
//! and scratch buffer, so an estimator must not be driven from more than one
//! thread at a time (it is `&mut self` throughout).

use crate::decode::{CHANNELS, decode_level};
use num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::sync::Arc;
use tracing::debug;

/// Default transform length in sample words
pub const DEFAULT_FFT_WINDOW: usize = 8192;

/// Default decimation: transform once every this many buffers
pub const DEFAULT_SKIP_FRAMES: u32 = 10;

pub struct SpectrumEstimator {
    window: usize,
    fft: Arc<dyn Fft<f32>>,
    buffer: Vec<Complex<f32>>,
    scratch: Vec<Complex<f32>>,
    outputs: [Vec<f64>; CHANNELS],
    enabled: [bool; CHANNELS],
    skip_frames: u32,
    countdown: u32,
}

impl std::fmt::Debug for SpectrumEstimator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpectrumEstimator")
            .field("window", &self.window)
            .field("enabled", &self.enabled)
            .field("skip_frames", &self.skip_frames)
            .field("countdown", &self.countdown)
            .finish()
    }
}

impl SpectrumEstimator {
    /// Plan a forward transform of `window` points
    pub fn new(window: usize) -> Self {
        let window = window.max(2);
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(window);
        let scratch = vec![Complex::default(); fft.get_inplace_scratch_len()];

        Self {
            window,
            fft,
            buffer: vec![Complex::default(); window],
            scratch,
            outputs: std::array::from_fn(|_| vec![0.0; window / 2]),
            enabled: [false; CHANNELS],
            skip_frames: DEFAULT_SKIP_FRAMES,
            countdown: DEFAULT_SKIP_FRAMES,
        }
    }

    /// Set decimation and channel enables; restarts the decimation count
    pub fn configure(&mut self, skip_frames: u32, channels: [bool; CHANNELS]) {
        self.skip_frames = skip_frames.max(1);
        self.countdown = self.skip_frames;
        self.enabled = channels;
    }

    /// Feed one buffer; `emit` receives `(channel, bins)` for each transformed channel
    ///
    /// Returns the number of channels emitted.
    pub fn process<F>(&mut self, words: &[u16], mut emit: F) -> usize
    where
        F: FnMut(usize, &[f64]),
    {
        self.countdown = self.countdown.saturating_sub(1);
        if self.countdown > 0 {
            return 0;
        }
        self.countdown = self.skip_frames;

        if words.len() < self.window {
            debug!(
                "Skipping spectrum: buffer holds {} words, window is {}",
                words.len(),
                self.window
            );
            return 0;
        }

        let mut emitted = 0;
        for channel in 0..CHANNELS {
            if !self.enabled[channel] {
                continue;
            }
            self.transform_channel(&words[..self.window], channel);
            emit(channel, &self.outputs[channel]);
            emitted += 1;
        }
        emitted
    }

    fn transform_channel(&mut self, words: &[u16], channel: usize) {
        for (slot, &word) in self.buffer.iter_mut().zip(words) {
            *slot = Complex::new(f32::from(decode_level(word, channel)), 0.0);
        }

        self.fft
            .process_with_scratch(&mut self.buffer, &mut self.scratch);

        for (bin, value) in self.outputs[channel].iter_mut().zip(&self.buffer) {
            let power = f64::from(value.re) * f64::from(value.re)
                + f64::from(value.im) * f64::from(value.im);
            *bin = 10.0 * power.log10();
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn skip_frames(&self) -> u32 {
        self.skip_frames
    }

    pub fn enabled_channels(&self) -> [bool; CHANNELS] {
        self.enabled
    }

    /// Last spectrum computed for `channel`
    pub fn output(&self, channel: usize) -> &[f64] {
        &self.outputs[channel]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_is_half_window() {
        let mut est = SpectrumEstimator::new(64);
        est.configure(1, [true, false, false, false]);

        let mut lens = Vec::new();
        let emitted = est.process(&[0u16; 64], |_, bins| lens.push(bins.len()));
        assert_eq!(emitted, 1);
        assert_eq!(lens, vec![32]);
    }

    #[test]
    fn test_decimation() {
        let mut est = SpectrumEstimator::new(16);
        est.configure(3, [true; 4]);

        let words = [0u16; 16];
        let runs: Vec<usize> = (0..9).map(|_| est.process(&words, |_, _| {})).collect();
        assert_eq!(runs, vec![0, 0, 4, 0, 0, 4, 0, 0, 4]);
    }

    #[test]
    fn test_disabled_channels_are_not_emitted() {
        let mut est = SpectrumEstimator::new(16);
        est.configure(1, [false, true, false, true]);

        let mut channels = Vec::new();
        est.process(&[0u16; 16], |ch, _| channels.push(ch));
        assert_eq!(channels, vec![1, 3]);
    }

    #[test]
    fn test_constant_input_is_dc_only() {
        // every code 0 -> level +1 on all channels
        let mut est = SpectrumEstimator::new(32);
        est.configure(1, [true, false, false, false]);
        est.process(&[0u16; 32], |_, _| {});

        let out = est.output(0);
        // DC bin: |32|^2 -> 10*log10(1024)
        assert!((out[0] - 10.0 * 1024f64.log10()).abs() < 1e-6);
        // every other bin carries at most rounding noise
        assert!(out[1..].iter().all(|v| *v < out[0] - 60.0));
    }

    #[test]
    fn test_quarter_rate_pattern_peaks_at_quarter_bin() {
        // ch0 levels +1, +1, -1, -1 repeating
        let window = 32;
        let pattern = [0u16, 0, 2, 2];
        let words: Vec<u16> = pattern.iter().cycle().take(window).copied().collect();

        let mut est = SpectrumEstimator::new(window);
        est.configure(1, [true, false, false, false]);
        est.process(&words, |_, _| {});

        let out = est.output(0);
        let peak = out
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, window / 4);
    }

    #[test]
    fn test_short_buffer_is_skipped() {
        let mut est = SpectrumEstimator::new(64);
        est.configure(1, [true; 4]);
        assert_eq!(est.process(&[0u16; 10], |_, _| {}), 0);
    }
}
