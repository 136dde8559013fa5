//! Link self-test pattern verification
//!
//! In self-test mode the device streams a byte counter that increments by
//! one (mod 256) across buffer boundaries. Every byte that does not follow
//! its predecessor counts as one gap, after which checking resynchronises on
//! the observed value.
//!
//! The counters are written by the streaming thread and read by monitors,
//! so they sit behind a mutex and are read through [`ContinuitySnapshot`].

use crate::usb::queue::FailureWindow;
use common::DeviceError;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::{debug, error};

/// Default number of recent buffers considered for escalation
pub const DEFAULT_INTEGRITY_WINDOW: usize = 256;

/// Default ratio of gapped buffers above which streaming escalates
pub const DEFAULT_GAP_RATIO: f64 = 0.1;

/// Consistent copy of the continuity counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuitySnapshot {
    /// Bytes checked since the last reset
    pub bytes_seen: u64,
    /// Pattern discontinuities since the last reset
    pub gaps: u64,
    /// Last byte of the previous buffer
    pub last_byte: Option<u8>,
    /// Buffers without gaps
    pub successes: u64,
    /// Buffers with at least one gap
    pub failures: u64,
}

#[derive(Debug)]
struct ContinuityState {
    counters: ContinuitySnapshot,
    window: FailureWindow,
}

#[derive(Debug)]
pub struct LinkIntegrityChecker {
    state: Mutex<ContinuityState>,
    /// Externally credited byte count
    cc_data: AtomicI64,
}

impl Default for LinkIntegrityChecker {
    fn default() -> Self {
        Self::new(DEFAULT_INTEGRITY_WINDOW, DEFAULT_GAP_RATIO)
    }
}

impl LinkIntegrityChecker {
    pub fn new(window: usize, gap_ratio: f64) -> Self {
        Self {
            state: Mutex::new(ContinuityState {
                counters: ContinuitySnapshot::default(),
                window: FailureWindow::new(window, gap_ratio),
            }),
            cc_data: AtomicI64::new(0),
        }
    }

    /// Verify one buffer against the running pattern
    ///
    /// Returns the number of gaps found in `data`, or `FwTooManyErrors` once
    /// the trailing gapped-buffer ratio exceeds its threshold.
    pub fn check(&self, data: &[u8]) -> Result<u64, DeviceError> {
        if data.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock();
        let mut prev = state.counters.last_byte;
        let mut gaps = 0u64;
        for &byte in data {
            if let Some(p) = prev
                && byte != p.wrapping_add(1)
            {
                gaps += 1;
            }
            prev = Some(byte);
        }

        let counters = &mut state.counters;
        counters.last_byte = prev;
        counters.bytes_seen += data.len() as u64;
        counters.gaps += gaps;
        if gaps == 0 {
            counters.successes += 1;
        } else {
            counters.failures += 1;
            debug!("{} pattern gaps in {}-byte buffer", gaps, data.len());
        }

        if state.window.record(gaps == 0) {
            error!(
                "Link self-test failing: {} of recent buffers had gaps",
                state.window.failures()
            );
            return Err(DeviceError::FwTooManyErrors);
        }
        Ok(gaps)
    }

    pub fn snapshot(&self) -> ContinuitySnapshot {
        self.lock().counters
    }

    /// Forget the pattern position and zero every counter
    pub fn reset(&self) {
        let mut state = self.lock();
        state.counters = ContinuitySnapshot::default();
        state.window.clear();
        self.cc_data.store(0, Ordering::Relaxed);
    }

    /// Credit `bytes` to the external continuity data counter
    pub fn cc_inc(&self, bytes: i64) {
        self.cc_data.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn cc_data(&self) -> i64 {
        self.cc_data.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ContinuityState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
