//! Sliding-window transfer queue
//!
//! All `queue_size` requests are submitted up front and every completion is
//! answered with an immediate resubmission into the same slot, so the device
//! pipe never drains. Slots are serviced strictly round-robin.
//!
//! Buffers live in a [`BufferPool`] holding one spare beyond the queue depth:
//! a completed slot is refilled from the spare *before* its data is handed
//! downstream, and the consumed buffer becomes the next spare.

use crate::usb::transport::{CompletionStatus, Transport};
use common::{DeviceError, EventBus, StreamCounters, StreamEvent};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Why [`TransferQueue::service_next`] could not continue
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The trailing failure ratio was exceeded
    #[error("{failures} of the last {window} transfers failed")]
    Escalated { failures: usize, window: usize },

    /// The transport lost a request or refused a resubmission
    #[error("transport failure: {0}")]
    Transport(DeviceError),

    /// The queue was already stopped
    #[error("transfer queue is stopped")]
    Stopped,
}

impl ServiceError {
    /// Status code reported for this failure
    pub fn device_error(&self) -> DeviceError {
        match self {
            ServiceError::Escalated { .. } | ServiceError::Stopped => DeviceError::BulkIoError,
            ServiceError::Transport(e) => *e,
        }
    }
}

/// Maximum number of outstanding requests
pub const MAX_QUEUE_SZ: usize = 64;

/// Default bandwidth reporting period
pub const DEFAULT_BANDWIDTH_PERIOD: Duration = Duration::from_millis(1000);

/// Default number of recent completions considered for escalation
pub const DEFAULT_FAILURE_WINDOW: usize = 32;

/// Default failure ratio above which streaming escalates
pub const DEFAULT_FAILURE_RATIO: f64 = 0.5;

/// Parameters of one streaming session
#[derive(Debug, Clone, PartialEq)]
pub struct QueueParams {
    /// Bytes per request (`TransferSize * PPX`)
    pub request_len: usize,
    /// Outstanding requests, clamped to `1..=MAX_QUEUE_SZ`
    pub queue_size: usize,
    /// Per-request timeout
    pub timeout: Duration,
    pub bandwidth_period: Duration,
    pub failure_window: usize,
    pub failure_ratio: f64,
}

impl QueueParams {
    pub fn new(request_len: usize, queue_size: usize, timeout: Duration) -> Self {
        Self {
            request_len,
            queue_size,
            timeout,
            bandwidth_period: DEFAULT_BANDWIDTH_PERIOD,
            failure_window: DEFAULT_FAILURE_WINDOW,
            failure_ratio: DEFAULT_FAILURE_RATIO,
        }
    }
}

/// Owned transfer buffers not currently held by a request
#[derive(Debug)]
pub struct BufferPool {
    free: Vec<Vec<u8>>,
    buffer_len: usize,
}

impl BufferPool {
    pub fn new(count: usize, buffer_len: usize) -> Self {
        Self {
            free: (0..count).map(|_| vec![0u8; buffer_len]).collect(),
            buffer_len,
        }
    }

    pub fn acquire(&mut self) -> Option<Vec<u8>> {
        self.free.pop()
    }

    pub fn release(&mut self, mut buffer: Vec<u8>) {
        buffer.resize(self.buffer_len, 0);
        self.free.push(buffer);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// Periodic throughput accounting
#[derive(Debug)]
pub struct BandwidthMeter {
    period: Duration,
    window_start: Instant,
    window_bytes: u64,
}

impl BandwidthMeter {
    pub fn new(period: Duration, now: Instant) -> Self {
        Self {
            period,
            window_start: now,
            window_bytes: 0,
        }
    }

    /// Add `bytes`; once a period has elapsed, return bytes/sec and restart
    pub fn record(&mut self, bytes: u64, now: Instant) -> Option<u64> {
        self.window_bytes += bytes;

        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.period {
            return None;
        }

        let rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
        self.window_bytes = 0;
        self.window_start = now;
        Some(rate)
    }
}

/// Trailing window of pass/fail outcomes
#[derive(Debug)]
pub struct FailureWindow {
    outcomes: VecDeque<bool>,
    failures: usize,
    capacity: usize,
    ratio: f64,
}

impl FailureWindow {
    pub fn new(capacity: usize, ratio: f64) -> Self {
        let capacity = capacity.max(1);
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            failures: 0,
            capacity,
            ratio,
        }
    }

    /// Record an outcome; true once a full window exceeds the ratio
    pub fn record(&mut self, ok: bool) -> bool {
        if self.outcomes.len() == self.capacity
            && let Some(oldest) = self.outcomes.pop_front()
            && !oldest
        {
            self.failures -= 1;
        }
        self.outcomes.push_back(ok);
        if !ok {
            self.failures += 1;
        }
        self.exceeded()
    }

    pub fn exceeded(&self) -> bool {
        self.outcomes.len() == self.capacity
            && self.failures as f64 / self.capacity as f64 > self.ratio
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn clear(&mut self) {
        self.outcomes.clear();
        self.failures = 0;
    }
}

/// Fixed-depth ring of outstanding transfer requests
pub struct TransferQueue<T: Transport> {
    transport: T,
    pool: BufferPool,
    params: QueueParams,
    next_slot: usize,
    counters: Arc<StreamCounters>,
    events: EventBus,
    bandwidth: BandwidthMeter,
    failures: FailureWindow,
    stopped: bool,
}

impl<T: Transport> TransferQueue<T> {
    /// Allocate buffers and submit every slot
    pub fn start(
        mut transport: T,
        mut params: QueueParams,
        counters: Arc<StreamCounters>,
        events: EventBus,
    ) -> Result<Self, DeviceError> {
        if params.request_len == 0 {
            return Err(DeviceError::BadDevice);
        }
        if params.queue_size == 0 || params.queue_size > MAX_QUEUE_SZ {
            let clamped = params.queue_size.clamp(1, MAX_QUEUE_SZ);
            warn!("Queue size {} out of range, using {}", params.queue_size, clamped);
            params.queue_size = clamped;
        }

        let mut pool = BufferPool::new(params.queue_size + 1, params.request_len);
        for slot in 0..params.queue_size {
            let buffer = pool.acquire().ok_or(DeviceError::BulkIoError)?;
            if let Err(e) = transport.submit(slot, buffer) {
                error!("Initial submission of slot {} failed: {}", slot, e);
                for submitted in 0..slot {
                    if let Some(buffer) = transport.cancel(submitted) {
                        pool.release(buffer);
                    }
                }
                return Err(e);
            }
        }

        info!(
            "Transfer queue started: {} x {} bytes, timeout {:?}",
            params.queue_size, params.request_len, params.timeout
        );

        let now = Instant::now();
        Ok(Self {
            transport,
            pool,
            bandwidth: BandwidthMeter::new(params.bandwidth_period, now),
            failures: FailureWindow::new(params.failure_window, params.failure_ratio),
            params,
            next_slot: 0,
            counters,
            events,
            stopped: false,
        })
    }

    /// Wait for the next slot in order, resubmit it and pass its data on
    ///
    /// `consume` sees the received bytes only for the duration of the call.
    /// Timeouts and failed transfers are counted and resubmitted. The call
    /// fails with [`ServiceError::Escalated`] once the trailing failure ratio
    /// is exceeded and with [`ServiceError::Transport`] when the transport
    /// loses a request or refuses a resubmission.
    pub fn service_next<F>(&mut self, consume: F) -> Result<CompletionStatus, ServiceError>
    where
        F: FnOnce(&[u8]),
    {
        if self.stopped {
            return Err(ServiceError::Stopped);
        }

        let slot = self.next_slot;
        let started = Instant::now();
        let completion = self.transport.wait(slot, self.params.timeout).map_err(|e| {
            error!("Lost request in slot {}: {}", slot, e);
            ServiceError::Transport(e)
        })?;
        self.next_slot = (slot + 1) % self.params.queue_size;

        let status = completion.status.clone();
        match completion.status {
            CompletionStatus::Done(len) => {
                let Some(spare) = self.pool.acquire() else {
                    error!("No spare buffer to refill slot {}", slot);
                    self.pool.release(completion.buffer);
                    return Err(ServiceError::Transport(DeviceError::BulkIoError));
                };
                if let Err(e) = self.transport.submit(slot, spare) {
                    error!("Resubmission of slot {} failed: {}", slot, e);
                    self.pool.release(completion.buffer);
                    return Err(ServiceError::Transport(e));
                }

                let now = Instant::now();
                trace!(
                    "Slot {} completed {} bytes in {:?}",
                    slot,
                    len,
                    now.duration_since(started)
                );
                self.counters.record_success(len as u64);
                self.failures.record(true);

                if let Some(bytes_per_sec) = self.bandwidth.record(len as u64, now) {
                    debug!("Bandwidth: {} bytes/s", bytes_per_sec);
                    self.counters.record_bandwidth_report();
                    self.events.publish(StreamEvent::Bandwidth { bytes_per_sec });
                }

                let len = len.min(completion.buffer.len());
                consume(&completion.buffer[..len]);
                self.pool.release(completion.buffer);
            }
            CompletionStatus::TimedOut | CompletionStatus::Failed(_) => {
                if let CompletionStatus::Failed(reason) = &status {
                    warn!("Transfer in slot {} failed: {}", slot, reason);
                } else {
                    debug!("Transfer in slot {} timed out", slot);
                }
                self.counters.record_failure();
                self.transport.submit(slot, completion.buffer).map_err(|e| {
                    error!("Resubmission of slot {} failed: {}", slot, e);
                    ServiceError::Transport(e)
                })?;

                if self.failures.record(false) {
                    let escalated = ServiceError::Escalated {
                        failures: self.failures.failures(),
                        window: self.params.failure_window,
                    };
                    error!("{}", escalated);
                    return Err(escalated);
                }
            }
        }

        Ok(status)
    }

    /// Cancel every outstanding request and wait until all have retired
    ///
    /// No completion can be observed after this returns.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }

        for slot in 0..self.params.queue_size {
            if let Some(buffer) = self.transport.cancel(slot) {
                self.pool.release(buffer);
            }
        }
        self.stopped = true;

        let remaining = self.transport.outstanding();
        if remaining != 0 {
            error!("{} requests still outstanding after stop", remaining);
        }
        info!("Transfer queue stopped");
    }

    pub fn outstanding(&self) -> usize {
        self.transport.outstanding()
    }

    pub fn params(&self) -> &QueueParams {
        &self.params
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Buffers held by the pool (not owned by a request)
    pub fn idle_buffers(&self) -> usize {
        self.pool.available()
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}

impl<T: Transport> Drop for TransferQueue<T> {
    fn drop(&mut self) {
        self.stop();
    }
}
