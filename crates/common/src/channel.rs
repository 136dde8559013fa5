//! Typed event bus between the streaming thread and its listeners
//!
//! The streaming loop runs on a dedicated OS thread and must never block on a
//! slow listener, so [`EventBus::publish`] uses `try_send` and drops the event
//! for a subscriber whose queue is full. Listeners may consume events either
//! from async code (`recv`) or from a plain thread (`recv_blocking`).

use async_channel::{Receiver, Sender, TryRecvError, TrySendError, bounded};
use std::sync::{Arc, Mutex};
use tracing::trace;

/// Default per-subscriber queue depth
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Why a streaming session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// `start_stop(false)` was requested
    Requested,
    /// The trailing transfer failure ratio exceeded its threshold
    TooManyTransferErrors,
    /// The link self-test gap ratio exceeded its threshold
    TooManyFirmwareErrors,
    /// The transport lost a request or the device went away
    TransportFailure,
}

/// Occurrence percentages of one fill window
///
/// `percent[ch]` is ordered by symbol level: `-3, -1, +1, +3`.
#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    /// Local wall-clock time the window closed (`HH:MM:SS.mmm`)
    pub timestamp: String,
    /// Number of sample words in the window
    pub samples: u64,
    pub percent: [[f64; 4]; 4],
}

/// Events published by the streaming engine and the data processor
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Free-form debug/status text
    Message(String),
    /// Measured throughput over the last bandwidth period
    Bandwidth { bytes_per_sec: u64 },
    /// The streaming session ended and its resources were released
    StreamStopped { reason: StopReason },
    /// Log-power spectrum of one channel, `window / 2` bins in dB
    Spectrum { channel: usize, bins: Arc<[f64]> },
    /// A fill-histogram window closed
    Fill(FillReport),
    /// The file dump reached its byte limit and disabled itself
    DumpAborted { bytes: u64 },
    /// Copy of a decoded sample buffer
    Samples(Arc<[u16]>),
}

/// Observer registry fanning events out to every live subscriber
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<StreamEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener with the default queue depth
    pub fn subscribe(&self) -> EventReceiver {
        self.subscribe_with_capacity(DEFAULT_EVENT_CAPACITY)
    }

    /// Register a listener with an explicit queue depth
    pub fn subscribe_with_capacity(&self, capacity: usize) -> EventReceiver {
        let (tx, rx) = bounded(capacity.max(1));
        self.lock().push(tx);
        EventReceiver { rx }
    }

    /// Deliver an event to every subscriber without blocking
    ///
    /// Subscribers whose receiver was dropped are removed.
    pub fn publish(&self, event: StreamEvent) {
        let mut subscribers = self.lock();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("Event queue full, dropping event for one subscriber");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });
    }

    /// Convenience wrapper for [`StreamEvent::Message`]
    pub fn message(&self, text: impl Into<String>) {
        self.publish(StreamEvent::Message(text.into()));
    }

    /// Number of currently registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<StreamEvent>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Receiving end of one subscription
pub struct EventReceiver {
    rx: Receiver<StreamEvent>,
}

impl EventReceiver {
    /// Wait for the next event from async code
    pub async fn recv(&self) -> crate::Result<StreamEvent> {
        self.rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Wait for the next event from a blocking thread
    pub fn recv_blocking(&self) -> crate::Result<StreamEvent> {
        self.rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take the next event if one is queued
    pub fn try_recv(&self) -> Option<StreamEvent> {
        match self.rx.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => None,
        }
    }

    /// Take every queued event
    pub fn drain(&self) -> Vec<StreamEvent> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }
}
