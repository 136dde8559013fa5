//! Asynchronous transfer transport interface
//!
//! The queue engine only needs three capabilities from a platform transport:
//! submit a read into a slot, wait for that slot's request to complete, and
//! cancel it. Buffers move into the transport on submit and come back on
//! completion or cancellation, so a buffer can never be touched while a
//! request owns it.
//!
//! Requests are filled by the device in submission order. A transport hands
//! completions back in that same order, which is why the queue services
//! slots strictly round-robin.

use common::DeviceError;
use std::time::Duration;

/// Final state of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionStatus {
    /// The request finished with this many valid bytes
    Done(usize),
    /// No data arrived within the request timeout
    TimedOut,
    /// The request failed
    Failed(String),
}

/// A retired request and the buffer it owned
#[derive(Debug)]
pub struct Completion {
    pub buffer: Vec<u8>,
    pub status: CompletionStatus,
}

impl Completion {
    pub fn done(buffer: Vec<u8>, len: usize) -> Self {
        Self {
            buffer,
            status: CompletionStatus::Done(len),
        }
    }

    pub fn timed_out(buffer: Vec<u8>) -> Self {
        Self {
            buffer,
            status: CompletionStatus::TimedOut,
        }
    }

    pub fn failed(buffer: Vec<u8>, reason: impl Into<String>) -> Self {
        Self {
            buffer,
            status: CompletionStatus::Failed(reason.into()),
        }
    }
}

/// Platform transport capable of overlapped reads from one IN endpoint
pub trait Transport: Send {
    /// Queue an asynchronous read into `slot`, taking ownership of `buffer`
    ///
    /// A slot holds at most one outstanding request.
    fn submit(&mut self, slot: usize, buffer: Vec<u8>) -> Result<(), DeviceError>;

    /// Block until the request in `slot` retires, bounded by `timeout`
    ///
    /// `slot` must hold the oldest outstanding request. A request still
    /// pending at `timeout` is aborted and reported as `TimedOut`, or as
    /// `Done` with whatever bytes arrived before the abort. Fails with
    /// `BulkIoError` when `slot` is idle, out of turn, or its request was lost.
    fn wait(&mut self, slot: usize, timeout: Duration) -> Result<Completion, DeviceError>;

    /// Cancel the request in `slot` and block until it has retired
    ///
    /// Returns the request's buffer, or `None` if the slot was idle.
    fn cancel(&mut self, slot: usize) -> Option<Vec<u8>>;

    /// Number of requests currently outstanding
    fn outstanding(&self) -> usize;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn submit(&mut self, slot: usize, buffer: Vec<u8>) -> Result<(), DeviceError> {
        (**self).submit(slot, buffer)
    }

    fn wait(&mut self, slot: usize, timeout: Duration) -> Result<Completion, DeviceError> {
        (**self).wait(slot, timeout)
    }

    fn cancel(&mut self, slot: usize) -> Option<Vec<u8>> {
        (**self).cancel(slot)
    }

    fn outstanding(&self) -> usize {
        (**self).outstanding()
    }
}
