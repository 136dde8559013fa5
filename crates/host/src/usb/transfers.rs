//! nusb-backed streaming transport
//!
//! Every request is a transfer queued on one nusb IN endpoint. The kernel
//! fills them strictly in submission order and nusb hands completions back
//! in that order, so slot numbers are bookkeeping on top of a FIFO.
//!
//! nusb can only cancel every pending transfer at once. Aborting a single
//! request (a timeout, or `cancel`) therefore retires the whole queue:
//! transfers that carried data or failed are kept as ready completions and
//! come back through `wait`, empty ones are resubmitted in their original
//! order so the device keeps filling them in turn.

use crate::usb::endpoints::{EndpointKind, EndpointParams};
use crate::usb::transport::{Completion, CompletionStatus, Transport};
use common::DeviceError;
use nusb::transfer::{Buffer, Bulk, In, TransferError};
use nusb::{Endpoint, Interface};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, error, trace, warn};

/// Upper bound for cancelled transfers to retire
const CANCEL_TIMEOUT: Duration = Duration::from_secs(1);

/// Check that `endpoint` can carry a bulk streaming session
pub fn check_streamable(endpoint: &EndpointParams) -> Result<(), DeviceError> {
    if endpoint.kind == EndpointKind::Isochronous {
        warn!(
            "Isochronous streaming from {:#04x} is not supported by this driver",
            endpoint.address
        );
        return Err(DeviceError::DriverNotImplemented);
    }
    if !endpoint.is_in || endpoint.kind != EndpointKind::Bulk {
        warn!(
            "Endpoint {:#04x} ({:?}, in: {}) is not a bulk IN endpoint",
            endpoint.address, endpoint.kind, endpoint.is_in
        );
        return Err(DeviceError::BadDevice);
    }
    Ok(())
}

/// A transfer handed to the endpoint
#[derive(Debug, Clone, Copy)]
struct InFlight {
    slot: usize,
    len: usize,
}

/// What to do with a transfer retired by cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
enum Aborted {
    /// Report it with this status
    Keep(CompletionStatus),
    /// Nothing arrived; it can be queued again unchanged
    Resubmit,
}

fn classify_aborted(status: &Result<(), TransferError>, actual_len: usize) -> Aborted {
    match status {
        Ok(()) => Aborted::Keep(CompletionStatus::Done(actual_len)),
        Err(_) if actual_len > 0 => Aborted::Keep(CompletionStatus::Done(actual_len)),
        Err(TransferError::Cancelled) => Aborted::Resubmit,
        Err(e) => Aborted::Keep(CompletionStatus::Failed(e.to_string())),
    }
}

fn to_buffer(data: Vec<u8>) -> Buffer {
    let len = data.len();
    let mut buffer = Buffer::from(data);
    buffer.clear();
    buffer.set_requested_len(len);
    buffer
}

fn into_data(buffer: Buffer, len: usize) -> Vec<u8> {
    let mut data = buffer.into_vec();
    data.resize(len, 0);
    data
}

/// Streaming transport over a bulk IN endpoint of a claimed nusb interface
pub struct BulkTransport {
    endpoint: Endpoint<Bulk, In>,
    in_flight: VecDeque<InFlight>,
    ready: Vec<Option<Completion>>,
}

impl BulkTransport {
    /// Open `endpoint` on `interface` for streaming
    ///
    /// Isochronous endpoints are not supported by this driver.
    pub fn open(interface: &Interface, endpoint: &EndpointParams) -> Result<Self, DeviceError> {
        check_streamable(endpoint)?;
        let address = endpoint.address;
        let endpoint = interface.endpoint::<Bulk, In>(address).map_err(|e| {
            warn!("Failed to open endpoint {:#04x}: {}", address, e);
            DeviceError::BadDevice
        })?;
        debug!(
            "Streaming from endpoint {:#04x}, max packet {}",
            address,
            endpoint.max_packet_size()
        );

        Ok(Self {
            endpoint,
            in_flight: VecDeque::new(),
            ready: Vec::new(),
        })
    }

    fn owns(&self, slot: usize) -> bool {
        self.ready.get(slot).is_some_and(Option::is_some)
            || self.in_flight.iter().any(|r| r.slot == slot)
    }

    fn enqueue(&mut self, slot: usize, data: Vec<u8>) {
        let len = data.len();
        self.endpoint.submit(to_buffer(data));
        self.in_flight.push_back(InFlight { slot, len });
    }

    fn stash(&mut self, slot: usize, completion: Completion) {
        if self.ready.len() <= slot {
            self.ready.resize_with(slot + 1, || None);
        }
        self.ready[slot] = Some(completion);
    }

    fn take_ready(&mut self, slot: usize) -> Option<Completion> {
        self.ready.get_mut(slot).and_then(Option::take)
    }

    /// Cancel every pending transfer and collect them in submission order
    ///
    /// Transfers that fail to retire stay in `in_flight`.
    fn drain(&mut self) -> Vec<(InFlight, nusb::transfer::Completion)> {
        self.endpoint.cancel_all();

        let mut retired = Vec::with_capacity(self.in_flight.len());
        while let Some(request) = self.in_flight.front().copied() {
            if self.endpoint.pending() == 0 {
                error!("Endpoint lost {} transfers", self.in_flight.len());
                break;
            }
            let Some(done) = self.endpoint.wait_next_complete(CANCEL_TIMEOUT) else {
                error!(
                    "{} cancelled transfers did not retire",
                    self.in_flight.len()
                );
                break;
            };
            self.in_flight.pop_front();
            retired.push((request, done));
        }
        retired
    }

    /// Keep every drained transfer as a ready completion
    fn stash_drained(&mut self, retired: Vec<(InFlight, nusb::transfer::Completion)>) {
        for (request, done) in retired {
            let status = match classify_aborted(&done.status, done.actual_len) {
                Aborted::Keep(status) => status,
                Aborted::Resubmit => CompletionStatus::TimedOut,
            };
            let buffer = into_data(done.buffer, request.len);
            self.stash(request.slot, Completion { buffer, status });
        }
    }

    /// The head request outlived its timeout: abort it, keep the rest in order
    fn abort_head(&mut self, slot: usize) -> Result<Completion, DeviceError> {
        let retired = self.drain();
        if !self.in_flight.is_empty() {
            self.stash_drained(retired);
            return Err(DeviceError::BulkIoError);
        }

        let mut retired = retired.into_iter();
        let Some((head, done)) = retired.next() else {
            return Err(DeviceError::BulkIoError);
        };
        debug_assert_eq!(head.slot, slot);

        let mut resubmit = Vec::new();
        for (request, done) in retired {
            match classify_aborted(&done.status, done.actual_len) {
                Aborted::Resubmit => {
                    resubmit.push((request.slot, into_data(done.buffer, request.len)));
                }
                Aborted::Keep(status) => {
                    let buffer = into_data(done.buffer, request.len);
                    self.stash(request.slot, Completion { buffer, status });
                }
            }
        }
        trace!("Resubmitting {} aborted transfers", resubmit.len());
        for (slot, data) in resubmit {
            self.enqueue(slot, data);
        }

        let status = match classify_aborted(&done.status, done.actual_len) {
            Aborted::Keep(status) => status,
            Aborted::Resubmit => CompletionStatus::TimedOut,
        };
        Ok(Completion {
            buffer: into_data(done.buffer, head.len),
            status,
        })
    }
}

impl Transport for BulkTransport {
    fn submit(&mut self, slot: usize, buffer: Vec<u8>) -> Result<(), DeviceError> {
        if self.owns(slot) {
            warn!("Slot {} already has an outstanding request", slot);
            return Err(DeviceError::BulkIoError);
        }
        if buffer.is_empty() {
            return Err(DeviceError::BadDevice);
        }
        self.enqueue(slot, buffer);
        Ok(())
    }

    fn wait(&mut self, slot: usize, timeout: Duration) -> Result<Completion, DeviceError> {
        if let Some(completion) = self.take_ready(slot) {
            return Ok(completion);
        }

        match self.in_flight.front() {
            Some(head) if head.slot == slot => {}
            Some(head) => {
                warn!("Slot {} waited out of turn, slot {} is next", slot, head.slot);
                return Err(DeviceError::BulkIoError);
            }
            None => return Err(DeviceError::BulkIoError),
        }
        if self.endpoint.pending() == 0 {
            error!("Endpoint lost the request in slot {}", slot);
            return Err(DeviceError::BulkIoError);
        }

        match self.endpoint.wait_next_complete(timeout) {
            Some(done) => {
                let request = self.in_flight.pop_front().ok_or(DeviceError::BulkIoError)?;
                let buffer = into_data(done.buffer, request.len);
                Ok(match done.status {
                    Ok(()) => Completion::done(buffer, done.actual_len),
                    Err(e) => Completion::failed(buffer, e.to_string()),
                })
            }
            None => {
                debug!("Slot {} timed out after {:?}", slot, timeout);
                self.abort_head(slot)
            }
        }
    }

    fn cancel(&mut self, slot: usize) -> Option<Vec<u8>> {
        if let Some(completion) = self.take_ready(slot) {
            return Some(completion.buffer);
        }
        if !self.in_flight.iter().any(|r| r.slot == slot) {
            return None;
        }

        let retired = self.drain();
        self.stash_drained(retired);
        self.take_ready(slot).map(|completion| completion.buffer)
    }

    fn outstanding(&self) -> usize {
        self.in_flight.len() + self.ready.iter().filter(|r| r.is_some()).count()
    }
}

impl Drop for BulkTransport {
    fn drop(&mut self) {
        if !self.in_flight.is_empty() {
            let retired = self.drain();
            trace!("Retired {} transfers on drop", retired.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(kind: EndpointKind, is_in: bool) -> EndpointParams {
        EndpointParams {
            kind,
            is_in,
            max_packet_size: 1024,
            max_burst: 16,
            interface: 0,
            address: if is_in { 0x81 } else { 0x01 },
        }
    }

    #[test]
    fn test_streamable_endpoints() {
        assert_eq!(check_streamable(&endpoint(EndpointKind::Bulk, true)), Ok(()));
        assert_eq!(
            check_streamable(&endpoint(EndpointKind::Isochronous, true)),
            Err(DeviceError::DriverNotImplemented)
        );
        assert_eq!(
            check_streamable(&endpoint(EndpointKind::Bulk, false)),
            Err(DeviceError::BadDevice)
        );
        assert_eq!(
            check_streamable(&endpoint(EndpointKind::Interrupt, true)),
            Err(DeviceError::BadDevice)
        );
    }

    #[test]
    fn test_aborted_transfer_keeps_partial_data() {
        assert_eq!(
            classify_aborted(&Err(TransferError::Cancelled), 512),
            Aborted::Keep(CompletionStatus::Done(512))
        );
        assert_eq!(
            classify_aborted(&Ok(()), 0),
            Aborted::Keep(CompletionStatus::Done(0))
        );
    }

    #[test]
    fn test_aborted_empty_transfer_is_resubmitted() {
        assert_eq!(
            classify_aborted(&Err(TransferError::Cancelled), 0),
            Aborted::Resubmit
        );
        assert!(matches!(
            classify_aborted(&Err(TransferError::Stall), 0),
            Aborted::Keep(CompletionStatus::Failed(_))
        ));
    }
}
