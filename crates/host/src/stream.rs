//! Streaming session controller
//!
//! Owns the session state machine (`Idle -> Starting -> Streaming -> Stopping
//! -> Idle`) and the dedicated completion thread that drains the transfer
//! queue, verifies link integrity and feeds the data processor.

use crate::usb::integrity::LinkIntegrityChecker;
use crate::usb::queue::{QueueParams, ServiceError, TransferQueue};
use crate::usb::transport::Transport;
use common::{DeviceError, EventBus, StopReason, StreamCounters, StreamEvent};
use processor::{DataProcessor, words_from_bytes};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Idle,
    Starting,
    Streaming,
    Stopping,
}

/// Per-session behavior of the completion loop
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Check every buffer against the incrementing test pattern
    pub verify_pattern: bool,
    /// Publish each decoded buffer as a `Samples` event
    pub forward_samples: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// State shared with the completion thread
struct Shared {
    state: Mutex<StreamState>,
    run: AtomicBool,
    counters: Arc<StreamCounters>,
    integrity: Arc<LinkIntegrityChecker>,
    processor: Arc<Mutex<DataProcessor>>,
    events: EventBus,
}

pub struct StreamController {
    shared: Arc<Shared>,
    options: StreamOptions,
    thread: Option<JoinHandle<()>>,
}

impl StreamController {
    pub fn new(
        events: EventBus,
        processor: Arc<Mutex<DataProcessor>>,
        integrity: Arc<LinkIntegrityChecker>,
        options: StreamOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(StreamState::Idle),
                run: AtomicBool::new(false),
                counters: Arc::new(StreamCounters::new()),
                integrity,
                processor,
                events,
            }),
            options,
            thread: None,
        }
    }

    pub fn state(&self) -> StreamState {
        *lock(&self.shared.state)
    }

    pub fn is_streaming(&self) -> bool {
        self.state() == StreamState::Streaming
    }

    pub fn counters(&self) -> Arc<StreamCounters> {
        Arc::clone(&self.shared.counters)
    }

    pub fn integrity(&self) -> Arc<LinkIntegrityChecker> {
        Arc::clone(&self.shared.integrity)
    }

    pub fn processor(&self) -> Arc<Mutex<DataProcessor>> {
        Arc::clone(&self.shared.processor)
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    /// Takes effect on the next `start`
    pub fn set_options(&mut self, options: StreamOptions) {
        self.options = options;
    }

    /// Start a session over `transport`
    ///
    /// Fails with `SessionActive` unless the controller is idle. Counters and
    /// integrity state are reset before the first request is submitted.
    pub fn start<T>(&mut self, transport: T, params: QueueParams) -> Result<(), DeviceError>
    where
        T: Transport + 'static,
    {
        {
            let mut state = lock(&self.shared.state);
            if *state != StreamState::Idle {
                warn!("Start requested while {:?}", *state);
                return Err(DeviceError::SessionActive);
            }
            *state = StreamState::Starting;
        }

        // A session that stopped on its own leaves a finished thread behind
        self.reap();

        self.shared.counters.reset();
        self.shared.integrity.reset();

        let queue = match TransferQueue::start(
            transport,
            params,
            Arc::clone(&self.shared.counters),
            self.shared.events.clone(),
        ) {
            Ok(queue) => queue,
            Err(e) => {
                error!("Failed to start transfer queue: {}", e);
                *lock(&self.shared.state) = StreamState::Idle;
                return Err(e);
            }
        };

        self.shared.run.store(true, Ordering::Release);
        *lock(&self.shared.state) = StreamState::Streaming;

        let shared = Arc::clone(&self.shared);
        let options = self.options;
        let spawned = std::thread::Builder::new()
            .name("fx3-stream".to_string())
            .spawn(move || run_stream(queue, shared, options));

        match spawned {
            Ok(handle) => {
                self.thread = Some(handle);
                self.shared
                    .events
                    .message(format!("Streaming started ({:?})", self.options));
                Ok(())
            }
            Err(e) => {
                error!("Failed to spawn streaming thread: {}", e);
                self.shared.run.store(false, Ordering::Release);
                *lock(&self.shared.state) = StreamState::Idle;
                Err(DeviceError::BulkIoError)
            }
        }
    }

    /// Stop the running session and wait for every request to retire
    ///
    /// Stopping an idle controller is a no-op.
    pub fn stop(&mut self) -> Result<(), DeviceError> {
        {
            let mut state = lock(&self.shared.state);
            match *state {
                StreamState::Streaming => *state = StreamState::Stopping,
                StreamState::Idle => {
                    drop(state);
                    self.reap();
                    return Ok(());
                }
                other => {
                    debug!("Stop requested while {:?}", other);
                }
            }
        }

        self.shared.run.store(false, Ordering::Release);
        self.reap();
        *lock(&self.shared.state) = StreamState::Idle;
        Ok(())
    }

    /// `true` starts through `make_transport`, `false` stops
    pub fn start_stop<T, F>(
        &mut self,
        start: bool,
        params: QueueParams,
        make_transport: F,
    ) -> Result<(), DeviceError>
    where
        T: Transport + 'static,
        F: FnOnce() -> Result<T, DeviceError>,
    {
        if start {
            if self.state() != StreamState::Idle {
                return Err(DeviceError::SessionActive);
            }
            let transport = make_transport()?;
            self.start(transport, params)
        } else {
            self.stop()
        }
    }

    fn reap(&mut self) {
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            error!("Streaming thread panicked");
        }
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

fn run_stream<T: Transport>(mut queue: TransferQueue<T>, shared: Arc<Shared>, options: StreamOptions) {
    info!("Streaming thread started");

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        stream_loop(&mut queue, &shared, options)
    }));

    let reason = result.unwrap_or_else(|e| {
        error!("Panic in streaming loop: {:?}", e);
        StopReason::TransportFailure
    });

    queue.stop();
    drop(queue);

    shared.run.store(false, Ordering::Release);
    *lock(&shared.state) = StreamState::Idle;

    let snapshot = shared.counters.snapshot();
    info!(
        "Streaming stopped ({:?}): {} bytes, {} ok, {} failed",
        reason, snapshot.bytes_xferred, snapshot.successes, snapshot.failures
    );
    shared.events.publish(StreamEvent::StreamStopped { reason });
}

fn stream_loop<T: Transport>(
    queue: &mut TransferQueue<T>,
    shared: &Shared,
    options: StreamOptions,
) -> StopReason {
    loop {
        if !shared.run.load(Ordering::Acquire) {
            return StopReason::Requested;
        }

        let mut fault = None;
        let serviced = queue.service_next(|data| {
            if options.verify_pattern
                && let Err(e) = shared.integrity.check(data)
            {
                fault = Some(e);
            }

            let words = words_from_bytes(data);
            if options.forward_samples {
                shared
                    .events
                    .publish(StreamEvent::Samples(Arc::from(words.as_slice())));
            }
            lock(&shared.processor).process_data(&words);
        });

        match serviced {
            Ok(_) => {}
            Err(escalated @ ServiceError::Escalated { .. }) => {
                shared.events.message(format!(
                    "Too many errors: {} ({})",
                    escalated.device_error().description(),
                    escalated
                ));
                return StopReason::TooManyTransferErrors;
            }
            Err(e) => {
                error!("Streaming aborted: {}", e);
                shared.events.message(format!("Streaming aborted: {}", e));
                return StopReason::TransportFailure;
            }
        }

        if let Some(e) = fault {
            shared
                .events
                .message(format!("Too many errors: {}", e.description()));
            return StopReason::TooManyFirmwareErrors;
        }
    }
}
