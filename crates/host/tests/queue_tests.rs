//! Transfer queue engine tests against the in-memory transport
//!
//! Run with: `cargo test -p host --test queue_tests`

use common::{DeviceError, EventBus, StreamCounters, StreamEvent};
use host::test_utils::{MockBehavior, MockTransport};
use host::usb::{CompletionStatus, MAX_QUEUE_SZ, QueueParams, ServiceError, TransferQueue};
use std::sync::Arc;
use std::time::Duration;

fn start(mock: MockTransport, params: QueueParams) -> (TransferQueue<MockTransport>, Arc<StreamCounters>) {
    let counters = Arc::new(StreamCounters::new());
    let queue = TransferQueue::start(mock, params, Arc::clone(&counters), EventBus::new())
        .expect("queue should start");
    (queue, counters)
}

// ============================================================================
// Sliding Window Tests
// ============================================================================

#[test]
fn test_outstanding_equals_queue_size() {
    for queue_size in 1..=MAX_QUEUE_SZ {
        let mock = MockTransport::new();
        let stats = mock.stats();
        let params = QueueParams::new(64, queue_size, Duration::from_millis(50));
        let (mut queue, _counters) = start(mock, params);

        assert_eq!(queue.outstanding(), queue_size);
        for _ in 0..(2 * queue_size) {
            queue.service_next(|_| {}).unwrap();
            assert_eq!(queue.outstanding(), queue_size);
        }
        assert_eq!(stats.max_outstanding(), queue_size);
    }
}

#[test]
fn test_resubmit_happens_before_consume() {
    let mock = MockTransport::new();
    let stats = mock.stats();
    let (mut queue, _counters) = start(mock, QueueParams::new(256, 8, Duration::from_millis(50)));

    for _ in 0..20 {
        let seen = Arc::clone(&stats);
        queue
            .service_next(|_| assert_eq!(seen.outstanding(), 8))
            .unwrap();
    }
}

#[test]
fn test_queue_size_clamped() {
    let (queue, _) = start(MockTransport::new(), QueueParams::new(64, 0, Duration::from_millis(10)));
    assert_eq!(queue.params().queue_size, 1);
    assert_eq!(queue.outstanding(), 1);

    let (queue, _) = start(
        MockTransport::new(),
        QueueParams::new(64, MAX_QUEUE_SZ + 10, Duration::from_millis(10)),
    );
    assert_eq!(queue.params().queue_size, MAX_QUEUE_SZ);
    assert_eq!(queue.outstanding(), MAX_QUEUE_SZ);
}

#[test]
fn test_zero_request_len_rejected() {
    let result = TransferQueue::start(
        MockTransport::new(),
        QueueParams::new(0, 4, Duration::from_millis(10)),
        Arc::new(StreamCounters::new()),
        EventBus::new(),
    );
    assert!(matches!(result, Err(DeviceError::BadDevice)));
}

#[test]
fn test_round_robin_keeps_pattern_order() {
    let (mut queue, _) = start(MockTransport::new(), QueueParams::new(100, 5, Duration::from_millis(50)));

    let mut received = Vec::new();
    for _ in 0..15 {
        queue.service_next(|data| received.extend_from_slice(data)).unwrap();
    }

    assert_eq!(received.len(), 1500);
    for (i, byte) in received.iter().enumerate() {
        assert_eq!(*byte, i as u8);
    }
}

#[test]
fn test_short_read_passes_valid_bytes_only() {
    let mock = MockTransport::new().with_script([MockBehavior::Short(100)]);
    let (mut queue, counters) = start(mock, QueueParams::new(1024, 2, Duration::from_millis(50)));

    let mut len = 0;
    let status = queue.service_next(|data| len = data.len()).unwrap();
    assert_eq!(status, CompletionStatus::Done(100));
    assert_eq!(len, 100);
    assert_eq!(counters.snapshot().bytes_xferred, 100);
}

// ============================================================================
// Stop Tests
// ============================================================================

#[test]
fn test_stop_retires_every_request() {
    let mock = MockTransport::new();
    let stats = mock.stats();
    let (mut queue, _) = start(mock, QueueParams::new(512, 16, Duration::from_millis(50)));

    for _ in 0..5 {
        queue.service_next(|_| {}).unwrap();
    }
    queue.stop();

    assert_eq!(queue.outstanding(), 0);
    assert_eq!(stats.outstanding(), 0);
    assert_eq!(stats.cancelled(), 16);
    assert!(queue.is_stopped());
    assert_eq!(queue.idle_buffers(), 17);

    let completed = stats.completed();
    let mut called = false;
    assert_eq!(
        queue.service_next(|_| called = true),
        Err(ServiceError::Stopped)
    );
    assert!(!called);
    assert_eq!(stats.completed(), completed);
}

#[test]
fn test_drop_stops_queue() {
    let mock = MockTransport::new();
    let stats = mock.stats();
    {
        let (mut queue, _) = start(mock, QueueParams::new(64, 4, Duration::from_millis(50)));
        queue.service_next(|_| {}).unwrap();
    }
    assert_eq!(stats.outstanding(), 0);
    assert_eq!(stats.cancelled(), 4);
}

// ============================================================================
// Counter and Bandwidth Tests
// ============================================================================

#[test]
fn test_ten_buffer_scenario() {
    let mock = MockTransport::new().with_delay(Duration::from_millis(110));
    let events = EventBus::new();
    let rx = events.subscribe();
    let counters = Arc::new(StreamCounters::new());
    let mut queue = TransferQueue::start(
        mock,
        QueueParams::new(1024, 4, Duration::from_millis(500)),
        Arc::clone(&counters),
        events,
    )
    .unwrap();

    for _ in 0..10 {
        let status = queue.service_next(|_| {}).unwrap();
        assert_eq!(status, CompletionStatus::Done(1024));
    }

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.bytes_xferred, 10240);
    assert_eq!(snapshot.successes, 10);
    assert_eq!(snapshot.failures, 0);
    assert_eq!(snapshot.bandwidth_reports, 1);

    let reports: Vec<u64> = rx
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            StreamEvent::Bandwidth { bytes_per_sec } => Some(bytes_per_sec),
            _ => None,
        })
        .collect();
    assert_eq!(reports.len(), 1);
    assert!(reports[0] > 0);
}

// ============================================================================
// Failure Escalation Tests
// ============================================================================

#[test]
fn test_failures_resubmit_and_count() {
    let mock = MockTransport::new().with_script([MockBehavior::TimedOut, MockBehavior::Failed]);
    let (mut queue, counters) = start(mock, QueueParams::new(64, 3, Duration::from_millis(10)));

    assert_eq!(queue.service_next(|_| {}), Ok(CompletionStatus::TimedOut));
    assert_eq!(queue.outstanding(), 3);
    assert!(matches!(
        queue.service_next(|_| {}),
        Ok(CompletionStatus::Failed(_))
    ));
    assert_eq!(queue.outstanding(), 3);
    assert_eq!(queue.service_next(|_| {}), Ok(CompletionStatus::Done(64)));

    let snapshot = counters.snapshot();
    assert_eq!(snapshot.failures, 2);
    assert_eq!(snapshot.successes, 1);
}

#[test]
fn test_failure_ratio_escalates() {
    let mock = MockTransport::new().with_fallback(MockBehavior::Failed);
    let params = QueueParams {
        failure_window: 4,
        failure_ratio: 0.5,
        ..QueueParams::new(64, 2, Duration::from_millis(10))
    };
    let (mut queue, counters) = start(mock, params);

    for _ in 0..3 {
        assert!(queue.service_next(|_| {}).is_ok());
    }
    assert_eq!(
        queue.service_next(|_| {}),
        Err(ServiceError::Escalated {
            failures: 4,
            window: 4
        })
    );
    assert_eq!(counters.snapshot().failures, 4);
}

#[test]
fn test_sparse_failures_do_not_escalate() {
    let script = (0..40).map(|i| {
        if i % 4 == 0 {
            MockBehavior::Failed
        } else {
            MockBehavior::Data
        }
    });
    let mock = MockTransport::new().with_script(script);
    let params = QueueParams {
        failure_window: 8,
        failure_ratio: 0.5,
        ..QueueParams::new(64, 4, Duration::from_millis(10))
    };
    let (mut queue, counters) = start(mock, params);

    for _ in 0..40 {
        assert!(queue.service_next(|_| {}).is_ok());
    }
    assert_eq!(counters.snapshot().failures, 10);
}

// ============================================================================
// Transport Failure Tests
// ============================================================================

#[test]
fn test_lost_request_is_transport_failure() {
    let mock = MockTransport::new().with_script([MockBehavior::Lost]);
    let (mut queue, counters) = start(mock, QueueParams::new(64, 4, Duration::from_millis(10)));

    let mut called = false;
    let result = queue.service_next(|_| called = true);
    assert_eq!(result, Err(ServiceError::Transport(DeviceError::BulkIoError)));
    assert_eq!(
        result.unwrap_err().device_error(),
        DeviceError::BulkIoError
    );
    assert!(!called);

    // Nothing was recorded against the failure window
    let snapshot = counters.snapshot();
    assert_eq!(snapshot.failures, 0);
    assert_eq!(snapshot.successes, 0);
}

#[test]
fn test_refused_resubmit_returns_buffer_to_pool() {
    let mock = MockTransport::new().with_submit_limit(4);
    let stats = mock.stats();
    let (mut queue, counters) = start(mock, QueueParams::new(64, 4, Duration::from_millis(10)));
    assert_eq!(queue.idle_buffers(), 1);

    let mut called = false;
    assert_eq!(
        queue.service_next(|_| called = true),
        Err(ServiceError::Transport(DeviceError::NoDeviceFound))
    );
    assert!(!called);
    assert_eq!(stats.rejected(), 1);
    assert_eq!(counters.snapshot().successes, 0);

    // The completed buffer went back to the pool in place of the spare
    assert_eq!(queue.idle_buffers(), 1);
    queue.stop();
    assert_eq!(queue.idle_buffers(), 4);
}
