//! Test utilities for exercising the engine without hardware
//!
//! [`MockTransport`] completes requests in memory, filling buffers with the
//! incrementing self-test pattern. Timeouts, failures, gaps and short reads
//! can be scripted per completion.

use crate::usb::transport::{Completion, Transport};
use common::DeviceError;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Outcome of one mocked completion
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    /// Fill the whole buffer with the pattern
    Data,
    /// Skip `n` pattern values, then fill the whole buffer
    Gap(u8),
    /// Fill only the first `n` bytes
    Short(usize),
    TimedOut,
    Failed,
    /// `wait` fails and the request's buffer is gone
    Lost,
}

/// Counters shared between a [`MockTransport`] and the test
#[derive(Debug, Default)]
pub struct MockStats {
    submitted: AtomicUsize,
    completed: AtomicUsize,
    cancelled: AtomicUsize,
    lost: AtomicUsize,
    rejected: AtomicUsize,
    outstanding: AtomicUsize,
    max_outstanding: AtomicUsize,
}

impl MockStats {
    pub fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn lost(&self) -> usize {
        self.lost.load(Ordering::SeqCst)
    }

    /// Submissions refused by the submit limit
    pub fn rejected(&self) -> usize {
        self.rejected.load(Ordering::SeqCst)
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    fn on_submit(&self) {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        let now = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_outstanding.fetch_max(now, Ordering::SeqCst);
    }

    fn on_retire(&self, counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::SeqCst);
        self.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory transport producing the incrementing byte pattern
pub struct MockTransport {
    pending: Vec<Option<Vec<u8>>>,
    script: VecDeque<MockBehavior>,
    fallback: MockBehavior,
    next_byte: u8,
    delay: Duration,
    submit_limit: Option<usize>,
    stats: Arc<MockStats>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            script: VecDeque::new(),
            fallback: MockBehavior::Data,
            next_byte: 0,
            delay: Duration::ZERO,
            submit_limit: None,
            stats: Arc::new(MockStats::default()),
        }
    }

    /// Each wait takes at least `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Behaviors for the next completions, in order
    pub fn with_script(mut self, script: impl IntoIterator<Item = MockBehavior>) -> Self {
        self.script.extend(script);
        self
    }

    /// Behavior once the script is exhausted
    pub fn with_fallback(mut self, fallback: MockBehavior) -> Self {
        self.fallback = fallback;
        self
    }

    /// Refuse every submission after the first `limit`
    pub fn with_submit_limit(mut self, limit: usize) -> Self {
        self.submit_limit = Some(limit);
        self
    }

    pub fn stats(&self) -> Arc<MockStats> {
        Arc::clone(&self.stats)
    }

    fn fill(&mut self, buffer: &mut [u8]) {
        for byte in buffer {
            *byte = self.next_byte;
            self.next_byte = self.next_byte.wrapping_add(1);
        }
    }
}

impl Transport for MockTransport {
    fn submit(&mut self, slot: usize, buffer: Vec<u8>) -> Result<(), DeviceError> {
        if self.pending.len() <= slot {
            self.pending.resize_with(slot + 1, || None);
        }
        if self.pending[slot].is_some() {
            return Err(DeviceError::BulkIoError);
        }
        if self
            .submit_limit
            .is_some_and(|limit| self.stats.submitted() >= limit)
        {
            self.stats.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(DeviceError::NoDeviceFound);
        }
        self.pending[slot] = Some(buffer);
        self.stats.on_submit();
        Ok(())
    }

    fn wait(&mut self, slot: usize, timeout: Duration) -> Result<Completion, DeviceError> {
        let started = Instant::now();
        let mut buffer = self
            .pending
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or(DeviceError::BulkIoError)?;

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }

        let behavior = self
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        self.stats.on_retire(&self.stats.completed);

        let completion = match behavior {
            MockBehavior::Data => {
                let len = buffer.len();
                self.fill(&mut buffer);
                Completion::done(buffer, len)
            }
            MockBehavior::Gap(skip) => {
                self.next_byte = self.next_byte.wrapping_add(skip);
                let len = buffer.len();
                self.fill(&mut buffer);
                Completion::done(buffer, len)
            }
            MockBehavior::Short(n) => {
                let len = n.min(buffer.len());
                self.fill(&mut buffer[..len]);
                Completion::done(buffer, len)
            }
            MockBehavior::TimedOut => {
                let elapsed = started.elapsed();
                if elapsed < timeout && self.delay.is_zero() {
                    std::thread::sleep((timeout - elapsed).min(Duration::from_millis(5)));
                }
                Completion::timed_out(buffer)
            }
            MockBehavior::Failed => Completion::failed(buffer, "injected failure"),
            MockBehavior::Lost => {
                self.stats.lost.fetch_add(1, Ordering::SeqCst);
                return Err(DeviceError::BulkIoError);
            }
        };
        Ok(completion)
    }

    fn cancel(&mut self, slot: usize) -> Option<Vec<u8>> {
        let buffer = self.pending.get_mut(slot).and_then(Option::take)?;
        self.stats.on_retire(&self.stats.cancelled);
        Some(buffer)
    }

    fn outstanding(&self) -> usize {
        self.pending.iter().filter(|p| p.is_some()).count()
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usb::transport::CompletionStatus;

    #[test]
    fn test_mock_pattern_continues_across_slots() {
        let mut mock = MockTransport::new();
        mock.submit(0, vec![0; 200]).unwrap();
        mock.submit(1, vec![0; 100]).unwrap();
        assert_eq!(mock.outstanding(), 2);

        let first = mock.wait(0, Duration::from_millis(10)).unwrap();
        let second = mock.wait(1, Duration::from_millis(10)).unwrap();
        assert_eq!(first.buffer[199], 199);
        assert_eq!(second.buffer[0], 200);
        assert_eq!(second.buffer[99], 43);
        assert_eq!(mock.outstanding(), 0);
    }

    #[test]
    fn test_mock_rejects_double_submit_and_idle_wait() {
        let mut mock = MockTransport::new();
        mock.submit(0, vec![0; 4]).unwrap();
        assert_eq!(mock.submit(0, vec![0; 4]), Err(DeviceError::BulkIoError));
        assert!(mock.wait(1, Duration::from_millis(1)).is_err());
    }

    #[test]
    fn test_mock_script_then_fallback() {
        let mut mock = MockTransport::new()
            .with_script([MockBehavior::Failed, MockBehavior::Short(3)])
            .with_fallback(MockBehavior::TimedOut);
        let stats = mock.stats();

        let mut statuses = Vec::new();
        for _ in 0..3 {
            mock.submit(0, vec![0; 8]).unwrap();
            statuses.push(mock.wait(0, Duration::from_millis(1)).unwrap().status);
        }

        assert!(matches!(statuses[0], CompletionStatus::Failed(_)));
        assert_eq!(statuses[1], CompletionStatus::Done(3));
        assert_eq!(statuses[2], CompletionStatus::TimedOut);
        assert_eq!(stats.submitted(), 3);
        assert_eq!(stats.completed(), 3);
        assert_eq!(stats.max_outstanding(), 1);
    }

    #[test]
    fn test_mock_gap_skips_values() {
        let mut mock = MockTransport::new().with_script([MockBehavior::Data, MockBehavior::Gap(5)]);
        mock.submit(0, vec![0; 4]).unwrap();
        mock.submit(1, vec![0; 4]).unwrap();
        let first = mock.wait(0, Duration::from_millis(1)).unwrap();
        let second = mock.wait(1, Duration::from_millis(1)).unwrap();
        assert_eq!(first.buffer, vec![0, 1, 2, 3]);
        assert_eq!(second.buffer, vec![9, 10, 11, 12]);
    }

    #[test]
    fn test_mock_lost_request_and_submit_limit() {
        let mut mock = MockTransport::new()
            .with_script([MockBehavior::Lost])
            .with_submit_limit(2);
        let stats = mock.stats();

        mock.submit(0, vec![0; 4]).unwrap();
        mock.submit(1, vec![0; 4]).unwrap();
        assert_eq!(mock.submit(2, vec![0; 4]), Err(DeviceError::NoDeviceFound));
        assert_eq!(stats.rejected(), 1);

        assert_eq!(
            mock.wait(0, Duration::from_millis(1)).map(|c| c.status),
            Err(DeviceError::BulkIoError)
        );
        assert_eq!(stats.lost(), 1);
        assert_eq!(mock.outstanding(), 1);
        assert!(mock.wait(1, Duration::from_millis(1)).is_ok());
    }

    #[test]
    fn test_mock_cancel() {
        let mut mock = MockTransport::new();
        let stats = mock.stats();
        mock.submit(3, vec![0; 8]).unwrap();
        assert_eq!(mock.cancel(3).map(|b| b.len()), Some(8));
        assert!(mock.cancel(3).is_none());
        assert_eq!(stats.cancelled(), 1);
        assert_eq!(stats.outstanding(), 0);
    }
}
