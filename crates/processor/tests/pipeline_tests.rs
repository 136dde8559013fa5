//! DataProcessor pipeline integration tests
//!
//! Exercises the processor through its public surface with a subscribed
//! event bus, the way the streaming loop drives it.
//!
//! Run with: `cargo test -p processor --test pipeline_tests`

use common::{EventBus, EventReceiver, StreamEvent};
use processor::{DataProcessor, ProcessorSettings};

fn processor_with_bus(settings: ProcessorSettings) -> (DataProcessor, EventReceiver) {
    let bus = EventBus::new();
    let rx = bus.subscribe_with_capacity(4096);
    (DataProcessor::new(bus, &settings), rx)
}

fn count_aborts(events: &[StreamEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, StreamEvent::DumpAborted { .. }))
        .count()
}

// ============================================================================
// File Dump Tests
// ============================================================================

#[test]
fn test_dump_limit_100_with_150_words() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let (mut proc, rx) = processor_with_bus(ProcessorSettings::default());

    proc.enable_file_dump(true, &path, 100).unwrap();
    let words: Vec<u16> = (0..150u16).map(|i| 0xAB00 | i).collect();
    proc.process_data(&words);

    let events = rx.drain();
    assert_eq!(count_aborts(&events), 1);
    assert!(!proc.is_dumping());

    let contents = std::fs::read(&path).unwrap();
    assert_eq!(contents.len(), 100);
    let expected: Vec<u8> = (0..100u8).collect();
    assert_eq!(contents, expected);
}

#[test]
fn test_dump_abort_fires_once_across_buffers() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let (mut proc, rx) = processor_with_bus(ProcessorSettings::default());

    proc.enable_file_dump(true, &path, 100).unwrap();
    for _ in 0..10 {
        proc.process_data(&[0x55u16; 30]);
    }

    let events = rx.drain();
    assert_eq!(count_aborts(&events), 1);
    assert!(events.iter().any(
        |e| matches!(e, StreamEvent::DumpAborted { bytes } if *bytes == 100)
    ));
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 100);
}

#[test]
fn test_dump_limit_reached_exactly_at_buffer_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let (mut proc, rx) = processor_with_bus(ProcessorSettings::default());

    proc.enable_file_dump(true, &path, 64).unwrap();
    proc.process_data(&[1u16; 64]);

    assert_eq!(count_aborts(&rx.drain()), 1);
    assert!(!proc.is_dumping());
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 64);
}

#[test]
fn test_unlimited_dump_keeps_running() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let (mut proc, rx) = processor_with_bus(ProcessorSettings::default());

    proc.enable_file_dump(true, &path, 0).unwrap();
    for _ in 0..5 {
        proc.process_data(&[2u16; 1000]);
    }
    assert_eq!(proc.dump_count(), Some(5000));
    proc.enable_file_dump(false, &path, 0).unwrap();

    assert_eq!(count_aborts(&rx.drain()), 0);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 5000);
}

#[test]
fn test_dump_can_be_restarted_after_abort() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let (mut proc, _rx) = processor_with_bus(ProcessorSettings::default());

    proc.enable_file_dump(true, &path, 10).unwrap();
    proc.process_data(&[1u16; 20]);
    assert!(!proc.is_dumping());

    proc.enable_file_dump(true, &path, 5).unwrap();
    proc.process_data(&[2u16; 20]);
    assert_eq!(std::fs::read(&path).unwrap(), vec![2u8; 5]);
}

// ============================================================================
// Spectrum Tests
// ============================================================================

#[test]
fn test_fft_runs_every_kth_buffer() {
    let settings = ProcessorSettings {
        fft_window: 128,
        ..ProcessorSettings::default()
    };
    let (mut proc, rx) = processor_with_bus(settings);
    proc.enable_fft_calc(true, 4, [true, false, false, false]);

    let words = vec![0u16; 256];
    let mut hits = Vec::new();
    for call in 1..=12 {
        proc.process_data(&words);
        let emitted = rx
            .drain()
            .into_iter()
            .filter(|e| matches!(e, StreamEvent::Spectrum { .. }))
            .count();
        if emitted > 0 {
            hits.push(call);
        }
    }
    assert_eq!(hits, vec![4, 8, 12]);
}

#[test]
fn test_fft_spectrum_is_half_window() {
    let settings = ProcessorSettings {
        fft_window: 512,
        ..ProcessorSettings::default()
    };
    let (mut proc, rx) = processor_with_bus(settings);
    proc.enable_fft_calc(true, 1, [true, true, true, true]);

    proc.process_data(&vec![0b1110_0100u16; 512]);

    let mut channels = Vec::new();
    for event in rx.drain() {
        if let StreamEvent::Spectrum { channel, bins } = event {
            assert_eq!(bins.len(), 256);
            channels.push(channel);
        }
    }
    assert_eq!(channels, vec![0, 1, 2, 3]);
}

#[test]
fn test_fft_disable_stops_emission() {
    let settings = ProcessorSettings {
        fft_window: 32,
        ..ProcessorSettings::default()
    };
    let (mut proc, rx) = processor_with_bus(settings);
    proc.enable_fft_calc(true, 1, [true; 4]);
    proc.process_data(&[0u16; 32]);
    assert!(!rx.drain().is_empty());

    proc.enable_fft_calc(false, 1, [true; 4]);
    proc.process_data(&[0u16; 32]);
    assert!(rx.drain().is_empty());
}

// ============================================================================
// Pipeline Ordering Tests
// ============================================================================

#[test]
fn test_all_pipelines_see_same_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("capture.bin");
    let settings = ProcessorSettings {
        fill_threshold: 63,
        fft_window: 64,
    };
    let (mut proc, rx) = processor_with_bus(settings);

    proc.enable_fill_calc(true);
    proc.enable_file_dump(true, &path, 0).unwrap();
    proc.enable_fft_calc(true, 1, [true, false, false, false]);

    proc.process_data(&[0x00E4u16; 64]);
    let events = rx.drain();

    let fill_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Fill(_)))
        .expect("fill report");
    let fft_pos = events
        .iter()
        .position(|e| matches!(e, StreamEvent::Spectrum { .. }))
        .expect("spectrum");
    assert!(fill_pos < fft_pos);
    assert_eq!(proc.dump_count(), Some(64));
}
