//! E2E tests for far-end reference alignment
//!
//! Drives a probe the way the far-end and near-end threads do and checks the
//! blocks handed back for each near-end period:
//! - readiness before and after the latency event
//! - the skip/offset boundary when the far end is exactly on time
//! - drift correction when the far end runs ahead or behind
//! - the retained-bytes bound and the shortfall zero fill

use aecsync_core::audio::latency::ExplicitMs;
use aecsync_core::{
    AudioFormat, ProbeError, ProbeRegistry, ProbeSettings, ReferenceProbe, SampleRing,
    MAX_RETAINED_BYTES, MSECOND, SECOND,
};
use std::sync::Arc;

const RATE: u32 = 16000;
const PERIOD: usize = 160;

/// Mono S16 frames whose values count up from `start`
fn counting(count: usize, start: i16) -> Vec<u8> {
    (0..count)
        .flat_map(|i| (start + i as i16).to_ne_bytes())
        .collect()
}

fn samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_ne_bytes([pair[0], pair[1]]))
        .collect()
}

fn probe_with(registry: &ProbeRegistry, latency_ms: u32, delay_ms: u32) -> Arc<ReferenceProbe> {
    let probe = ReferenceProbe::new(
        ProbeSettings {
            name: "speakers".to_string(),
            explicit_latency: ExplicitMs::Fixed(latency_ms),
            explicit_delay: ExplicitMs::Fixed(delay_ms),
        },
        registry,
    );
    probe.setup(AudioFormat::new(RATE, 1).unwrap()).unwrap();
    probe
}

// ============================================================================
// READINESS
// ============================================================================

#[test]
fn test_read_not_ready_until_latency_event() {
    let registry = ProbeRegistry::new();
    let probe = ReferenceProbe::new(ProbeSettings::default(), &registry);
    probe.setup(AudioFormat::new(RATE, 1).unwrap()).unwrap();
    probe.ingest(&counting(PERIOD, 0), Some(0));

    assert_eq!(probe.read(0, PERIOD), Err(ProbeError::NotReady));
    assert_eq!(probe.available(), PERIOD * 2, "nothing consumed while not ready");

    probe.on_latency_event(0, Some(20 * MSECOND));
    assert_eq!(probe.latency(), Some(0));
    assert_eq!(probe.delay_ms(), 20);
    assert!(probe.read(0, PERIOD).is_ok());
}

#[test]
fn test_explicit_values_win_over_latency_event() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 30, 15);
    probe.on_latency_event(5 * MSECOND, Some(80 * MSECOND));
    assert_eq!(probe.latency(), Some(30 * MSECOND));
    assert_eq!(probe.delay_ms(), 15);
}

// ============================================================================
// SKIP / OFFSET BOUNDARY
// ============================================================================

#[test]
fn test_diff_equal_to_delay_takes_offset_branch() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 20);
    // Front plays exactly `delay` after the desired time
    probe.ingest(&counting(2 * PERIOD, 0), Some(SECOND + 20 * MSECOND));

    let block = probe.read(SECOND, PERIOD).unwrap();
    assert_eq!(samples(&block.data), (0..PERIOD as i16).collect::<Vec<_>>());
    assert_eq!(block.delay_ms, 20);
    assert_eq!(probe.available(), PERIOD * 2);
}

#[test]
fn test_far_end_ahead_leaves_leading_silence() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);
    probe.ingest(&counting(2 * PERIOD, 0), Some(SECOND + 5 * MSECOND));

    let block = probe.read(SECOND, PERIOD).unwrap();
    let got = samples(&block.data);
    // 5ms at 16kHz: 80 frames of silence, then the front of the buffer
    assert!(got[..80].iter().all(|&s| s == 0));
    assert_eq!(&got[80..], (0..80).collect::<Vec<i16>>().as_slice());
    assert_eq!(probe.available(), (2 * PERIOD - 80) * 2);
}

#[test]
fn test_far_end_far_ahead_reads_silence_without_consuming() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);
    probe.ingest(&counting(PERIOD, 1), Some(SECOND + 50 * MSECOND));

    let block = probe.read(SECOND, PERIOD).unwrap();
    assert_eq!(block.data, vec![0u8; PERIOD * 2]);
    assert_eq!(probe.available(), PERIOD * 2);
}

#[test]
fn test_latency_shifts_play_time() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 10, 0);
    // Pushed 10ms before the desired time, played exactly at it
    probe.ingest(&counting(PERIOD, 0), Some(SECOND - 10 * MSECOND));

    let block = probe.read(SECOND, PERIOD).unwrap();
    assert_eq!(samples(&block.data), (0..PERIOD as i16).collect::<Vec<_>>());
    assert_eq!(probe.available(), 0);
}

// ============================================================================
// DRIFT CORRECTION
// ============================================================================

#[test]
fn test_ahead_then_realigned() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);
    probe.ingest(&counting(4 * PERIOD, 0), Some(SECOND + 5 * MSECOND));

    let first = samples(&probe.read(SECOND, PERIOD).unwrap().data);
    assert_eq!(&first[80..], (0..80).collect::<Vec<i16>>().as_slice());

    // Next period continues right after the copied frames
    let second = samples(&probe.read(SECOND + 10 * MSECOND, PERIOD).unwrap().data);
    assert_eq!(second, (80..240).collect::<Vec<i16>>());

    let third = samples(&probe.read(SECOND + 20 * MSECOND, PERIOD).unwrap().data);
    assert_eq!(third, (240..400).collect::<Vec<i16>>());
}

#[test]
fn test_behind_then_realigned() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);
    // 12ms stale: 192 frames must be dropped
    probe.ingest(&counting(5 * PERIOD, 0), Some(SECOND - 12 * MSECOND));

    let first = samples(&probe.read(SECOND, PERIOD).unwrap().data);
    assert_eq!(first, (192..352).collect::<Vec<i16>>());

    let second = samples(&probe.read(SECOND + 10 * MSECOND, PERIOD).unwrap().data);
    assert_eq!(second, (352..512).collect::<Vec<i16>>());
}

#[test]
fn test_steady_stream_stays_aligned() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);

    for period in 0..50u64 {
        let start = (period as usize * PERIOD) as i16;
        probe.ingest(&counting(PERIOD, start), Some(period * 10 * MSECOND));
        let block = samples(&probe.read(period * 10 * MSECOND, PERIOD).unwrap().data);
        assert_eq!(block[0], start, "period {} misaligned", period);
        assert_eq!(block[PERIOD - 1], start + PERIOD as i16 - 1);
    }
    assert_eq!(probe.available(), 0);
}

#[test]
fn test_all_stale_reads_silence_without_consuming() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);
    probe.ingest(&counting(PERIOD, 1), Some(0));

    let block = probe.read(SECOND, PERIOD).unwrap();
    assert_eq!(block.data, vec![0u8; PERIOD * 2]);
    assert_eq!(probe.available(), PERIOD * 2);
}

#[test]
fn test_stale_frames_dropped_once_fresh_data_arrives() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);
    probe.ingest(&counting(PERIOD, 1), Some(0));

    // 20ms behind with only 10ms buffered
    let block = probe.read(20 * MSECOND, PERIOD).unwrap();
    assert_eq!(block.data, vec![0u8; PERIOD * 2]);
    assert_eq!(probe.available(), PERIOD * 2);

    probe.ingest(&counting(2 * PERIOD, 161), Some(10 * MSECOND));

    // The 320 stale frames are dropped and the next 160 are returned
    let block = probe.read(20 * MSECOND, PERIOD).unwrap();
    assert_eq!(samples(&block.data), (321..=480).collect::<Vec<i16>>());
    assert_eq!(probe.available(), 0);
}

// ============================================================================
// BUFFER BOUNDS
// ============================================================================

#[test]
fn test_retained_bytes_bounded() {
    let registry = ProbeRegistry::new();
    let probe = probe_with(&registry, 0, 0);
    let chunk = vec![0u8; 64 * 1024];

    for i in 0..64u64 {
        probe.ingest(&chunk, Some(i * SECOND));
        assert!(probe.available() <= MAX_RETAINED_BYTES);
    }
    assert_eq!(probe.available(), MAX_RETAINED_BYTES);
}

#[test]
fn test_take_shortfall_zero_fills_front() {
    let mut ring = SampleRing::new();
    ring.push(&[1, 2, 3], Some(0));

    assert_eq!(ring.take(8), vec![0, 0, 0, 0, 0, 1, 2, 3]);
    assert_eq!(ring.available(), 0);
    assert_eq!(ring.take(2), vec![0, 0]);
}
