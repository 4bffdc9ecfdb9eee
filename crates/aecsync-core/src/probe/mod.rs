//! Far-end reference probe
//!
//! The probe sits on the loudspeaker path. The far-end thread pushes every
//! buffer it plays with [`ReferenceProbe::ingest`]; the near-end thread asks,
//! once per period, what the speakers were emitting at a given running time
//! with [`ReferenceProbe::read`].
//!
//! ## Alignment
//!
//! The running time at which the next buffered frame reaches the speaker is
//!
//! ```text
//! play_time = prev_timestamp + distance / rate + latency
//! diff_ms   = play_time - desired_time
//! ```
//!
//! When `diff_ms` exceeds the negotiated delay the far end is ahead: the start
//! of the output block is left silent (`skip`). Otherwise the far end is
//! behind: stale frames are discarded from the buffer (`offset`). Both are
//! clamped so a read never takes more than one period of work and never waits
//! for data.

pub mod registry;

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::clock::{clock_diff, frames_to_time, ClockTime, MSECOND};
use crate::audio::format::{AudioFormat, FormatError};
use crate::audio::latency::{ExplicitMs, LatencyState};
use crate::audio::ring::SampleRing;
use crate::MAX_RETAINED_BYTES;

use registry::{ProbeRegistry, RegistryInner};

fn default_probe_name() -> String {
    "probe0".to_string()
}

/// Errors returned by probe reads
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("Probe not ready: latency or format unknown")]
    NotReady,
}

/// Probe configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProbeSettings {
    /// Registry key processors acquire the probe by
    #[serde(default = "default_probe_name")]
    pub name: String,
    /// Explicit loudspeaker latency in ms (-1 = from latency event)
    #[serde(default)]
    pub explicit_latency: ExplicitMs,
    /// Explicit far/near delay in ms (-1 = from upstream latency)
    #[serde(default)]
    pub explicit_delay: ExplicitMs,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            name: default_probe_name(),
            explicit_latency: ExplicitMs::Derive,
            explicit_delay: ExplicitMs::Derive,
        }
    }
}

/// One period of time-aligned far-end audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceBlock {
    /// Interleaved S16 bytes, `period_samples` frames at the probe's channel count
    pub data: Vec<u8>,
    /// Probe sample rate in Hz
    pub rate: u32,
    /// Probe channel count
    pub channels: u16,
    /// Delay in milliseconds in effect for this read
    pub delay_ms: u32,
}

/// State guarded by the probe lock
#[derive(Debug)]
struct ProbeState {
    format: Option<AudioFormat>,
    ring: SampleRing,
    latency: LatencyState,
    /// Toggled only by the registry
    acquired: bool,
}

/// Far-end reference probe
///
/// Created through [`ReferenceProbe::new`], which registers it; it stays in the
/// registry until the last `Arc` is dropped.
///
/// The probe lock protects format, buffer, latency, delay and the acquired
/// flag. It is always the innermost lock: callers may hold the registry lock
/// or a processor lock while taking it, never the other way around.
#[derive(Debug)]
pub struct ReferenceProbe {
    name: String,
    state: Mutex<ProbeState>,
    registry: Weak<RegistryInner>,
}

impl ReferenceProbe {
    /// Create a probe and register it
    ///
    /// # Example
    /// ```
    /// use aecsync_core::{ProbeRegistry, ProbeSettings, ReferenceProbe};
    ///
    /// let registry = ProbeRegistry::new();
    /// let probe = ReferenceProbe::new(ProbeSettings::default(), &registry);
    /// assert_eq!(probe.name(), "probe0");
    /// assert_eq!(registry.len(), 1);
    /// ```
    pub fn new(settings: ProbeSettings, registry: &ProbeRegistry) -> Arc<Self> {
        let probe = Arc::new(Self {
            name: settings.name,
            state: Mutex::new(ProbeState {
                format: None,
                ring: SampleRing::new(),
                latency: LatencyState::new(settings.explicit_latency, settings.explicit_delay),
                acquired: false,
            }),
            registry: registry.downgrade(),
        });
        registry.register(&probe);
        probe
    }

    /// Lock the probe state, recovering from a poisoned lock
    fn lock(&self) -> MutexGuard<'_, ProbeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Probe name (registry key)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Record the far-end format
    ///
    /// Fails when one period would exceed the engine's sample ceiling; the
    /// previous format, if any, is kept in that case.
    pub fn setup(&self, format: AudioFormat) -> Result<(), FormatError> {
        tracing::debug!(probe = %self.name, %format, "probe_setup");

        if let Err(e) = format.validate_period() {
            tracing::warn!(probe = %self.name, error = %e, "probe format rejected");
            return Err(e);
        }

        self.lock().format = Some(format);
        Ok(())
    }

    /// Append far-end audio stamped with its running time
    ///
    /// The oldest data is dropped once more than [`MAX_RETAINED_BYTES`] are
    /// buffered. With a known format the bound is rounded down to whole frames
    /// so trimming never splits a frame.
    pub fn ingest(&self, data: &[u8], running_time: Option<ClockTime>) {
        let mut state = self.lock();
        state.ring.push(data, running_time);

        let limit = match state.format {
            Some(format) => MAX_RETAINED_BYTES - MAX_RETAINED_BYTES % format.bytes_per_frame(),
            None => MAX_RETAINED_BYTES,
        };
        if state.ring.available() > limit {
            let excess = state.ring.available() - limit;
            state.ring.trim_to(limit);
            tracing::trace!(probe = %self.name, excess, "probe_trimmed");
        }
    }

    /// Apply a latency event
    ///
    /// # Arguments
    /// * `queried_latency` - Latency carried by the event
    /// * `upstream_latency` - Upstream minimum latency, if the query succeeded
    pub fn on_latency_event(&self, queried_latency: ClockTime, upstream_latency: Option<ClockTime>) {
        let (latency, delay_ms) = {
            let mut state = self.lock();
            state.latency.on_latency_event(queried_latency, upstream_latency);
            (state.latency.latency(), state.latency.delay_ms())
        };

        tracing::debug!(
            probe = %self.name,
            estimated_latency_ns = queried_latency,
            estimated_delay_ms = upstream_latency.unwrap_or(0) / MSECOND,
            latency_ns = ?latency,
            delay_ms,
            "latency_negotiated"
        );
    }

    /// Read one period of far-end audio aligned to `desired_time`
    ///
    /// Never blocks: missing audio is replaced by silence. Returns
    /// [`ProbeError::NotReady`] without touching the buffer while the latency
    /// or the format is unknown.
    ///
    /// # Arguments
    /// * `desired_time` - Running time of the near-end period
    /// * `period_samples` - Frames in the requested block
    pub fn read(&self, desired_time: ClockTime, period_samples: usize) -> Result<ReferenceBlock, ProbeError> {
        let mut state = self.lock();

        let (Some(latency), Some(format)) = (state.latency.latency(), state.format) else {
            return Err(ProbeError::NotReady);
        };

        let bpf = format.bytes_per_frame();
        let rate = format.rate() as i64;
        let delay = state.latency.delay_ms() as i64;
        let avail = state.ring.available() / bpf;

        let diff = if avail == 0 {
            i64::MAX
        } else {
            let (prev_timestamp, distance) = state.ring.prev_timestamp();
            match prev_timestamp {
                Some(timestamp) => {
                    let distance = (distance / bpf) as u64;
                    let play_time = timestamp
                        .saturating_add(frames_to_time(distance, format.rate()))
                        .saturating_add(latency);
                    clock_diff(desired_time, play_time) / MSECOND as i64
                }
                // No timestamp, assume perfect delay
                None => delay,
            }
        };

        let period = period_samples as i64;
        let (skip, offset) = if diff > delay {
            let skip = diff.saturating_sub(delay).saturating_mul(rate) / 1000;
            (skip.clamp(0, period), 0)
        } else {
            let offset = delay.saturating_sub(diff).saturating_mul(rate) / 1000;
            (0, offset.clamp(0, avail as i64))
        };
        let (skip, offset) = (skip as usize, offset as usize);
        let size = (avail - offset).min(period_samples - skip);

        tracing::trace!(
            probe = %self.name,
            desired_time,
            diff_ms = diff,
            delay_ms = delay,
            avail,
            skip,
            offset,
            size,
            "probe_read"
        );

        let mut data = vec![0u8; period_samples * bpf];
        if size > 0 {
            let start = skip * bpf;
            state
                .ring
                .copy_into(offset * bpf, &mut data[start..start + size * bpf]);
            state.ring.flush((offset + size) * bpf);
        }

        Ok(ReferenceBlock {
            data,
            rate: format.rate(),
            channels: format.channels(),
            delay_ms: delay as u32,
        })
    }

    /// Drop all buffered far-end audio
    pub fn stop(&self) {
        self.lock().ring.clear();
        tracing::debug!(probe = %self.name, "probe_stopped");
    }

    /// Current far-end format, if set
    pub fn format(&self) -> Option<AudioFormat> {
        self.lock().format
    }

    /// Current latency estimate, if known
    pub fn latency(&self) -> Option<ClockTime> {
        self.lock().latency.latency()
    }

    /// Current delay in milliseconds
    pub fn delay_ms(&self) -> u32 {
        self.lock().latency.delay_ms()
    }

    /// Buffered far-end bytes
    pub fn available(&self) -> usize {
        self.lock().ring.available()
    }

    /// Whether a processor currently holds this probe
    pub fn is_acquired(&self) -> bool {
        self.lock().acquired
    }

    /// Flip the acquired flag if it is clear; caller holds the registry lock
    fn try_mark_acquired(&self) -> bool {
        let mut state = self.lock();
        if state.acquired {
            return false;
        }
        state.acquired = true;
        true
    }

    fn clear_acquired(&self) {
        self.lock().acquired = false;
    }
}

impl Drop for ReferenceProbe {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self as *const ReferenceProbe);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::registry::ProbeRegistry;
    use super::*;
    use crate::audio::clock::SECOND;

    fn frames(count: usize, start: i16) -> Vec<u8> {
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

    fn ready_probe(registry: &ProbeRegistry, delay_ms: u32) -> std::sync::Arc<ReferenceProbe> {
        let settings = ProbeSettings {
            name: "far".to_string(),
            explicit_latency: ExplicitMs::Fixed(0),
            explicit_delay: ExplicitMs::Fixed(delay_ms),
        };
        let probe = ReferenceProbe::new(settings, registry);
        probe.setup(AudioFormat::new(16000, 1).unwrap()).unwrap();
        probe
    }

    #[test]
    fn test_not_ready_before_latency_event() {
        let registry = ProbeRegistry::new();
        let probe = ReferenceProbe::new(ProbeSettings::default(), &registry);
        probe.setup(AudioFormat::new(16000, 1).unwrap()).unwrap();
        probe.ingest(&frames(160, 0), Some(0));

        assert_eq!(probe.read(0, 160), Err(ProbeError::NotReady));
        assert_eq!(probe.available(), 320);
    }

    #[test]
    fn test_not_ready_without_format() {
        let registry = ProbeRegistry::new();
        let probe = ReferenceProbe::new(ProbeSettings::default(), &registry);
        probe.on_latency_event(0, None);
        assert_eq!(probe.read(0, 160), Err(ProbeError::NotReady));
    }

    #[test]
    fn test_setup_rejects_large_period() {
        let registry = ProbeRegistry::new();
        let probe = ReferenceProbe::new(ProbeSettings::default(), &registry);
        let format = AudioFormat::new(48000, 32).unwrap();
        assert!(matches!(
            probe.setup(format),
            Err(FormatError::PeriodTooLarge { .. })
        ));
        assert_eq!(probe.format(), None);
    }

    #[test]
    fn test_empty_buffer_reads_silence() {
        let registry = ProbeRegistry::new();
        let probe = ready_probe(&registry, 0);
        let block = probe.read(SECOND, 160).unwrap();
        assert_eq!(block.data, vec![0u8; 320]);
        assert_eq!(block.rate, 16000);
        assert_eq!(block.delay_ms, 0);
    }

    #[test]
    fn test_aligned_read_copies_front() {
        let registry = ProbeRegistry::new();
        let probe = ready_probe(&registry, 0);
        probe.ingest(&frames(320, 0), Some(SECOND));

        let block = probe.read(SECOND, 160).unwrap();
        assert_eq!(samples(&block.data), (0..160).collect::<Vec<i16>>());
        assert_eq!(probe.available(), 320);
    }

    #[test]
    fn test_far_end_behind_discards_stale_frames() {
        let registry = ProbeRegistry::new();
        let probe = ready_probe(&registry, 0);
        // Far end stamped 5ms before the desired time: 80 frames stale
        probe.ingest(&frames(400, 0), Some(SECOND - 5 * MSECOND));

        let block = probe.read(SECOND, 160).unwrap();
        assert_eq!(samples(&block.data), (80..240).collect::<Vec<i16>>());
        assert_eq!(probe.available(), (400 - 240) * 2);
    }

    #[test]
    fn test_missing_timestamp_assumes_alignment() {
        let registry = ProbeRegistry::new();
        let probe = ready_probe(&registry, 30);
        probe.ingest(&frames(160, 0), None);

        let block = probe.read(SECOND, 160).unwrap();
        assert_eq!(samples(&block.data), (0..160).collect::<Vec<i16>>());
        assert_eq!(block.delay_ms, 30);
    }

    #[test]
    fn test_ingest_bounds_buffer() {
        let registry = ProbeRegistry::new();
        let probe = ready_probe(&registry, 0);
        let chunk = vec![1u8; 300 * 1024];
        for i in 0..5 {
            probe.ingest(&chunk, Some(i * SECOND));
            assert!(probe.available() <= MAX_RETAINED_BYTES);
        }
        assert_eq!(probe.available(), MAX_RETAINED_BYTES);
    }

    #[test]
    fn test_trim_keeps_whole_frames() {
        let registry = ProbeRegistry::new();
        let settings = ProbeSettings {
            name: "far".to_string(),
            explicit_latency: ExplicitMs::Fixed(0),
            explicit_delay: ExplicitMs::Fixed(0),
        };
        let probe = ReferenceProbe::new(settings, &registry);
        let format = AudioFormat::new(16000, 3).unwrap();
        probe.setup(format).unwrap();

        // 6-byte frames do not divide the retention bound
        let frame: Vec<u8> = [1i16, 2, 3].iter().flat_map(|s| s.to_ne_bytes()).collect();
        let chunk = frame.repeat(16000);
        for _ in 0..12 {
            probe.ingest(&chunk, None);
        }

        let available = probe.available();
        assert!(available <= MAX_RETAINED_BYTES);
        assert_eq!(available % format.bytes_per_frame(), 0);
        assert!(available > MAX_RETAINED_BYTES - format.bytes_per_frame());

        let block = probe.read(SECOND, 160).unwrap();
        for channels in samples(&block.data).chunks_exact(3) {
            assert_eq!(channels, &[1, 2, 3]);
        }
    }

    #[test]
    fn test_stop_clears_buffer() {
        let registry = ProbeRegistry::new();
        let probe = ready_probe(&registry, 0);
        probe.ingest(&frames(160, 0), Some(0));
        probe.stop();
        assert_eq!(probe.available(), 0);
    }
}
