//! Near-end period processor
//!
//! The processor sits on the microphone path. It buffers near-end audio, cuts
//! it into 10ms periods, fetches the matching far-end reference from the probe
//! it acquired at start, and hands both to the DSP engine.
//!
//! ## Stream lifecycle
//!
//! ```text
//! Stopped --start()--> Started --configure()--> Configured --ingest()--> Running
//!    ^                                                                      |
//!    +------------------------------- stop() -------------------------------+
//! ```
//!
//! ## Locking
//!
//! The processor lock is always taken before any probe lock (and before the
//! registry lock when acquiring at start). The far-end thread only ever takes
//! the probe lock, so the two threads cannot deadlock.

pub mod config;
pub mod engine;

use std::sync::{Mutex, MutexGuard};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::audio::clock::{clock_diff, frames_to_time, ClockTime, Segment};
use crate::audio::format::{bytes_to_samples, samples_to_bytes, AudioFormat, FormatError};
use crate::audio::ring::SampleRing;
use crate::probe::registry::{ProbeHandle, ProbeRegistry, RegistryError};
use crate::probe::ProbeError;
use crate::stats::StreamStats;

use config::{ConfigError, ProcessorConfig};
use engine::{DspEngine, EngineError, EngineSettings};

/// Capacity of the voice activity channel
const VOICE_EVENT_CAPACITY: usize = 32;

/// Errors that stop a processor stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("Invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Rejected format: {0}")]
    Format(#[from] FormatError),

    #[error("Reference probe not found: {0}")]
    ProbeNotFound(String),

    #[error("Reference probe already in use: {0}")]
    ProbeBusy(String),

    #[error("Sample rate mismatch: probe runs at {probe_rate} Hz, stream at {stream_rate} Hz")]
    FormatMismatch { probe_rate: u32, stream_rate: u32 },

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: StreamState,
    },

    #[error("Stream format not configured")]
    NotConfigured,
}

impl From<RegistryError> for ProcessorError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::NotFound(name) => ProcessorError::ProbeNotFound(name),
            RegistryError::AlreadyAcquired(name) => ProcessorError::ProbeBusy(name),
        }
    }
}

/// Stream state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// Engine torn down, no probe held
    Stopped,
    /// Engine set up, waiting for a format
    Started,
    /// Format known, no audio yet
    Configured,
    /// Audio flowing
    Running,
}

/// One processed near-end period
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPeriod {
    /// Interleaved S16 bytes, exactly one period
    pub data: Vec<u8>,
    /// Running time of the first frame, if known
    pub timestamp: Option<ClockTime>,
    /// Period duration
    pub duration: ClockTime,
    /// Set on the first period after a break in timestamp continuity
    pub discont: bool,
}

/// Voice activity change reported by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceActivity {
    /// Stream time (segment position) of the period where the change was seen
    pub stream_time: Option<ClockTime>,
    pub has_voice: bool,
}

/// State guarded by the processor lock
struct Inner<E> {
    state: StreamState,
    engine: E,
    format: Option<AudioFormat>,
    ring: SampleRing,
    segment: Segment,
    probe: Option<ProbeHandle>,
    discont_pending: bool,
    next_timestamp: Option<ClockTime>,
    has_voice: bool,
    stats: StreamStats,
    near: Vec<i16>,
    far: Vec<i16>,
}

/// Near-end period processor
///
/// # Example
/// ```
/// use aecsync_core::{AudioFormat, PassthroughEngine, Processor, ProcessorConfig, ProbeRegistry};
///
/// let registry = ProbeRegistry::new();
/// let processor = Processor::new(ProcessorConfig::default(), PassthroughEngine::new(), registry).unwrap();
///
/// processor.start().unwrap();
/// processor.configure(AudioFormat::new(16000, 1).unwrap()).unwrap();
/// processor.ingest(&[0u8; 400], Some(0), false).unwrap();
///
/// let period = processor.produce_period().unwrap().unwrap();
/// assert_eq!(period.data.len(), 320);
/// assert!(processor.produce_period().unwrap().is_none());
/// processor.stop();
/// ```
pub struct Processor<E: DspEngine> {
    config: ProcessorConfig,
    registry: ProbeRegistry,
    inner: Mutex<Inner<E>>,
    voice_tx: Sender<VoiceActivity>,
    voice_rx: Receiver<VoiceActivity>,
}

impl<E: DspEngine> Processor<E> {
    /// Create a stopped processor
    ///
    /// # Arguments
    /// * `config` - Validated before anything else
    /// * `engine` - Engine set up on every start and torn down on stop
    /// * `registry` - Directory the far-end probe is acquired from
    pub fn new(config: ProcessorConfig, engine: E, registry: ProbeRegistry) -> Result<Self, ProcessorError> {
        config.validate()?;
        let (voice_tx, voice_rx) = crossbeam_channel::bounded(VOICE_EVENT_CAPACITY);

        Ok(Self {
            config,
            registry,
            inner: Mutex::new(Inner {
                state: StreamState::Stopped,
                engine,
                format: None,
                ring: SampleRing::new(),
                segment: Segment::new(),
                probe: None,
                discont_pending: false,
                next_timestamp: None,
                has_voice: false,
                stats: StreamStats::default(),
                near: Vec::new(),
                far: Vec::new(),
            }),
            voice_tx,
            voice_rx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner<E>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Set up the engine and, with echo cancellation, acquire the probe
    ///
    /// A missing or busy probe is fatal for this stream; the engine is torn
    /// down again before returning the error.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let mut inner = self.lock();
        if inner.state != StreamState::Stopped {
            return Err(ProcessorError::InvalidState {
                operation: "start",
                state: inner.state,
            });
        }

        inner.engine.setup(&EngineSettings::from(&self.config))?;

        if self.config.echo_cancel {
            match self.registry.acquire(&self.config.probe_name) {
                Ok(handle) => inner.probe = Some(handle),
                Err(e) => {
                    tracing::error!(probe = %self.config.probe_name, error = %e, "Failed to acquire reference probe");
                    inner.engine.teardown();
                    return Err(e.into());
                }
            }
        }

        inner.stats.start();
        inner.state = StreamState::Started;

        tracing::info!(
            echo_cancel = self.config.echo_cancel,
            noise_suppression = self.config.noise_suppression,
            processing_rate = self.config.processing_rate,
            "Processor started"
        );
        Ok(())
    }

    /// Record the near-end format
    ///
    /// Fails when the period exceeds the sample ceiling, or when the acquired
    /// probe already runs at another rate (channel counts may differ).
    pub fn configure(&self, format: AudioFormat) -> Result<(), ProcessorError> {
        let mut inner = self.lock();
        if inner.state == StreamState::Stopped {
            return Err(ProcessorError::InvalidState {
                operation: "configure",
                state: inner.state,
            });
        }

        tracing::debug!(%format, "setting near-end format");
        if let Err(e) = format.validate_period() {
            tracing::warn!(error = %e, "near-end format rejected");
            return Err(e.into());
        }

        if let Some(probe_format) = inner.probe.as_ref().and_then(|probe| probe.format()) {
            if probe_format.rate() != format.rate() {
                tracing::error!(
                    probe_rate = probe_format.rate(),
                    stream_rate = format.rate(),
                    "Probe and processor sample rates differ"
                );
                return Err(ProcessorError::FormatMismatch {
                    probe_rate: probe_format.rate(),
                    stream_rate: format.rate(),
                });
            }
        }

        inner.ring.clear();
        inner.format = Some(format);
        inner.discont_pending = false;
        inner.next_timestamp = None;
        inner.has_voice = false;
        inner.state = StreamState::Configured;
        Ok(())
    }

    /// Replace the segment used to convert timestamps to running time
    pub fn set_segment(&self, segment: Segment) {
        self.lock().segment = segment;
    }

    /// Queue near-end audio
    ///
    /// # Arguments
    /// * `data` - Interleaved S16 bytes in the configured format
    /// * `pts` - Stream timestamp of the first frame
    /// * `discont` - Timestamp continuity broke; buffered audio is dropped
    pub fn ingest(&self, data: &[u8], pts: Option<ClockTime>, discont: bool) -> Result<(), ProcessorError> {
        let mut inner = self.lock();
        if inner.format.is_none() {
            return Err(ProcessorError::NotConfigured);
        }

        if discont {
            tracing::debug!("Received discont, clearing buffered audio");
            inner.ring.clear();
            inner.discont_pending = true;
            inner.stats.discontinuities += 1;
        }

        let running_time = inner.segment.to_running_time(pts);
        inner.ring.push(data, running_time);
        inner.state = StreamState::Running;
        Ok(())
    }

    /// Process the next period if enough audio is buffered
    ///
    /// Returns `Ok(None)` when less than one period is queued. Engine failures
    /// are logged and the period is still returned; only a probe running at a
    /// different rate is an error.
    pub fn produce_period(&self) -> Result<Option<ProcessedPeriod>, ProcessorError> {
        let mut guard = self.lock();
        let inner = &mut *guard;

        let Some(format) = inner.format else {
            return Err(ProcessorError::NotConfigured);
        };
        let period_size = format.period_size();
        if inner.ring.available() < period_size {
            return Ok(None);
        }

        let rate = format.rate();
        let period_samples = format.period_samples();
        let duration = frames_to_time(period_samples as u64, rate);

        // Reject before touching either buffer so the period can be retried
        if self.config.echo_cancel {
            if let Some(probe_format) = inner.probe.as_ref().and_then(|probe| probe.format()) {
                if probe_format.rate() != rate {
                    tracing::error!(
                        probe_rate = probe_format.rate(),
                        stream_rate = rate,
                        "Reference probe rate differs from the near-end stream"
                    );
                    return Err(ProcessorError::FormatMismatch {
                        probe_rate: probe_format.rate(),
                        stream_rate: rate,
                    });
                }
            }
        }

        let (prev_timestamp, distance) = inner.ring.prev_timestamp();
        let timestamp = prev_timestamp
            .map(|t| t + frames_to_time((distance / format.bytes_per_frame()) as u64, rate));
        let mut data = inner.ring.take(period_size);

        let mut discont = std::mem::take(&mut inner.discont_pending);
        if let (Some(actual), Some(expected)) = (timestamp, inner.next_timestamp) {
            // Allow one frame of rounding between derived timestamps
            if clock_diff(expected, actual).unsigned_abs() > frames_to_time(1, rate) {
                tracing::debug!(expected, actual, "near-end timestamp gap");
                discont = true;
            }
        }
        inner.next_timestamp = timestamp.map(|t| t + duration);

        if self.config.echo_cancel {
            if let Some(probe) = inner.probe.as_ref() {
                let read = match timestamp {
                    Some(ts) => probe.read(ts, period_samples),
                    None => Err(ProbeError::NotReady),
                };
                match read {
                    Ok(block) => {
                        if block.rate != rate {
                            tracing::error!(
                                probe_rate = block.rate,
                                stream_rate = rate,
                                "Reference probe rate changed under a running stream"
                            );
                            return Err(ProcessorError::FormatMismatch {
                                probe_rate: block.rate,
                                stream_rate: rate,
                            });
                        }

                        let delay_ms = self.config.explicit_delay.fixed().unwrap_or(block.delay_ms);
                        inner.engine.set_delay(delay_ms);

                        bytes_to_samples(&block.data, &mut inner.far);
                        if let Err(e) = inner.engine.process_reverse(block.rate, block.channels, &mut inner.far) {
                            tracing::warn!(error = %e, "Failed to analyze reverse stream");
                            inner.stats.reverse_failures += 1;
                        }
                        inner.stats.record_reference(delay_ms);
                    }
                    Err(ProbeError::NotReady) => {
                        tracing::trace!(timestamp = ?timestamp, "no far-end reference yet");
                        inner.stats.reference_misses += 1;
                    }
                }
            }
        }

        bytes_to_samples(&data, &mut inner.near);
        let processed = inner.engine.process(rate, format.channels(), &mut inner.near);
        // The engine works in place, keep whatever it left in the block
        samples_to_bytes(&inner.near, &mut data);

        match processed {
            Ok(()) => {
                if self.config.voice_detection.enabled {
                    if let Some(has_voice) = inner.engine.stream_has_voice() {
                        if has_voice != inner.has_voice {
                            self.post_voice_activity(VoiceActivity {
                                stream_time: inner.segment.to_stream_time(timestamp),
                                has_voice,
                            });
                        }
                        inner.has_voice = has_voice;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to process audio");
                inner.stats.process_failures += 1;
            }
        }

        inner.stats.periods_processed += 1;

        Ok(Some(ProcessedPeriod {
            data,
            timestamp,
            duration,
            discont,
        }))
    }

    fn post_voice_activity(&self, event: VoiceActivity) {
        tracing::debug!(
            has_voice = event.has_voice,
            "Posting voice activity, stream {} voice",
            if event.has_voice { "now has" } else { "no longer has" }
        );
        if let Err(TrySendError::Full(_)) = self.voice_tx.try_send(event) {
            tracing::trace!("voice activity channel full, dropping event");
        }
    }

    /// Drop buffered audio, release the probe and tear the engine down
    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.state == StreamState::Stopped {
            return;
        }

        inner.ring.clear();
        inner.probe = None;
        inner.engine.teardown();
        inner.format = None;
        inner.state = StreamState::Stopped;

        tracing::info!(
            periods = inner.stats.periods_processed,
            reference_reads = inner.stats.reference_reads,
            "Processor stopped"
        );
    }

    /// Current stream state
    pub fn state(&self) -> StreamState {
        self.lock().state
    }

    /// Configured near-end format
    pub fn format(&self) -> Option<AudioFormat> {
        self.lock().format
    }

    /// Processor options
    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Snapshot of the stream statistics
    pub fn stats(&self) -> StreamStats {
        self.lock().stats.clone()
    }

    /// Buffered near-end bytes
    pub fn available(&self) -> usize {
        self.lock().ring.available()
    }

    /// Whether a probe is currently held
    pub fn has_probe(&self) -> bool {
        self.lock().probe.is_some()
    }

    /// Receiver of voice activity changes
    pub fn voice_activity(&self) -> Receiver<VoiceActivity> {
        self.voice_rx.clone()
    }

    /// Inspect the engine
    pub fn with_engine<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        f(&self.lock().engine)
    }
}

impl<E: DspEngine> Drop for Processor<E> {
    fn drop(&mut self) {
        self.stop();
    }
}
