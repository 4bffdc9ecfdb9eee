//! Aecsync Core - Reference probe, probe registry and period processor
//!
//! This library time-aligns the far-end (loudspeaker) stream with the near-end
//! (microphone) stream so an echo-cancellation engine receives a reference that
//! matches what the speakers are emitting. The far-end thread only appends to a
//! [`ReferenceProbe`]; the near-end thread drives a [`Processor`] which reads the
//! aligned reference every 10ms period.

pub mod audio;
pub mod probe;
pub mod processor;
pub mod stats;

pub use audio::clock::{ClockTime, Segment, MSECOND, SECOND};
pub use audio::format::{AudioFormat, FormatError, SampleRate};
pub use audio::ring::SampleRing;
pub use probe::registry::{ProbeHandle, ProbeRegistry, RegistryError};
pub use probe::{ProbeError, ProbeSettings, ReferenceBlock, ReferenceProbe};
pub use processor::config::{LoggingSeverity, NoiseSuppressionLevel, ProcessorConfig};
pub use processor::engine::{DspEngine, EngineError, EngineSettings, PassthroughEngine};
pub use processor::{ProcessedPeriod, Processor, ProcessorError, StreamState, VoiceActivity};
pub use stats::StreamStats;

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Maximum number of 16-bit samples (frames x channels) in one period
pub const MAX_DATA_SIZE_SAMPLES: usize = 7680;

/// Maximum number of far-end bytes a probe retains (1 MiB)
pub const MAX_RETAINED_BYTES: usize = 1024 * 1024;

/// Periods per second (the engine works on 10ms blocks)
pub const PERIODS_PER_SECOND: u32 = 100;
