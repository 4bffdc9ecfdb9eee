//! Aecsync - far-end/near-end stream alignment for echo cancellation
//!
//! This library re-exports the probe, registry and processor from
//! `aecsync-core` and adds the application layer: persistent configuration,
//! the loopback simulation and, with the `devices` feature, a real
//! loudspeaker/microphone loop.

pub mod config;
#[cfg(feature = "devices")]
pub mod devices;
pub mod simulate;

pub use aecsync_core::audio;
pub use aecsync_core::probe;
pub use aecsync_core::processor;
pub use aecsync_core::stats;

pub use aecsync_core::{
    AudioFormat, PassthroughEngine, ProbeRegistry, ProbeSettings, Processor, ProcessorConfig,
    ReferenceProbe, StreamStats,
};
pub use aecsync_core::{BUILD_DATE, MAX_DATA_SIZE_SAMPLES, MAX_RETAINED_BYTES, VERSION};
