//! Echo-cancellation engine boundary
//!
//! The processor drives an opaque DSP engine through [`DspEngine`]. All calls
//! are synchronous and work in place on a caller-owned block of samples. The
//! engine lives exactly from [`DspEngine::setup`] to [`DspEngine::teardown`],
//! which the processor maps to its stream's start and stop.
//!
//! Two implementations ship with the crate:
//! - [`PassthroughEngine`]: leaves audio untouched, for hosts without a DSP
//!   library and for tests
//! - [`webrtc::WebrtcEngine`] (feature `webrtc`): the C shim around the WebRTC
//!   audio processing library

use thiserror::Error;

use super::config::{LoggingSeverity, NoiseSuppressionLevel, ProcessorConfig};

/// Errors reported by an engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine setup failed: {0}")]
    Setup(String),

    #[error("Engine returned status {code}: {reason}")]
    Status { code: i32, reason: String },

    #[error("Engine already in use by another stream")]
    Busy,
}

/// Options the engine is set up with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub processing_rate: u32,
    pub echo_cancel: bool,
    pub noise_suppression: bool,
    pub noise_suppression_level: NoiseSuppressionLevel,
    pub gain_control: bool,
    pub target_level_dbfs: u8,
    pub compression_gain_db: u8,
    pub limiter: bool,
    pub high_pass_filter: bool,
    pub voice_detection: bool,
    pub voice_frame_size_ms: u32,
    pub logging_severity: LoggingSeverity,
}

impl From<&ProcessorConfig> for EngineSettings {
    fn from(config: &ProcessorConfig) -> Self {
        Self {
            processing_rate: config.processing_rate,
            echo_cancel: config.echo_cancel,
            noise_suppression: config.noise_suppression,
            noise_suppression_level: config.noise_suppression_level,
            gain_control: config.gain_control.enabled,
            target_level_dbfs: config.gain_control.target_level_dbfs,
            compression_gain_db: config.gain_control.compression_gain_db,
            limiter: config.gain_control.limiter,
            high_pass_filter: config.high_pass_filter,
            voice_detection: config.voice_detection.enabled,
            voice_frame_size_ms: config.voice_detection.frame_size_ms,
            logging_severity: config.logging_severity,
        }
    }
}

/// Synchronous in-place DSP engine
pub trait DspEngine: Send {
    /// Initialize the engine for a new stream
    fn setup(&mut self, settings: &EngineSettings) -> Result<(), EngineError>;

    /// Process one near-end period in place
    fn process(&mut self, rate: u32, channels: u16, samples: &mut [i16]) -> Result<(), EngineError>;

    /// Analyze one far-end reference period in place
    fn process_reverse(&mut self, rate: u32, channels: u16, samples: &mut [i16]) -> Result<(), EngineError>;

    /// Set the far/near delay in milliseconds
    fn set_delay(&mut self, delay_ms: u32);

    /// Release engine resources
    fn teardown(&mut self);

    /// Voice activity of the last processed period, if the engine tracks it
    fn stream_has_voice(&self) -> Option<bool> {
        None
    }
}

impl<E: DspEngine + ?Sized> DspEngine for Box<E> {
    fn setup(&mut self, settings: &EngineSettings) -> Result<(), EngineError> {
        (**self).setup(settings)
    }

    fn process(&mut self, rate: u32, channels: u16, samples: &mut [i16]) -> Result<(), EngineError> {
        (**self).process(rate, channels, samples)
    }

    fn process_reverse(&mut self, rate: u32, channels: u16, samples: &mut [i16]) -> Result<(), EngineError> {
        (**self).process_reverse(rate, channels, samples)
    }

    fn set_delay(&mut self, delay_ms: u32) {
        (**self).set_delay(delay_ms)
    }

    fn teardown(&mut self) {
        (**self).teardown()
    }

    fn stream_has_voice(&self) -> Option<bool> {
        (**self).stream_has_voice()
    }
}

/// Engine that leaves audio untouched
#[derive(Debug, Default)]
pub struct PassthroughEngine {
    delay_ms: u32,
    active: bool,
}

impl PassthroughEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last delay forwarded by the processor
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }

    /// Whether the engine is between setup and teardown
    pub fn is_active(&self) -> bool {
        self.active
    }
}

impl DspEngine for PassthroughEngine {
    fn setup(&mut self, settings: &EngineSettings) -> Result<(), EngineError> {
        tracing::debug!(?settings, "passthrough engine setup");
        self.active = true;
        Ok(())
    }

    fn process(&mut self, _rate: u32, _channels: u16, _samples: &mut [i16]) -> Result<(), EngineError> {
        Ok(())
    }

    fn process_reverse(&mut self, _rate: u32, _channels: u16, _samples: &mut [i16]) -> Result<(), EngineError> {
        Ok(())
    }

    fn set_delay(&mut self, delay_ms: u32) {
        self.delay_ms = delay_ms;
    }

    fn teardown(&mut self) {
        self.active = false;
    }
}

#[cfg(feature = "webrtc")]
pub mod webrtc {
    //! WebRTC audio processing through its C shim
    //!
    //! The shim keeps a single process-wide engine, so only one
    //! [`WebrtcEngine`] may exist at a time.

    use std::ffi::{c_char, c_int, CStr};
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::{DspEngine, EngineError, EngineSettings};

    extern "C" {
        fn ap_error(code: c_int) -> *const c_char;
        fn ap_setup(
            processing_rate: c_int,
            echo_cancel: bool,
            noise_suppression: bool,
            noise_suppression_level: c_int,
            gain_control: bool,
            logging_severity: c_int,
        );
        fn ap_delete();
        fn ap_delay(delay_ms: c_int);
        fn ap_process_reverse(rate: c_int, channels: c_int, data: *mut i16) -> c_int;
        fn ap_process(rate: c_int, channels: c_int, data: *mut i16) -> c_int;
    }

    static IN_USE: AtomicBool = AtomicBool::new(false);

    /// Handle on the process-wide WebRTC engine
    #[derive(Debug)]
    pub struct WebrtcEngine {
        active: bool,
    }

    impl WebrtcEngine {
        /// Claim the process-wide engine
        pub fn new() -> Result<Self, EngineError> {
            if IN_USE.swap(true, Ordering::AcqRel) {
                return Err(EngineError::Busy);
            }
            Ok(Self { active: false })
        }

        /// Human readable text for a status code
        pub fn error_string(&self, code: i32) -> String {
            // SAFETY: ap_error returns a static NUL-terminated string or null
            let text = unsafe { ap_error(code) };
            if text.is_null() {
                return format!("unknown error {}", code);
            }
            // SAFETY: checked for null above, the shim owns the storage
            unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned()
        }

        fn check(&self, code: c_int) -> Result<(), EngineError> {
            if code < 0 {
                return Err(EngineError::Status {
                    code,
                    reason: self.error_string(code),
                });
            }
            Ok(())
        }
    }

    impl DspEngine for WebrtcEngine {
        fn setup(&mut self, settings: &EngineSettings) -> Result<(), EngineError> {
            if settings.high_pass_filter || settings.voice_detection {
                tracing::debug!("high-pass filter and voice detection are not exposed by the shim");
            }
            // SAFETY: plain values, the shim copies them
            unsafe {
                ap_setup(
                    settings.processing_rate as c_int,
                    settings.echo_cancel,
                    settings.noise_suppression,
                    settings.noise_suppression_level.engine_code(),
                    settings.gain_control,
                    settings.logging_severity.engine_code(),
                );
            }
            self.active = true;
            Ok(())
        }

        fn process(&mut self, rate: u32, channels: u16, samples: &mut [i16]) -> Result<(), EngineError> {
            // SAFETY: samples holds one 10ms period at rate/channels
            let code = unsafe { ap_process(rate as c_int, channels as c_int, samples.as_mut_ptr()) };
            self.check(code)
        }

        fn process_reverse(&mut self, rate: u32, channels: u16, samples: &mut [i16]) -> Result<(), EngineError> {
            // SAFETY: samples holds one 10ms period at rate/channels
            let code =
                unsafe { ap_process_reverse(rate as c_int, channels as c_int, samples.as_mut_ptr()) };
            self.check(code)
        }

        fn set_delay(&mut self, delay_ms: u32) {
            // SAFETY: plain value
            unsafe { ap_delay(delay_ms.min(c_int::MAX as u32) as c_int) };
        }

        fn teardown(&mut self) {
            if self.active {
                // SAFETY: paired with the ap_setup call above
                unsafe { ap_delete() };
                self.active = false;
            }
        }
    }

    impl Drop for WebrtcEngine {
        fn drop(&mut self) {
            self.teardown();
            IN_USE.store(false, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_from_config() {
        let mut config = ProcessorConfig {
            echo_cancel: true,
            processing_rate: 48000,
            ..Default::default()
        };
        config.gain_control.limiter = false;

        let settings = EngineSettings::from(&config);
        assert!(settings.echo_cancel);
        assert_eq!(settings.processing_rate, 48000);
        assert!(settings.gain_control);
        assert!(!settings.limiter);
        assert_eq!(settings.logging_severity, LoggingSeverity::Warning);
    }

    #[test]
    fn test_passthrough_leaves_samples() {
        let mut engine = PassthroughEngine::new();
        engine
            .setup(&EngineSettings::from(&ProcessorConfig::default()))
            .unwrap();
        assert!(engine.is_active());

        let mut samples = [1i16, -2, 3];
        engine.process(16000, 1, &mut samples).unwrap();
        engine.process_reverse(16000, 1, &mut samples).unwrap();
        assert_eq!(samples, [1, -2, 3]);

        engine.set_delay(25);
        assert_eq!(engine.delay_ms(), 25);

        engine.teardown();
        assert!(!engine.is_active());
    }

    #[test]
    fn test_boxed_engine_forwards() {
        let mut engine: Box<dyn DspEngine> = Box::new(PassthroughEngine::new());
        engine.set_delay(5);
        assert_eq!(engine.stream_has_voice(), None);
        assert!(engine.process(8000, 1, &mut [0i16; 80]).is_ok());
    }
}
