//! Processor configuration
//!
//! Built once before the stream starts and validated as a whole. Keys are
//! kebab-case so configuration files read like the option names operators
//! already know (`echo-cancel`, `noise-suppression-level`, ...).

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audio::latency::ExplicitMs;

/// Errors raised by [`ProcessorConfig::validate`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Processing rate must be 32000 or 48000, got {0}")]
    ProcessingRate(u32),

    #[error("Gain control target level must be 0..=31 dBFS, got {0}")]
    TargetLevel(u8),

    #[error("Gain control compression gain must be 0..=90 dB, got {0}")]
    CompressionGain(u8),

    #[error("Voice detection frame size must be 10, 20 or 30 ms, got {0}")]
    FrameSize(u32),

    #[error("Echo cancellation needs a probe name")]
    MissingProbeName,
}

/// Noise suppression aggressiveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NoiseSuppressionLevel {
    Low,
    #[default]
    Moderate,
    High,
    VeryHigh,
}

impl NoiseSuppressionLevel {
    /// Level code understood by the engine
    pub fn engine_code(self) -> i32 {
        match self {
            NoiseSuppressionLevel::Low => 0,
            NoiseSuppressionLevel::Moderate => 1,
            NoiseSuppressionLevel::High => 2,
            NoiseSuppressionLevel::VeryHigh => 3,
        }
    }
}

/// Engine log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingSeverity {
    None,
    Error,
    #[default]
    Warning,
    Info,
    Verbose,
}

impl LoggingSeverity {
    /// Severity code understood by the engine
    pub fn engine_code(self) -> i32 {
        match self {
            LoggingSeverity::Verbose => 0,
            LoggingSeverity::Info => 1,
            LoggingSeverity::Warning => 2,
            LoggingSeverity::Error => 3,
            LoggingSeverity::None => 4,
        }
    }

    /// Matching tracing level (None disables engine logging)
    pub fn tracing_level(self) -> Option<tracing::Level> {
        match self {
            LoggingSeverity::None => None,
            LoggingSeverity::Error => Some(tracing::Level::ERROR),
            LoggingSeverity::Warning => Some(tracing::Level::WARN),
            LoggingSeverity::Info => Some(tracing::Level::INFO),
            LoggingSeverity::Verbose => Some(tracing::Level::TRACE),
        }
    }
}

/// Automatic gain control options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GainControlConfig {
    pub enabled: bool,
    /// Target peak level in dBFS below full scale
    pub target_level_dbfs: u8,
    /// Maximum digital compression gain in dB
    pub compression_gain_db: u8,
    pub limiter: bool,
}

impl Default for GainControlConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target_level_dbfs: 3,
            compression_gain_db: 9,
            limiter: true,
        }
    }
}

/// Voice activity detection options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct VoiceDetectionConfig {
    pub enabled: bool,
    pub frame_size_ms: u32,
}

impl Default for VoiceDetectionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frame_size_ms: 10,
        }
    }
}

fn default_processing_rate() -> u32 {
    32000
}

fn default_probe_name() -> String {
    "probe0".to_string()
}

/// Processor options
///
/// # Example
/// ```
/// use aecsync_core::{NoiseSuppressionLevel, ProcessorConfig};
///
/// let config: ProcessorConfig = serde_json::from_str(
///     r#"{"echo-cancel": true, "noise-suppression-level": "very-high"}"#,
/// ).unwrap();
/// assert!(config.echo_cancel);
/// assert_eq!(config.noise_suppression_level, NoiseSuppressionLevel::VeryHigh);
/// assert_eq!(config.processing_rate, 32000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProcessorConfig {
    /// Registry key of the far-end probe
    #[serde(default = "default_probe_name")]
    pub probe_name: String,
    /// Maximum internal processing rate (32000 or 48000)
    #[serde(default = "default_processing_rate")]
    pub processing_rate: u32,
    #[serde(default)]
    pub echo_cancel: bool,
    #[serde(default)]
    pub noise_suppression: bool,
    #[serde(default)]
    pub noise_suppression_level: NoiseSuppressionLevel,
    #[serde(default)]
    pub gain_control: GainControlConfig,
    #[serde(default)]
    pub high_pass_filter: bool,
    #[serde(default)]
    pub voice_detection: VoiceDetectionConfig,
    #[serde(default)]
    pub logging_severity: LoggingSeverity,
    /// Delay forwarded to the engine instead of the probe's (-1 = probe's)
    #[serde(default)]
    pub explicit_delay: ExplicitMs,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            probe_name: default_probe_name(),
            processing_rate: default_processing_rate(),
            echo_cancel: false,
            noise_suppression: false,
            noise_suppression_level: NoiseSuppressionLevel::default(),
            gain_control: GainControlConfig::default(),
            high_pass_filter: false,
            voice_detection: VoiceDetectionConfig::default(),
            logging_severity: LoggingSeverity::default(),
            explicit_delay: ExplicitMs::Derive,
        }
    }
}

impl ProcessorConfig {
    /// Check every option against its legal range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.processing_rate, 32000 | 48000) {
            return Err(ConfigError::ProcessingRate(self.processing_rate));
        }
        if self.gain_control.target_level_dbfs > 31 {
            return Err(ConfigError::TargetLevel(self.gain_control.target_level_dbfs));
        }
        if self.gain_control.compression_gain_db > 90 {
            return Err(ConfigError::CompressionGain(self.gain_control.compression_gain_db));
        }
        if !matches!(self.voice_detection.frame_size_ms, 10 | 20 | 30) {
            return Err(ConfigError::FrameSize(self.voice_detection.frame_size_ms));
        }
        if self.echo_cancel && self.probe_name.is_empty() {
            return Err(ConfigError::MissingProbeName);
        }
        Ok(())
    }
}
