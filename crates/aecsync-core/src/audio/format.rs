//! Stream format and 10ms period sizing
//!
//! Only 16-bit native-endian interleaved PCM is accepted, at one of the four
//! rates the processing engine supports.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MAX_DATA_SIZE_SAMPLES, PERIODS_PER_SECOND};

/// Size of one S16 sample in bytes
pub const BYTES_PER_SAMPLE: usize = 2;

/// Errors raised while validating a stream format
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    #[error("Unsupported sample rate: {0} Hz (expected 8000, 16000, 32000 or 48000)")]
    UnsupportedRate(u32),

    #[error("Stream must have at least one channel")]
    NoChannels,

    #[error(
        "Period too big: maximum is {max} samples and we have {samples} samples, \
         reduce the number of channels or the rate"
    )]
    PeriodTooLarge { max: usize, samples: usize },
}

/// Sample rates accepted on both streams
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SampleRate {
    Hz8000,
    Hz16000,
    Hz32000,
    Hz48000,
}

impl SampleRate {
    /// Rate in Hz
    pub fn hz(self) -> u32 {
        match self {
            SampleRate::Hz8000 => 8000,
            SampleRate::Hz16000 => 16000,
            SampleRate::Hz32000 => 32000,
            SampleRate::Hz48000 => 48000,
        }
    }
}

impl TryFrom<u32> for SampleRate {
    type Error = FormatError;

    fn try_from(hz: u32) -> Result<Self, Self::Error> {
        match hz {
            8000 => Ok(SampleRate::Hz8000),
            16000 => Ok(SampleRate::Hz16000),
            32000 => Ok(SampleRate::Hz32000),
            48000 => Ok(SampleRate::Hz48000),
            other => Err(FormatError::UnsupportedRate(other)),
        }
    }
}

impl From<SampleRate> for u32 {
    fn from(rate: SampleRate) -> Self {
        rate.hz()
    }
}

/// Interleaved S16 stream format
///
/// # Example
/// ```
/// use aecsync_core::AudioFormat;
///
/// let format = AudioFormat::new(48000, 2).unwrap();
/// assert_eq!(format.period_samples(), 480);
/// assert_eq!(format.period_size(), 480 * 4);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    rate: SampleRate,
    channels: u16,
}

impl AudioFormat {
    /// Build a format from a raw rate and channel count
    pub fn new(rate: u32, channels: u16) -> Result<Self, FormatError> {
        if channels == 0 {
            return Err(FormatError::NoChannels);
        }
        Ok(Self {
            rate: SampleRate::try_from(rate)?,
            channels,
        })
    }

    /// Sample rate
    pub fn sample_rate(&self) -> SampleRate {
        self.rate
    }

    /// Sample rate in Hz
    pub fn rate(&self) -> u32 {
        self.rate.hz()
    }

    /// Channel count
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Bytes per interleaved frame
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * BYTES_PER_SAMPLE
    }

    /// Frames in one 10ms period
    pub fn period_samples(&self) -> usize {
        (self.rate() / PERIODS_PER_SECOND) as usize
    }

    /// Bytes in one 10ms period
    pub fn period_size(&self) -> usize {
        self.period_samples() * self.bytes_per_frame()
    }

    /// Reject formats whose period exceeds [`MAX_DATA_SIZE_SAMPLES`]
    pub fn validate_period(&self) -> Result<(), FormatError> {
        let samples = self.period_size() / BYTES_PER_SAMPLE;
        if samples > MAX_DATA_SIZE_SAMPLES {
            return Err(FormatError::PeriodTooLarge {
                max: MAX_DATA_SIZE_SAMPLES,
                samples,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S16 {} Hz, {} channel(s)", self.rate(), self.channels)
    }
}

/// Decode native-endian S16 bytes into samples
pub fn bytes_to_samples(bytes: &[u8], samples: &mut Vec<i16>) {
    samples.clear();
    samples.extend(
        bytes
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_ne_bytes([pair[0], pair[1]])),
    );
}

/// Encode samples back into native-endian S16 bytes
pub fn samples_to_bytes(samples: &[i16], bytes: &mut [u8]) {
    for (dst, sample) in bytes.chunks_exact_mut(BYTES_PER_SAMPLE).zip(samples) {
        dst.copy_from_slice(&sample.to_ne_bytes());
    }
}
