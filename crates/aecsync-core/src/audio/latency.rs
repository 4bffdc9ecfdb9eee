//! Latency and delay negotiation
//!
//! Two values drive the alignment of the far-end reference:
//!
//! - `latency`: time from a far-end buffer being pushed to it leaving the
//!   loudspeaker, in nanoseconds. Taken from the latency event answered by
//!   downstream elements unless configured explicitly.
//! - `delay`: residual offset in milliseconds between the far-end and near-end
//!   streams. Taken from the upstream latency query unless configured
//!   explicitly.
//!
//! Configuration files use `-1` to mean "derive from the pipeline".

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::clock::{ClockTime, MSECOND};

/// Largest explicit latency or delay accepted, in milliseconds
pub const MAX_EXPLICIT_MS: u32 = 1500;

/// Sentinel used in configuration files for "derive from the pipeline"
pub const DERIVE_SENTINEL: i32 = -1;

/// Errors raised for out-of-range explicit values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OverrideError {
    #[error("Explicit value {0} ms out of range (-1..={max})", max = MAX_EXPLICIT_MS)]
    OutOfRange(i32),
}

/// Explicit millisecond override, or derive from the pipeline
///
/// # Example
/// ```
/// use aecsync_core::audio::latency::ExplicitMs;
///
/// assert_eq!(ExplicitMs::try_from(-1).unwrap(), ExplicitMs::Derive);
/// assert_eq!(ExplicitMs::try_from(40).unwrap(), ExplicitMs::Fixed(40));
/// assert!(ExplicitMs::try_from(5000).is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "i32", into = "i32")]
pub enum ExplicitMs {
    /// Use the value negotiated with the pipeline
    #[default]
    Derive,
    /// Use this many milliseconds
    Fixed(u32),
}

impl ExplicitMs {
    /// Fixed value, if any
    pub fn fixed(self) -> Option<u32> {
        match self {
            ExplicitMs::Derive => None,
            ExplicitMs::Fixed(ms) => Some(ms),
        }
    }
}

impl TryFrom<i32> for ExplicitMs {
    type Error = OverrideError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            DERIVE_SENTINEL => Ok(ExplicitMs::Derive),
            ms if (0..=MAX_EXPLICIT_MS as i32).contains(&ms) => Ok(ExplicitMs::Fixed(ms as u32)),
            other => Err(OverrideError::OutOfRange(other)),
        }
    }
}

impl From<ExplicitMs> for i32 {
    fn from(value: ExplicitMs) -> Self {
        match value {
            ExplicitMs::Derive => DERIVE_SENTINEL,
            ExplicitMs::Fixed(ms) => ms as i32,
        }
    }
}

/// Negotiated latency and delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyState {
    explicit_latency: ExplicitMs,
    explicit_delay: ExplicitMs,
    latency: Option<ClockTime>,
    delay_ms: u32,
}

impl LatencyState {
    /// Create the state from the configured overrides
    ///
    /// An explicit latency makes the state ready immediately; otherwise the
    /// latency stays unknown until the first latency event.
    pub fn new(explicit_latency: ExplicitMs, explicit_delay: ExplicitMs) -> Self {
        Self {
            explicit_latency,
            explicit_delay,
            latency: explicit_latency.fixed().map(|ms| ms as ClockTime * MSECOND),
            delay_ms: explicit_delay.fixed().unwrap_or(0),
        }
    }

    /// Recompute both values from a latency event
    ///
    /// # Arguments
    /// * `queried_latency` - Latency carried by the event
    /// * `upstream_latency` - Minimum latency answered by the upstream query
    ///   (`None` when the query failed or returned an invalid time)
    pub fn on_latency_event(&mut self, queried_latency: ClockTime, upstream_latency: Option<ClockTime>) {
        self.latency = Some(match self.explicit_latency.fixed() {
            Some(ms) => ms as ClockTime * MSECOND,
            None => queried_latency,
        });
        self.delay_ms = match self.explicit_delay.fixed() {
            Some(ms) => ms,
            None => (upstream_latency.unwrap_or(0) / MSECOND).min(u32::MAX as u64) as u32,
        };
    }

    /// Latency estimate, if known
    pub fn latency(&self) -> Option<ClockTime> {
        self.latency
    }

    /// Delay in milliseconds
    pub fn delay_ms(&self) -> u32 {
        self.delay_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_until_event() {
        let state = LatencyState::new(ExplicitMs::Derive, ExplicitMs::Derive);
        assert_eq!(state.latency(), None);
        assert_eq!(state.delay_ms(), 0);
    }

    #[test]
    fn test_derived_values() {
        let mut state = LatencyState::new(ExplicitMs::Derive, ExplicitMs::Derive);
        state.on_latency_event(35 * MSECOND, Some(12 * MSECOND + 999_999));
        assert_eq!(state.latency(), Some(35 * MSECOND));
        assert_eq!(state.delay_ms(), 12);
    }

    #[test]
    fn test_invalid_upstream_counts_as_zero() {
        let mut state = LatencyState::new(ExplicitMs::Derive, ExplicitMs::Derive);
        state.on_latency_event(MSECOND, None);
        assert_eq!(state.delay_ms(), 0);
    }

    #[test]
    fn test_explicit_overrides_win() {
        let mut state = LatencyState::new(ExplicitMs::Fixed(50), ExplicitMs::Fixed(20));
        assert_eq!(state.latency(), Some(50 * MSECOND));
        assert_eq!(state.delay_ms(), 20);

        state.on_latency_event(5 * MSECOND, Some(90 * MSECOND));
        assert_eq!(state.latency(), Some(50 * MSECOND));
        assert_eq!(state.delay_ms(), 20);
    }

    #[test]
    fn test_explicit_serde_sentinel() {
        let value: ExplicitMs = serde_json::from_str("-1").unwrap();
        assert_eq!(value, ExplicitMs::Derive);
        assert_eq!(serde_json::to_string(&ExplicitMs::Fixed(30)).unwrap(), "30");
        assert!(serde_json::from_str::<ExplicitMs>("-7").is_err());
        assert!(serde_json::from_str::<ExplicitMs>("1501").is_err());
    }
}
