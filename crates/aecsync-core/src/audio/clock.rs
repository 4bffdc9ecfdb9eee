//! Running-time timestamps
//!
//! Both streams are compared in running time: a monotonically increasing
//! nanosecond clock with pauses and seeks removed. Buffers arrive stamped in
//! stream time and are mapped through a [`Segment`].

/// Timestamp or duration in nanoseconds
pub type ClockTime = u64;

/// One second in [`ClockTime`] units
pub const SECOND: ClockTime = 1_000_000_000;

/// One millisecond in [`ClockTime`] units
pub const MSECOND: ClockTime = 1_000_000;

/// Scale a frame count to a duration at the given rate
pub fn frames_to_time(frames: u64, rate: u32) -> ClockTime {
    ((frames as u128 * SECOND as u128) / rate.max(1) as u128) as ClockTime
}

/// Signed difference `end - start` in nanoseconds
pub fn clock_diff(start: ClockTime, end: ClockTime) -> i64 {
    (end as i128 - start as i128).clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

/// Playback segment used to convert stream timestamps to running time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// First timestamp of the segment
    pub start: ClockTime,
    /// Last timestamp of the segment (None = open ended)
    pub stop: Option<ClockTime>,
    /// Running time accumulated before this segment started
    pub base: ClockTime,
}

impl Segment {
    /// Open-ended segment starting at zero
    pub fn new() -> Self {
        Self {
            start: 0,
            stop: None,
            base: 0,
        }
    }

    /// Map a stream timestamp to running time
    ///
    /// Returns `None` for missing timestamps and timestamps outside the segment.
    ///
    /// # Example
    /// ```
    /// use aecsync_core::audio::clock::{Segment, SECOND};
    ///
    /// let segment = Segment { start: SECOND, stop: None, base: 5 * SECOND };
    /// assert_eq!(segment.to_running_time(Some(2 * SECOND)), Some(6 * SECOND));
    /// assert_eq!(segment.to_running_time(Some(0)), None);
    /// ```
    pub fn to_running_time(&self, pts: Option<ClockTime>) -> Option<ClockTime> {
        let pts = pts?;
        if pts < self.start {
            return None;
        }
        if matches!(self.stop, Some(stop) if pts > stop) {
            return None;
        }
        Some(pts - self.start + self.base)
    }

    /// Map a running time back to the stream timestamp it came from
    ///
    /// Returns `None` for running times before the segment's base or past its
    /// stop.
    pub fn to_stream_time(&self, running_time: Option<ClockTime>) -> Option<ClockTime> {
        let running_time = running_time?;
        if running_time < self.base {
            return None;
        }
        let pts = running_time - self.base + self.start;
        if matches!(self.stop, Some(stop) if pts > stop) {
            return None;
        }
        Some(pts)
    }
}

impl Default for Segment {
    fn default() -> Self {
        Self::new()
    }
}
