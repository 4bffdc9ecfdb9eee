//! Timestamped sample FIFO
//!
//! Raw interleaved PCM is pushed in runs, each optionally stamped with its
//! running time. Readers consume bytes from the front regardless of run
//! boundaries. The ring remembers the timestamp of the run the front currently
//! sits in (or the last stamped run before it) together with the byte distance
//! travelled since that run started, which lets callers extrapolate the running
//! time of the very next byte.

use std::collections::VecDeque;

use super::clock::ClockTime;

/// One pushed block of bytes
#[derive(Debug)]
struct Run {
    data: Vec<u8>,
    timestamp: Option<ClockTime>,
}

/// FIFO of timestamped byte runs
///
/// # Example
/// ```
/// use aecsync_core::SampleRing;
///
/// let mut ring = SampleRing::new();
/// ring.push(&[1, 2, 3, 4], Some(1_000));
/// ring.flush(2);
/// assert_eq!(ring.prev_timestamp(), (Some(1_000), 2));
/// assert_eq!(ring.take(2), vec![3, 4]);
/// ```
#[derive(Debug, Default)]
pub struct SampleRing {
    runs: VecDeque<Run>,
    /// Bytes already consumed from the front run
    skip: usize,
    /// Total unconsumed bytes
    available: usize,
    /// Timestamp of the last stamped run reached by the front
    prev_timestamp: Option<ClockTime>,
    /// Bytes consumed since `prev_timestamp`'s run started
    distance: usize,
}

impl SampleRing {
    /// Create an empty ring
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a run of bytes stamped with its running time
    pub fn push(&mut self, data: &[u8], timestamp: Option<ClockTime>) {
        if data.is_empty() {
            return;
        }
        let was_empty = self.runs.is_empty();
        self.runs.push_back(Run {
            data: data.to_vec(),
            timestamp,
        });
        self.available += data.len();
        if was_empty {
            self.reach_front();
        }
    }

    /// Total buffered bytes
    pub fn available(&self) -> usize {
        self.available
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.available == 0
    }

    /// Timestamp of the oldest pending run and the byte distance from that
    /// run's start to the current front
    pub fn prev_timestamp(&self) -> (Option<ClockTime>, usize) {
        (self.prev_timestamp, self.distance)
    }

    /// Copy `dest.len()` bytes starting `offset` bytes past the front, without
    /// consuming them. Bytes past the end of the buffered data are zeroed.
    pub fn copy_into(&self, offset: usize, dest: &mut [u8]) {
        let mut position = offset + self.skip;
        let mut written = 0;

        for run in &self.runs {
            if written == dest.len() {
                break;
            }
            if position >= run.data.len() {
                position -= run.data.len();
                continue;
            }
            let chunk = &run.data[position..];
            let count = chunk.len().min(dest.len() - written);
            dest[written..written + count].copy_from_slice(&chunk[..count]);
            written += count;
            position = 0;
        }

        dest[written..].fill(0);
    }

    /// Discard up to `count` bytes from the front
    pub fn flush(&mut self, count: usize) {
        let mut remaining = count.min(self.available);
        self.available -= remaining;

        while remaining > 0 {
            let Some(front) = self.runs.front() else {
                break;
            };
            let left = front.data.len() - self.skip;
            if remaining < left {
                self.skip += remaining;
                self.distance += remaining;
                break;
            }

            remaining -= left;
            self.distance += left;
            self.runs.pop_front();
            self.skip = 0;
            self.reach_front();
        }
    }

    /// Remove and return the first `count` bytes
    ///
    /// When fewer than `count` bytes are buffered, the result is still `count`
    /// bytes long: leading zeros followed by everything that was buffered, and
    /// the ring is left empty.
    pub fn take(&mut self, count: usize) -> Vec<u8> {
        let mut out = vec![0u8; count];
        let have = self.available.min(count);
        let pad = count - have;
        self.copy_into(0, &mut out[pad..]);
        self.flush(have);
        out
    }

    /// Drop the oldest bytes until at most `max_bytes` remain
    pub fn trim_to(&mut self, max_bytes: usize) {
        if self.available > max_bytes {
            self.flush(self.available - max_bytes);
        }
    }

    /// Discard all data and timestamp tracking
    pub fn clear(&mut self) {
        self.runs.clear();
        self.skip = 0;
        self.available = 0;
        self.prev_timestamp = None;
        self.distance = 0;
    }

    /// Track the timestamp of a run that just became the front
    fn reach_front(&mut self) {
        if let Some(timestamp) = self.runs.front().and_then(|run| run.timestamp) {
            self.prev_timestamp = Some(timestamp);
            self.distance = 0;
        }
    }
}
