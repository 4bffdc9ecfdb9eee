//! Per-stream processing statistics
//!
//! Counters kept by the processor for operators: how many periods went
//! through, how often the far-end reference was missing, and how often the
//! engine complained.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Running statistics of one processor stream
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    /// When the stream was last started
    pub started_at: Option<DateTime<Utc>>,
    /// Periods handed downstream
    pub periods_processed: u64,
    /// Reference blocks read from the probe
    pub reference_reads: u64,
    /// Periods processed without a reference (probe not ready)
    pub reference_misses: u64,
    /// Failed near-end engine calls
    pub process_failures: u64,
    /// Failed far-end engine calls
    pub reverse_failures: u64,
    /// Discontinuities seen on the near-end stream
    pub discontinuities: u64,
    /// Delay forwarded with the last reference block (ms)
    pub last_delay_ms: Option<u32>,
    /// Average forwarded delay (ms)
    pub avg_delay_ms: f64,
}

impl StreamStats {
    /// Reset all counters and stamp a new start
    pub fn start(&mut self) {
        *self = Self {
            started_at: Some(Utc::now()),
            ..Default::default()
        };
    }

    /// Record a successful reference read
    pub fn record_reference(&mut self, delay_ms: u32) {
        self.reference_reads += 1;
        self.last_delay_ms = Some(delay_ms);
        // Incremental mean over all reads
        self.avg_delay_ms += (delay_ms as f64 - self.avg_delay_ms) / self.reference_reads as f64;
    }

    /// Fraction of echo-cancelled periods that had a reference
    pub fn reference_coverage(&self) -> f64 {
        let total = self.reference_reads + self.reference_misses;
        if total == 0 {
            return 0.0;
        }
        self.reference_reads as f64 / total as f64
    }

    /// Seconds since the stream started
    pub fn uptime_seconds(&self) -> i64 {
        self.started_at
            .map(|start| (Utc::now() - start).num_seconds())
            .unwrap_or(0)
    }
}
