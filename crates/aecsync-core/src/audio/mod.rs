//! Audio plumbing shared by the probe and the processor
//!
//! - Stream format and period sizing ([`format`])
//! - Running-time timestamps and segments ([`clock`])
//! - Timestamped byte FIFO ([`ring`])
//! - Latency/delay negotiation state ([`latency`])

pub mod clock;
pub mod format;
pub mod latency;
pub mod ring;
