// Blocks: fixed-length, sequence-numbered groups of samples

use crate::streaming::types::QualityCounters;
use serde::{Deserialize, Serialize};

/// One scalar reading from the instrument
pub type Sample = f64;

/// A window of one or more consecutive blocks
///
/// Windows returned by `ShiftingBuffer::get_blocks` concatenate `block_count`
/// blocks; `start_time` is the start of the oldest block and `end_index` the
/// sequence number of the newest one. Quality counters are summed over all
/// blocks in the window.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Block {
    pub samples: Vec<Sample>,

    /// Unix timestamp (seconds) of the first sample
    pub start_time: f64,

    /// Sequence number of the newest block in the window (1-based)
    pub end_index: u64,

    /// Number of blocks merged into this window
    pub block_count: usize,

    pub quality: QualityCounters,
}

impl Block {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// True when any merged block was flagged by `mark_error`
    pub fn is_degraded(&self) -> bool {
        self.quality.is_degraded()
    }

    pub fn duration_secs(&self, sample_rate: f64) -> f64 {
        self.samples.len() as f64 / sample_rate
    }

    pub fn end_time(&self, sample_rate: f64) -> f64 {
        self.start_time + self.duration_secs(sample_rate)
    }
}

/// Notification raised by the buffer each time a block is cut
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlockCompleted {
    pub end_index: u64,
    pub start_time: f64,

    /// Counters attached by `mark_error`, `None` for clean blocks
    pub quality: Option<QualityCounters>,
}

impl BlockCompleted {
    pub fn is_degraded(&self) -> bool {
        self.quality.map(|q| q.is_degraded()).unwrap_or(false)
    }
}
