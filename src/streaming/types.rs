// Common types for the streaming module

use serde::{Deserialize, Serialize};
use std::ops::AddAssign;
use thiserror::Error;

/// Result type for streaming operations
pub type StreamResult<T> = Result<T, StreamError>;

/// Errors that can occur during acquisition, dispatch and spectrum computation
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Subscription interval {interval_ms} ms is shorter than one block ({block_ms} ms)")]
    IntervalTooShort { interval_ms: f64, block_ms: f64 },

    #[error("Failed to open source after {attempts} attempts: {reason}")]
    SourceOpen { attempts: u32, reason: String },

    #[error("Source error: {0}")]
    Source(String),

    #[error("Blocks unavailable: {count} block(s) ending at {end_index} (newest is {newest})")]
    BlockUnavailable {
        end_index: u64,
        count: usize,
        newest: u64,
    },

    #[error("Transform error: {0}")]
    Transform(String),

    #[error("Config parse error: {0}")]
    Config(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Acquisition already running")]
    AlreadyRunning,

    #[error("Failed to spawn acquisition worker: {0}")]
    WorkerSpawn(String),

    #[error("Acquisition worker panicked")]
    WorkerPanicked,
}

/// Lifecycle of an acquisition run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum AcquisitionState {
    /// Not connected to the source
    #[default]
    Idle,

    /// Opening the source (with bounded retries)
    Opening,

    /// Polling the source and feeding the buffer
    Running,

    /// Closing and reopening the source after a read fault
    Recovering,

    /// Loop has exited and the source is closed
    Stopped,
}

/// Per-block sample quality as reported by the source
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct QualityCounters {
    pub available: u64,
    pub lost: u64,
    pub corrupted: u64,
    pub total: u64,
}

impl QualityCounters {
    pub fn new(available: u64, lost: u64, corrupted: u64, total: u64) -> Self {
        Self {
            available,
            lost,
            corrupted,
            total,
        }
    }

    /// True when the source reported any lost or corrupted samples
    pub fn is_degraded(&self) -> bool {
        self.lost > 0 || self.corrupted > 0
    }

    pub fn is_empty(&self) -> bool {
        self.available == 0 && self.lost == 0 && self.corrupted == 0 && self.total == 0
    }
}

impl AddAssign for QualityCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.available += rhs.available;
        self.lost += rhs.lost;
        self.corrupted += rhs.corrupted;
        self.total += rhs.total;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quality_degraded() {
        assert!(!QualityCounters::new(100, 0, 0, 100).is_degraded());
        assert!(QualityCounters::new(90, 10, 0, 100).is_degraded());
        assert!(QualityCounters::new(90, 0, 10, 100).is_degraded());
    }

    #[test]
    fn test_quality_accumulate() {
        let mut total = QualityCounters::default();
        assert!(total.is_empty());

        total += QualityCounters::new(10, 1, 2, 13);
        total += QualityCounters::new(5, 0, 1, 6);

        assert_eq!(total, QualityCounters::new(15, 1, 3, 19));
    }

    #[test]
    fn test_state_serializes_as_name() {
        let json = serde_json::to_string(&AcquisitionState::Recovering).unwrap();
        assert_eq!(json, "\"Recovering\"");
    }
}
