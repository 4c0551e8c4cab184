// Acquisition and transform configuration
//
// All values have defaults so a partial JSON document is enough; missing
// fields fall back to `Default`. Sizes in samples are derived from the
// sample rate and the configured durations by `AcquisitionConfig::resolve`.

use crate::spectrum::FillPolicy;
use crate::streaming::source::{GeneratorParams, OpenParams};
use crate::streaming::types::{StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Configuration of one acquisition run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Identifier used in log lines for this run
    pub run_id: String,
    pub sample_rate: f64,
    pub channels: Vec<String>,
    pub generator: GeneratorParams,
    pub block_duration_ms: u64,
    pub buffer_duration_ms: u64,

    /// Open attempts before giving up
    pub open_retries: u32,
    pub open_retry_delay_ms: u64,

    /// Pause before closing and reopening the source after a read fault
    pub reset_delay_ms: u64,
    pub poll_interval_ms: u64,

    /// How long the device may sit in an intermediate state before a warning
    pub intermediate_state_warn_ms: u64,

    /// Iterations between two quality reports (0 disables reporting)
    pub report_every_iterations: u64,

    /// Initial capacity of the raw read buffer, grown on demand
    pub read_buffer_initial: usize,

    /// Raise the acquisition thread's scheduling priority (failure is logged)
    pub elevate_priority: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            sample_rate: 250.0,
            channels: vec!["Cz".to_string()],
            generator: GeneratorParams::default(),
            block_duration_ms: 200,
            buffer_duration_ms: 5000,
            open_retries: 5,
            open_retry_delay_ms: 500,
            reset_delay_ms: 300,
            poll_interval_ms: 20,
            intermediate_state_warn_ms: 2000,
            report_every_iterations: 500,
            read_buffer_initial: 256,
            elevate_priority: true,
        }
    }
}

/// Buffer geometry derived from an `AcquisitionConfig`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferSizes {
    pub block_size: usize,
    pub buffer_size: usize,
}

impl BufferSizes {
    pub fn blocks_per_buffer(&self) -> usize {
        self.buffer_size / self.block_size
    }
}

impl AcquisitionConfig {
    /// Validate the configuration and compute block and buffer sizes in samples
    pub fn resolve(&self) -> StreamResult<BufferSizes> {
        if !(self.sample_rate > 0.0) || !self.sample_rate.is_finite() {
            return Err(StreamError::InvalidConfig(format!(
                "sample rate must be positive, got {}",
                self.sample_rate
            )));
        }
        if self.open_retries == 0 {
            return Err(StreamError::InvalidConfig(
                "open_retries must be at least 1".to_string(),
            ));
        }

        let block_size = (self.sample_rate * self.block_duration_ms as f64 / 1000.0).round() as usize;
        let buffer_size =
            (self.sample_rate * self.buffer_duration_ms as f64 / 1000.0).round() as usize;

        if block_size == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "block of {} ms holds no samples at {} Hz",
                self.block_duration_ms, self.sample_rate
            )));
        }
        if buffer_size < block_size || buffer_size % block_size != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "buffer of {} samples is not a whole number of {}-sample blocks",
                buffer_size, block_size
            )));
        }

        Ok(BufferSizes {
            block_size,
            buffer_size,
        })
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_millis(self.block_duration_ms)
    }

    pub fn open_params(&self) -> OpenParams {
        OpenParams {
            channels: self.channels.clone(),
            sample_rate: self.sample_rate,
            generator: self.generator,
        }
    }
}

/// Configuration of the spectrum cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub transform_size: usize,
    pub target_resolution_hz: f64,
    pub fill_policy: FillPolicy,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            transform_size: 256,
            target_resolution_hz: 1.0,
            fill_policy: FillPolicy::ZeroFill,
        }
    }
}

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub acquisition: AcquisitionConfig,
    pub transform: TransformConfig,
}

impl AppConfig {
    pub fn from_json_str(json: &str) -> StreamResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> StreamResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&contents)?;
        log::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
