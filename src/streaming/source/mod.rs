// Acquisition source abstraction
//
// The instrument driver lives outside this crate. It is reached through the
// `AcquisitionSource` trait, which mirrors the polling interface of the
// vendor SDK: open a handle, poll status and counters, pull samples, close.
//
// `DeviceSession` owns a source together with its handle and the parameters
// it was opened with, so that a reset reopens with identical settings and the
// handle is always closed on drop.
//
// Current implementations:
// - Simulated: signal generator with scripted faults, for tests and demos

mod simulated;

use crate::streaming::block::Sample;
use crate::streaming::types::{QualityCounters, StreamError, StreamResult};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub use simulated::{FaultScript, SimulatedSource, SimulatorStats};

/// Opaque handle returned by `AcquisitionSource::open`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceHandle(pub u64);

/// Waveform of the instrument's built-in test signal generator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Waveform {
    /// Generator disabled, electrodes are sampled
    #[default]
    Off,
    Sine,
    Square,
}

/// Test signal generator settings passed to the source on open
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GeneratorParams {
    pub waveform: Waveform,
    pub frequency_hz: f64,
    pub amplitude: f64,
}

impl Default for GeneratorParams {
    fn default() -> Self {
        Self {
            waveform: Waveform::Off,
            frequency_hz: 10.0,
            amplitude: 1.0,
        }
    }
}

/// Parameters a source is opened with
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OpenParams {
    pub channels: Vec<String>,
    pub sample_rate: f64,
    pub generator: GeneratorParams,
}

/// Device state as reported by the driver
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Faulted(String),
}

impl SourceState {
    /// States the device passes through on its own; polling continues
    pub fn is_intermediate(&self) -> bool {
        matches!(self, SourceState::Starting | SourceState::Stopping)
    }
}

/// Sample counters returned by one availability poll
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Availability {
    pub available: usize,
    pub lost: usize,
    pub corrupted: usize,
}

impl Availability {
    pub fn quality(&self) -> QualityCounters {
        let (available, lost, corrupted) =
            (self.available as u64, self.lost as u64, self.corrupted as u64);
        QualityCounters::new(available, lost, corrupted, available + lost + corrupted)
    }
}

/// Polling interface of an instrument driver
///
/// All calls are made from the acquisition thread.
pub trait AcquisitionSource: Send {
    fn open(&mut self, params: &OpenParams) -> StreamResult<SourceHandle>;

    fn status(&mut self, handle: SourceHandle) -> SourceState;

    fn read_available(&mut self, handle: SourceHandle) -> StreamResult<Availability>;

    /// Copy up to `count` samples into `out`, returning how many were written
    fn read_samples(
        &mut self,
        handle: SourceHandle,
        out: &mut [Sample],
        count: usize,
    ) -> StreamResult<usize>;

    fn close(&mut self, handle: SourceHandle);

    /// Human-readable name for logging
    fn name(&self) -> &str {
        "source"
    }
}

/// An acquisition source together with its open handle
pub struct DeviceSession {
    source: Box<dyn AcquisitionSource>,
    params: OpenParams,
    handle: Option<SourceHandle>,
    open_attempts: u32,
}

impl DeviceSession {
    pub fn new(source: Box<dyn AcquisitionSource>, params: OpenParams) -> Self {
        Self {
            source,
            params,
            handle: None,
            open_attempts: 0,
        }
    }

    pub fn params(&self) -> &OpenParams {
        &self.params
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Total `open` calls made on the source over this session's lifetime
    pub fn open_attempts(&self) -> u32 {
        self.open_attempts
    }

    /// Single open attempt; a previously open handle is closed first
    pub fn open(&mut self) -> StreamResult<()> {
        self.close();
        self.open_attempts += 1;
        let handle = self.source.open(&self.params)?;
        log::info!(
            "[ACQ] Opened {} ({} channels @ {} Hz)",
            self.source.name(),
            self.params.channels.len(),
            self.params.sample_rate
        );
        self.handle = Some(handle);
        Ok(())
    }

    /// Open with up to `max_attempts` tries spaced by `delay`
    ///
    /// Returns `SourceOpen` once the attempts are exhausted. Setting `stop`
    /// abandons the remaining attempts.
    pub fn open_with_retry(
        &mut self,
        max_attempts: u32,
        delay: Duration,
        stop: Option<&AtomicBool>,
    ) -> StreamResult<()> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            match self.open() {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!(
                        "[ACQ] Open attempt {}/{} on {} failed: {}",
                        attempt,
                        max_attempts,
                        self.source.name(),
                        e
                    );
                    last_error = e.to_string();
                }
            }

            if stop.map(|s| s.load(Ordering::Relaxed)).unwrap_or(false) {
                return Err(StreamError::SourceOpen {
                    attempts: attempt,
                    reason: "stop requested".to_string(),
                });
            }
            if attempt < max_attempts {
                std::thread::sleep(delay);
            }
        }

        Err(StreamError::SourceOpen {
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Close the handle if one is open
    pub fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.source.close(handle);
            log::debug!("[ACQ] Closed {}", self.source.name());
        }
    }

    pub fn status(&mut self) -> SourceState {
        match self.handle {
            Some(handle) => self.source.status(handle),
            None => SourceState::Stopped,
        }
    }

    pub fn read_available(&mut self) -> StreamResult<Availability> {
        let handle = self.require_handle()?;
        self.source.read_available(handle)
    }

    pub fn read_samples(&mut self, out: &mut [Sample], count: usize) -> StreamResult<usize> {
        let handle = self.require_handle()?;
        self.source.read_samples(handle, out, count)
    }

    fn require_handle(&self) -> StreamResult<SourceHandle> {
        self.handle
            .ok_or_else(|| StreamError::Source("source is not open".to_string()))
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}
