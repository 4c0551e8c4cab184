// Simulated acquisition source
//
// Produces the instrument's test-generator signal without hardware and can
// replay a scripted sequence of faults, useful for:
// - Exercising open retries and steady-state recovery
// - Quality degradation handling downstream
// - Demo and development

use super::{AcquisitionSource, Availability, OpenParams, SourceHandle, SourceState, Waveform};
use crate::streaming::block::Sample;
use crate::streaming::types::{StreamError, StreamResult};
use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Scripted behaviour of a `SimulatedSource`
///
/// Poll numbers count `read_available` calls from 1 across the whole
/// lifetime of the source, including calls made after a reset.
#[derive(Debug, Clone)]
pub struct FaultScript {
    /// Samples offered per poll
    pub chunk_size: usize,

    /// Number of initial `open` calls that fail
    pub failing_opens: u32,

    /// Number of `open` calls that fail after the first successful open
    pub failing_reopens: u32,

    /// Status calls answering `Starting` after each open
    pub starting_polls: u32,

    /// Polls that report no available samples
    pub zero_available: HashSet<u64>,

    /// Polls that report `(lost, corrupted)` samples alongside the chunk
    pub degraded: HashMap<u64, (usize, usize)>,
}

impl Default for FaultScript {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            failing_opens: 0,
            failing_reopens: 0,
            starting_polls: 0,
            zero_available: HashSet::new(),
            degraded: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct SourceCounters {
    open_calls: AtomicU64,
    close_calls: AtomicU64,
    polls: AtomicU64,
    samples_emitted: AtomicU64,
}

/// Read-only view of a simulator's call counters, usable after the source
/// has been moved into an acquisition loop
#[derive(Clone)]
pub struct SimulatorStats {
    counters: Arc<SourceCounters>,
}

impl SimulatorStats {
    pub fn open_calls(&self) -> u64 {
        self.counters.open_calls.load(Ordering::SeqCst)
    }

    pub fn close_calls(&self) -> u64 {
        self.counters.close_calls.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> u64 {
        self.counters.polls.load(Ordering::SeqCst)
    }

    pub fn samples_emitted(&self) -> u64 {
        self.counters.samples_emitted.load(Ordering::SeqCst)
    }
}

pub struct SimulatedSource {
    script: FaultScript,
    counters: Arc<SourceCounters>,
    params: Option<OpenParams>,
    handle: Option<SourceHandle>,
    next_handle: u64,
    opened_once: bool,
    reopen_failures: u32,
    starting_left: u32,
    ready: usize,
    phase: u64,
}

impl SimulatedSource {
    pub fn new(script: FaultScript) -> (Self, SimulatorStats) {
        let counters = Arc::new(SourceCounters::default());
        let source_stats = SimulatorStats {
            counters: Arc::clone(&counters),
        };
        let source = Self {
            script,
            counters,
            params: None,
            handle: None,
            next_handle: 1,
            opened_once: false,
            reopen_failures: 0,
            starting_left: 0,
            ready: 0,
            phase: 0,
        };
        (source, source_stats)
    }

    fn check_handle(&self, handle: SourceHandle) -> StreamResult<()> {
        if self.handle == Some(handle) {
            Ok(())
        } else {
            Err(StreamError::Source(format!("stale handle {:?}", handle)))
        }
    }

    fn next_sample(&mut self, params: &OpenParams) -> Sample {
        let t = self.phase as f64 / params.sample_rate;
        self.phase += 1;

        let generator = &params.generator;
        let sine = (2.0 * PI * generator.frequency_hz * t).sin();
        match generator.waveform {
            Waveform::Off => 0.0,
            Waveform::Sine => generator.amplitude * sine,
            Waveform::Square => generator.amplitude * if sine >= 0.0 { 1.0 } else { -1.0 },
        }
    }
}

impl AcquisitionSource for SimulatedSource {
    fn open(&mut self, params: &OpenParams) -> StreamResult<SourceHandle> {
        let calls = self.counters.open_calls.fetch_add(1, Ordering::SeqCst) + 1;

        if calls <= self.script.failing_opens as u64 {
            return Err(StreamError::Source("device not responding".to_string()));
        }
        if self.opened_once && self.reopen_failures < self.script.failing_reopens {
            self.reopen_failures += 1;
            return Err(StreamError::Source("device busy".to_string()));
        }

        let handle = SourceHandle(self.next_handle);
        self.next_handle += 1;
        self.handle = Some(handle);
        self.params = Some(params.clone());
        self.opened_once = true;
        self.starting_left = self.script.starting_polls;
        self.ready = 0;
        Ok(handle)
    }

    fn status(&mut self, handle: SourceHandle) -> SourceState {
        if self.check_handle(handle).is_err() {
            return SourceState::Stopped;
        }
        if self.starting_left > 0 {
            self.starting_left -= 1;
            return SourceState::Starting;
        }
        SourceState::Running
    }

    fn read_available(&mut self, handle: SourceHandle) -> StreamResult<Availability> {
        self.check_handle(handle)?;
        let poll = self.counters.polls.fetch_add(1, Ordering::SeqCst) + 1;

        if self.script.zero_available.contains(&poll) {
            self.ready = 0;
            return Ok(Availability::default());
        }

        let (lost, corrupted) = self.script.degraded.get(&poll).copied().unwrap_or((0, 0));
        self.ready = self.script.chunk_size;
        Ok(Availability {
            available: self.ready,
            lost,
            corrupted,
        })
    }

    fn read_samples(
        &mut self,
        handle: SourceHandle,
        out: &mut [Sample],
        count: usize,
    ) -> StreamResult<usize> {
        self.check_handle(handle)?;
        let params = self
            .params
            .clone()
            .ok_or_else(|| StreamError::Source("source was never opened".to_string()))?;

        let n = count.min(self.ready).min(out.len());
        for slot in out.iter_mut().take(n) {
            *slot = self.next_sample(&params);
        }
        self.ready -= n;
        self.counters
            .samples_emitted
            .fetch_add(n as u64, Ordering::SeqCst);
        Ok(n)
    }

    fn close(&mut self, handle: SourceHandle) {
        if self.handle == Some(handle) {
            self.handle = None;
            self.ready = 0;
        }
        self.counters.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::source::GeneratorParams;

    fn sine_params() -> OpenParams {
        OpenParams {
            channels: vec!["Cz".to_string()],
            sample_rate: 100.0,
            generator: GeneratorParams {
                waveform: Waveform::Sine,
                frequency_hz: 25.0,
                amplitude: 2.0,
            },
        }
    }

    #[test]
    fn test_generates_sine() {
        let (mut source, source_stats) = SimulatedSource::new(FaultScript {
            chunk_size: 4,
            ..Default::default()
        });
        let handle = source.open(&sine_params()).unwrap();

        let available = source.read_available(handle).unwrap();
        assert_eq!(available.available, 4);

        let mut out = vec![0.0; 8];
        let n = source.read_samples(handle, &mut out, 8).unwrap();
        assert_eq!(n, 4);

        // 25 Hz at 100 Hz: 0, A, 0, -A
        let expected = [0.0, 2.0, 0.0, -2.0];
        for (got, want) in out.iter().zip(expected) {
            assert!((got - want).abs() < 1e-9, "{} != {}", got, want);
        }
        assert_eq!(source_stats.samples_emitted(), 4);
    }

    #[test]
    fn test_scripted_polls() {
        let (mut source, _source_stats) = SimulatedSource::new(FaultScript {
            zero_available: HashSet::from([2]),
            degraded: HashMap::from([(3, (5, 1))]),
            ..Default::default()
        });
        let handle = source.open(&sine_params()).unwrap();

        assert_eq!(source.read_available(handle).unwrap().available, 100);
        assert_eq!(source.read_available(handle).unwrap().available, 0);
        let degraded = source.read_available(handle).unwrap();
        assert_eq!((degraded.lost, degraded.corrupted), (5, 1));
    }

    #[test]
    fn test_starting_then_running() {
        let (mut source, _source_stats) = SimulatedSource::new(FaultScript {
            starting_polls: 2,
            ..Default::default()
        });
        let handle = source.open(&sine_params()).unwrap();

        assert!(source.status(handle).is_intermediate());
        assert!(source.status(handle).is_intermediate());
        assert_eq!(source.status(handle), SourceState::Running);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let (mut source, _source_stats) = SimulatedSource::new(FaultScript::default());
        let first = source.open(&sine_params()).unwrap();
        source.close(first);
        let _second = source.open(&sine_params()).unwrap();

        assert!(source.read_available(first).is_err());
    }
}
