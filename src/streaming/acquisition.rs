// Acquisition loop - drives a real-time source into the shifting buffer
//
// The loop manages:
// - Source lifecycle (bounded open retries, close on exit)
// - Polling and classification of availability counters
// - Steady-state recovery by closing and reopening the source
// - Quality flagging of blocks built from degraded reads
// - Periodic quality reports handed off over a channel
// - Cooperative stop via a shared flag
//
// The loop runs on one dedicated thread. Source I/O and recovery sleeps
// happen on that thread, so ingestion pauses while the source is reset.

use crate::config::AcquisitionConfig;
use crate::streaming::block::Sample;
use crate::streaming::shifting_buffer::ShiftingBuffer;
use crate::streaming::source::{AcquisitionSource, Availability, DeviceSession, SourceState};
use crate::streaming::subscribers::SubscriberRegistry;
use crate::streaming::types::{AcquisitionState, StreamError, StreamResult};
use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use thread_priority::ThreadPriority;

const REPORT_CHANNEL_CAPACITY: usize = 64;
const MIN_STATE_POLL: Duration = Duration::from_millis(5);
const MAX_STATE_POLL: Duration = Duration::from_millis(250);

/// Sample quality over the window since the previous report
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityReport {
    pub run_id: String,
    pub iterations: u64,
    pub good: u64,
    pub lost: u64,
    pub corrupted: u64,
    pub timestamp: f64,
}

impl QualityReport {
    pub fn total(&self) -> u64 {
        self.good + self.lost + self.corrupted
    }

    /// (good, corrupted, lost) as fractions of the window total
    pub fn ratios(&self) -> (f64, f64, f64) {
        let total = self.total();
        if total == 0 {
            return (0.0, 0.0, 0.0);
        }
        let total = total as f64;
        (
            self.good as f64 / total,
            self.corrupted as f64 / total,
            self.lost as f64 / total,
        )
    }
}

/// Counters for a whole run, returned when the loop exits
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct AcquisitionSummary {
    pub run_id: String,
    pub iterations: u64,
    pub samples_written: u64,
    pub blocks_completed: u64,
    pub degraded_reads: u64,
    pub resets: u64,
    pub open_attempts: u32,
}

/// What a single loop iteration did
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// Stop flag observed; nothing was read
    Stopped,

    /// Device in an intermediate state; polled again after a short sleep
    Waiting(SourceState),

    /// Source was closed and reopened, buffer cleared
    Reset,

    Wrote {
        samples: usize,
        blocks: usize,
        degraded: bool,
    },
}

#[derive(Debug, Default)]
struct QualityWindow {
    iterations: u64,
    good: u64,
    lost: u64,
    corrupted: u64,
}

type StateCallback = Arc<dyn Fn(AcquisitionState) + Send + Sync>;

/// Acquisition control loop
pub struct AcquisitionLoop {
    config: AcquisitionConfig,
    session: DeviceSession,
    buffer: Arc<ShiftingBuffer>,

    state: Arc<RwLock<AcquisitionState>>,
    stop_signal: Arc<AtomicBool>,
    state_callback: Option<StateCallback>,

    report_tx: Sender<QualityReport>,
    report_rx: Receiver<QualityReport>,

    read_buf: Vec<Sample>,
    window: QualityWindow,
    summary: AcquisitionSummary,
    intermediate_since: Option<Instant>,
    intermediate_warned: bool,
}

impl AcquisitionLoop {
    /// Create a loop feeding a freshly sized buffer whose blocks go to `registry`
    pub fn new(
        config: AcquisitionConfig,
        source: Box<dyn AcquisitionSource>,
        registry: Arc<SubscriberRegistry>,
    ) -> StreamResult<Self> {
        let sizes = config.resolve()?;

        let max_multiple = registry.max_multiple();
        if max_multiple > sizes.blocks_per_buffer() as u64 {
            return Err(StreamError::InvalidConfig(format!(
                "subscription spans {} blocks but the buffer holds {}",
                max_multiple,
                sizes.blocks_per_buffer()
            )));
        }

        let buffer = Arc::new(ShiftingBuffer::new(
            sizes.buffer_size,
            sizes.block_size,
            config.sample_rate,
        )?);
        buffer.set_listener(registry);

        let (report_tx, report_rx) = channel::bounded(REPORT_CHANNEL_CAPACITY);
        let session = DeviceSession::new(source, config.open_params());

        log::info!(
            "[ACQ] Run {}: {} Hz, blocks of {} samples, {} blocks buffered",
            config.run_id,
            config.sample_rate,
            sizes.block_size,
            sizes.blocks_per_buffer()
        );

        Ok(Self {
            read_buf: vec![0.0; config.read_buffer_initial],
            summary: AcquisitionSummary {
                run_id: config.run_id.clone(),
                ..Default::default()
            },
            config,
            session,
            buffer,
            state: Arc::new(RwLock::new(AcquisitionState::Idle)),
            stop_signal: Arc::new(AtomicBool::new(false)),
            state_callback: None,
            report_tx,
            report_rx,
            window: QualityWindow::default(),
            intermediate_since: None,
            intermediate_warned: false,
        })
    }

    /// Set state change callback
    pub fn set_state_callback<F>(&mut self, callback: F)
    where
        F: Fn(AcquisitionState) + Send + Sync + 'static,
    {
        self.state_callback = Some(Arc::new(callback));
    }

    /// Shared buffer, for windowed reads outside the dispatch path
    pub fn buffer(&self) -> Arc<ShiftingBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn state(&self) -> AcquisitionState {
        *self.state.read()
    }

    /// Receiver for periodic quality reports
    pub fn quality_reports(&self) -> Receiver<QualityReport> {
        self.report_rx.clone()
    }

    /// Flag checked once per iteration
    pub fn stop_signal(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop_signal)
    }

    /// Current capacity of the raw read buffer
    pub fn read_buffer_len(&self) -> usize {
        self.read_buf.len()
    }

    pub fn summary(&self) -> AcquisitionSummary {
        AcquisitionSummary {
            open_attempts: self.session.open_attempts(),
            ..self.summary.clone()
        }
    }

    /// Open the source with the configured retry bound
    ///
    /// On failure the loop stays `Idle` and the error carries the number of
    /// attempts made.
    pub fn open(&mut self) -> StreamResult<()> {
        if self.session.is_open() {
            return Err(StreamError::AlreadyRunning);
        }

        self.set_state(AcquisitionState::Opening);
        let delay = Duration::from_millis(self.config.open_retry_delay_ms);
        let result = self.session.open_with_retry(
            self.config.open_retries,
            delay,
            Some(self.stop_signal.as_ref()),
        );

        match result {
            Ok(()) => {
                self.set_state(AcquisitionState::Running);
                Ok(())
            }
            Err(e) => {
                log::error!("[ACQ] Run {}: {}", self.config.run_id, e);
                self.set_state(AcquisitionState::Idle);
                Err(e)
            }
        }
    }

    /// Open the source and run the loop on a dedicated thread
    pub fn spawn(mut self) -> StreamResult<AcquisitionHandle> {
        self.open()?;

        let stop_signal = self.stop_signal();
        let state = Arc::clone(&self.state);
        let reports = self.quality_reports();
        let buffer = self.buffer();
        let elevate = self.config.elevate_priority;

        let join = std::thread::Builder::new()
            .name(format!("acquisition-{}", short_id(&self.config.run_id)))
            .spawn(move || {
                if elevate {
                    raise_thread_priority();
                }
                self.run()
            })
            .map_err(|e| StreamError::WorkerSpawn(e.to_string()))?;

        Ok(AcquisitionHandle {
            stop_signal,
            state,
            reports,
            buffer,
            join: Some(join),
        })
    }

    /// Run until the stop flag is set, then close the source and clear the buffer
    pub fn run(&mut self) -> AcquisitionSummary {
        log::info!("[ACQ] Acquisition loop started");
        while self.step() != StepOutcome::Stopped {}
        self.shutdown()
    }

    /// One loop iteration
    pub fn step(&mut self) -> StepOutcome {
        if self.stop_signal.load(Ordering::Relaxed) {
            return StepOutcome::Stopped;
        }
        self.summary.iterations += 1;

        match self.session.status() {
            SourceState::Running => {
                self.intermediate_since = None;
                self.intermediate_warned = false;
            }
            state if state.is_intermediate() => {
                self.wait_intermediate(&state);
                return StepOutcome::Waiting(state);
            }
            state => {
                log::warn!("[ACQ] Source reported {:?}", state);
                self.recover();
                return StepOutcome::Reset;
            }
        }

        let availability = match self.session.read_available() {
            Ok(availability) => availability,
            Err(e) => {
                log::warn!("[ACQ] Availability poll failed: {}", e);
                self.recover();
                return StepOutcome::Reset;
            }
        };
        self.record_quality(&availability);

        if availability.available == 0 {
            self.recover();
            return StepOutcome::Reset;
        }

        let degraded = availability.lost > 0 || availability.corrupted > 0;
        if degraded {
            let quality = availability.quality();
            self.buffer
                .mark_error(quality.available, quality.lost, quality.corrupted, quality.total);
            self.summary.degraded_reads += 1;
        }

        let outcome = match self.read_into_buffer(availability.available) {
            Ok((samples, blocks)) => StepOutcome::Wrote {
                samples,
                blocks,
                degraded,
            },
            Err(e) => {
                log::warn!("[ACQ] Sample read failed: {}", e);
                self.recover();
                StepOutcome::Reset
            }
        };

        self.maybe_report();

        if self.config.poll_interval_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.config.poll_interval_ms));
        }

        outcome
    }

    /// Close the source, clear the buffer and move to `Stopped`
    pub fn shutdown(&mut self) -> AcquisitionSummary {
        self.session.close();
        self.buffer.clear();
        self.set_state(AcquisitionState::Stopped);

        let summary = self.summary();
        log::info!(
            "[ACQ] Run {} stopped: {} iterations, {} samples, {} blocks, {} resets, {} degraded reads",
            summary.run_id,
            summary.iterations,
            summary.samples_written,
            summary.blocks_completed,
            summary.resets,
            summary.degraded_reads
        );
        summary
    }

    fn read_into_buffer(&mut self, available: usize) -> StreamResult<(usize, usize)> {
        if available > self.read_buf.len() {
            log::debug!(
                "[ACQ] Growing read buffer {} -> {} samples",
                self.read_buf.len(),
                available
            );
            self.read_buf.resize(available, 0.0);
        }

        let read = self
            .session
            .read_samples(&mut self.read_buf[..available], available)?;
        let result = self.buffer.write(&self.read_buf[..read]);

        self.summary.samples_written += read as u64;
        self.summary.blocks_completed += result.completed.len() as u64;
        Ok((read, result.completed.len()))
    }

    /// Reset the source after a read fault
    ///
    /// Reopen attempts repeat until one succeeds or a stop is requested;
    /// there is no retry cap at steady state.
    fn recover(&mut self) {
        self.set_state(AcquisitionState::Recovering);
        self.summary.resets += 1;
        log::warn!(
            "[ACQ] No usable samples; resetting source (reset #{})",
            self.summary.resets
        );

        let delay = Duration::from_millis(self.config.reset_delay_ms);
        let mut attempt: u64 = 0;
        loop {
            if self.stop_signal.load(Ordering::Relaxed) {
                log::info!("[ACQ] Stop requested during recovery");
                return;
            }

            std::thread::sleep(delay);
            self.session.close();
            attempt += 1;

            match self.session.open() {
                Ok(()) => break,
                Err(e) => log::error!("[ACQ] Reopen attempt {} failed: {}", attempt, e),
            }
        }

        self.buffer.clear();
        self.intermediate_since = None;
        self.intermediate_warned = false;
        self.set_state(AcquisitionState::Running);
        log::info!("[ACQ] Source reset after {} attempt(s)", attempt);
    }

    fn wait_intermediate(&mut self, state: &SourceState) {
        let since = *self.intermediate_since.get_or_insert_with(Instant::now);
        let warn_after = Duration::from_millis(self.config.intermediate_state_warn_ms);

        if !self.intermediate_warned && since.elapsed() >= warn_after {
            log::warn!(
                "[ACQ] Source has been {:?} for {:.1}s",
                state,
                since.elapsed().as_secs_f64()
            );
            self.intermediate_warned = true;
        }

        let pause = Duration::from_millis(self.config.poll_interval_ms)
            .clamp(MIN_STATE_POLL, MAX_STATE_POLL);
        std::thread::sleep(pause);
    }

    fn record_quality(&mut self, availability: &Availability) {
        self.window.iterations += 1;
        self.window.good += availability.available as u64;
        self.window.lost += availability.lost as u64;
        self.window.corrupted += availability.corrupted as u64;
    }

    fn maybe_report(&mut self) {
        let every = self.config.report_every_iterations;
        if every == 0 || self.window.iterations < every {
            return;
        }

        let window = std::mem::take(&mut self.window);
        let report = QualityReport {
            run_id: self.config.run_id.clone(),
            iterations: window.iterations,
            good: window.good,
            lost: window.lost,
            corrupted: window.corrupted,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
        };

        let (good, corrupted, lost) = report.ratios();
        if report.lost > 0 || report.corrupted > 0 {
            log::warn!(
                "[ACQ] Quality over {} polls: good {:.1}%, corrupted {:.1}%, lost {:.1}%",
                report.iterations,
                good * 100.0,
                corrupted * 100.0,
                lost * 100.0
            );
        } else {
            log::info!(
                "[ACQ] Quality over {} polls: good {:.1}% ({} samples)",
                report.iterations,
                good * 100.0,
                report.good
            );
        }

        match self.report_tx.try_send(report) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => log::debug!("[ACQ] Quality report channel full"),
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    fn set_state(&self, state: AcquisitionState) {
        let previous = std::mem::replace(&mut *self.state.write(), state);
        if previous != state {
            log::debug!("[ACQ] {:?} -> {:?}", previous, state);
            if let Some(callback) = &self.state_callback {
                callback(state);
            }
        }
    }
}

/// Handle to a loop running on its own thread
pub struct AcquisitionHandle {
    stop_signal: Arc<AtomicBool>,
    state: Arc<RwLock<AcquisitionState>>,
    reports: Receiver<QualityReport>,
    buffer: Arc<ShiftingBuffer>,
    join: Option<JoinHandle<AcquisitionSummary>>,
}

impl AcquisitionHandle {
    pub fn state(&self) -> AcquisitionState {
        *self.state.read()
    }

    pub fn quality_reports(&self) -> Receiver<QualityReport> {
        self.reports.clone()
    }

    pub fn buffer(&self) -> Arc<ShiftingBuffer> {
        Arc::clone(&self.buffer)
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().map(|j| j.is_finished()).unwrap_or(true)
    }

    /// Request a stop and wait for the loop to exit
    pub fn stop(mut self) -> StreamResult<AcquisitionSummary> {
        self.stop_signal.store(true, Ordering::Relaxed);
        match self.join.take() {
            Some(join) => join.join().map_err(|_| StreamError::WorkerPanicked),
            None => Err(StreamError::WorkerPanicked),
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);
    }
}

fn short_id(run_id: &str) -> &str {
    run_id.get(..8).unwrap_or(run_id)
}

fn raise_thread_priority() {
    if let Err(e) = thread_priority::set_current_thread_priority(ThreadPriority::Max) {
        log::warn!("[ACQ] Could not raise acquisition thread priority: {:?}", e);
    }
}
