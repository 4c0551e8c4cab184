// Multi-rate subscriber registry
//
// Consumers subscribe with an interval that is a whole number of block
// durations. On every completed block the registry selects the multiples
// that divide the block's end index, materializes one merged window per
// multiple and hands it to each handler on its own blocking worker, so a
// slow or panicking consumer never stalls acquisition or its siblings.
//
// Each handler keeps a chain of dispatch tasks: a task waits for the
// handler's previous one before running, so one handler sees windows in
// end-index order while different handlers run in parallel.

use crate::streaming::block::{Block, BlockCompleted};
use crate::streaming::shifting_buffer::{BlockListener, ShiftingBuffer};
use crate::streaming::types::{QualityCounters, StreamError, StreamResult};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

/// Consumer of merged block windows
pub type BlockHandler = Arc<dyn Fn(&Block) -> anyhow::Result<()> + Send + Sync>;

/// Consumer of quality degradation reports
pub type ErrorHandler = Arc<dyn Fn(QualityCounters) -> anyhow::Result<()> + Send + Sync>;

/// Result of a subscription request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Subscription {
    /// Number of blocks between two dispatches
    pub multiple: u64,
    pub requested: Duration,
    pub effective: Duration,

    /// True when `requested` was rounded to the nearest block multiple
    pub adjusted: bool,
}

/// A handler together with the tail of its dispatch chain
struct Serialized<H> {
    handler: H,
    tail: Mutex<Option<JoinHandle<()>>>,
}

impl<H> Serialized<H> {
    fn new(handler: H) -> Self {
        Self {
            handler,
            tail: Mutex::new(None),
        }
    }
}

#[derive(Default)]
struct MultipleEntry {
    handlers: Vec<Serialized<BlockHandler>>,
    dispatches: AtomicU64,
}

pub struct SubscriberRegistry {
    block_duration: Duration,
    runtime: Handle,
    multiples: BTreeMap<u64, MultipleEntry>,
    error_handlers: Vec<Serialized<ErrorHandler>>,
    tracker: TaskTracker,
    failures: Arc<AtomicU64>,
}

impl SubscriberRegistry {
    /// Create an empty registry dispatching on `runtime`'s blocking pool
    pub fn new(block_duration: Duration, runtime: Handle) -> Self {
        Self {
            block_duration,
            runtime,
            multiples: BTreeMap::new(),
            error_handlers: Vec::new(),
            tracker: TaskTracker::new(),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Register `handler` to receive a window every `interval`
    ///
    /// Intervals that are not an exact block multiple are rounded to the
    /// nearest one and logged; intervals shorter than one block are rejected.
    pub fn subscribe<F>(&mut self, interval: Duration, handler: F) -> StreamResult<Subscription>
    where
        F: Fn(&Block) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let block_secs = self.block_duration.as_secs_f64();
        if block_secs <= 0.0 {
            return Err(StreamError::InvalidConfig(
                "block duration must be positive".to_string(),
            ));
        }

        let ratio = interval.as_secs_f64() / block_secs;
        if ratio < 1.0 - 1e-9 {
            return Err(StreamError::IntervalTooShort {
                interval_ms: interval.as_secs_f64() * 1000.0,
                block_ms: block_secs * 1000.0,
            });
        }

        let multiple = (ratio.round() as u64).max(1);
        let effective = u32::try_from(multiple)
            .ok()
            .and_then(|m| self.block_duration.checked_mul(m))
            .ok_or_else(|| {
                StreamError::InvalidConfig(format!(
                    "interval {:?} spans too many {:?} blocks",
                    interval, self.block_duration
                ))
            })?;
        let adjusted = (ratio - multiple as f64).abs() > 1e-9;

        if adjusted {
            log::warn!(
                "[DISPATCH] Interval {:?} is not a multiple of the {:?} block; using {:?} ({} blocks)",
                interval,
                self.block_duration,
                effective,
                multiple
            );
        }

        self.multiples
            .entry(multiple)
            .or_default()
            .handlers
            .push(Serialized::new(Arc::new(handler)));

        log::debug!("[DISPATCH] Subscribed handler every {} block(s)", multiple);

        Ok(Subscription {
            multiple,
            requested: interval,
            effective,
            adjusted,
        })
    }

    /// Register a handler for quality degradation reports
    pub fn on_buffer_error<F>(&mut self, handler: F)
    where
        F: Fn(QualityCounters) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.error_handlers.push(Serialized::new(Arc::new(handler)));
    }

    /// Registered multiples, ascending
    pub fn multiples(&self) -> Vec<u64> {
        self.multiples.keys().copied().collect()
    }

    /// Largest registered multiple (0 without subscriptions)
    pub fn max_multiple(&self) -> u64 {
        self.multiples.keys().next_back().copied().unwrap_or(0)
    }

    /// Number of windows dispatched so far for `multiple`
    pub fn dispatch_count(&self, multiple: u64) -> u64 {
        self.multiples
            .get(&multiple)
            .map(|e| e.dispatches.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Handlers that returned an error or panicked
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Fan out the window ending at `end_index` to every due multiple
    pub fn on_block_completed(&self, buffer: &ShiftingBuffer, end_index: u64) {
        for (&multiple, entry) in &self.multiples {
            if end_index % multiple != 0 {
                continue;
            }

            let window = match buffer.get_blocks(multiple as usize, end_index) {
                Ok(window) => Arc::new(window),
                Err(e) => {
                    log::error!(
                        "[DISPATCH] No window for multiple {} at block {}: {}",
                        multiple,
                        end_index,
                        e
                    );
                    continue;
                }
            };

            entry.dispatches.fetch_add(1, Ordering::Relaxed);

            for (position, slot) in entry.handlers.iter().enumerate() {
                let handler = Arc::clone(&slot.handler);
                let window = Arc::clone(&window);
                self.spawn_handler(
                    &slot.tail,
                    format!("handler {}/{} @ block {}", multiple, position, end_index),
                    move || handler(window.as_ref()),
                );
            }
        }
    }

    /// Wait until every dispatched handler has returned
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Queue `job` behind the previous job on the same chain
    fn spawn_handler<F>(&self, tail: &Mutex<Option<JoinHandle<()>>>, label: String, job: F)
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let failures = Arc::clone(&self.failures);
        let mut tail = tail.lock();
        let previous = tail.take();

        let task = self.tracker.spawn_on(
            async move {
                if let Some(previous) = previous {
                    // Outcome already logged by the previous task
                    let _ = previous.await;
                }

                match tokio::task::spawn_blocking(job).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        log::error!("[DISPATCH] {} failed: {:#}", label, e);
                    }
                    Err(e) => {
                        failures.fetch_add(1, Ordering::Relaxed);
                        log::error!("[DISPATCH] {} panicked: {}", label, e);
                    }
                }
            },
            &self.runtime,
        );
        *tail = Some(task);
    }
}

impl BlockListener for SubscriberRegistry {
    fn block_completed(&self, buffer: &ShiftingBuffer, event: BlockCompleted) {
        self.on_block_completed(buffer, event.end_index);
    }

    fn buffer_error(&self, quality: QualityCounters) {
        for (position, slot) in self.error_handlers.iter().enumerate() {
            let handler = Arc::clone(&slot.handler);
            self.spawn_handler(&slot.tail, format!("error handler {}", position), move || {
                handler(quality)
            });
        }
    }
}
