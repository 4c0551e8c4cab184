// Shifting block buffer for acquisition data
//
// Accumulates the sample stream from the acquisition loop, cuts it into
// sequentially numbered blocks and keeps the most recent
// `buffer_size / block_size` blocks in a ring for windowed reads.
//
// Writes come from a single thread (the acquisition loop). Readers take a
// read lock and copy the requested range, so a window is never torn by a
// concurrent write. Listeners are notified after each cut with the lock
// released, which lets them call `get_blocks` from inside the callback.

use crate::streaming::block::{Block, BlockCompleted, Sample};
use crate::streaming::types::{QualityCounters, StreamError, StreamResult};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Receives buffer notifications
///
/// Called on the writer's thread. Implementations must not block for long:
/// the acquisition loop is stalled until the callback returns.
pub trait BlockListener: Send + Sync {
    /// A block was cut; `buffer` can be queried for windows ending at `event.end_index`
    fn block_completed(&self, buffer: &ShiftingBuffer, event: BlockCompleted);

    /// The source reported lost or corrupted samples
    fn buffer_error(&self, _quality: QualityCounters) {}
}

/// Outcome of a single `write`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub samples_written: usize,

    /// End indices of the blocks cut during this write, oldest first
    pub completed: Vec<u64>,

    /// Samples carried over into the next block
    pub pending: usize,
}

/// Snapshot of buffer counters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BufferMetrics {
    pub end_index: u64,
    pub pending: usize,
    pub total_samples_written: u64,
    pub degraded_blocks: u64,
    pub block_size: usize,
    pub buffer_size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct SlotMeta {
    end_index: u64,
    start_time: f64,
    quality: QualityCounters,
}

struct Inner {
    /// Ring storage, `buffer_size` samples
    data: Vec<Sample>,
    slots: Vec<SlotMeta>,

    /// Samples of the block currently being filled
    staging: Vec<Sample>,

    end_index: u64,
    origin: Option<f64>,
    pending_quality: Option<QualityCounters>,
    total_written: u64,
    degraded_blocks: u64,
}

pub struct ShiftingBuffer {
    block_size: usize,
    buffer_size: usize,
    blocks_per_buffer: usize,
    sample_rate: f64,
    inner: RwLock<Inner>,
    listener: RwLock<Option<Arc<dyn BlockListener>>>,
}

impl ShiftingBuffer {
    /// Create a buffer holding `buffer_size` samples in blocks of `block_size`
    pub fn new(buffer_size: usize, block_size: usize, sample_rate: f64) -> StreamResult<Self> {
        if block_size == 0 {
            return Err(StreamError::InvalidConfig(
                "block size must be at least one sample".to_string(),
            ));
        }
        if buffer_size < block_size || buffer_size % block_size != 0 {
            return Err(StreamError::InvalidConfig(format!(
                "buffer size {} is not a whole number of {}-sample blocks",
                buffer_size, block_size
            )));
        }
        if !(sample_rate > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }

        let blocks_per_buffer = buffer_size / block_size;

        log::debug!(
            "[BUFFER] Allocated {} samples ({} blocks of {}) @ {} Hz",
            buffer_size,
            blocks_per_buffer,
            block_size,
            sample_rate
        );

        Ok(Self {
            block_size,
            buffer_size,
            blocks_per_buffer,
            sample_rate,
            inner: RwLock::new(Inner {
                data: vec![0.0; buffer_size],
                slots: vec![SlotMeta::default(); blocks_per_buffer],
                staging: Vec::with_capacity(block_size),
                end_index: 0,
                origin: None,
                pending_quality: None,
                total_written: 0,
                degraded_blocks: 0,
            }),
            listener: RwLock::new(None),
        })
    }

    /// Register the listener for block and error notifications
    pub fn set_listener(&self, listener: Arc<dyn BlockListener>) {
        *self.listener.write() = Some(listener);
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn blocks_per_buffer(&self) -> usize {
        self.blocks_per_buffer
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_size as f64 / self.sample_rate)
    }

    /// Sequence number of the newest completed block (0 before the first cut)
    pub fn end_index(&self) -> u64 {
        self.inner.read().end_index
    }

    /// Append samples, cutting a block whenever `block_size` samples are pending
    pub fn write(&self, samples: &[Sample]) -> WriteResult {
        let mut result = WriteResult {
            samples_written: samples.len(),
            ..Default::default()
        };
        let mut rest = samples;

        while !rest.is_empty() {
            let completed = {
                let mut inner = self.inner.write();
                if inner.origin.is_none() {
                    inner.origin = Some(now_secs());
                }

                let take = (self.block_size - inner.staging.len()).min(rest.len());
                inner.staging.extend_from_slice(&rest[..take]);
                inner.total_written += take as u64;
                rest = &rest[take..];

                if inner.staging.len() == self.block_size {
                    Some(self.cut(&mut inner))
                } else {
                    None
                }
            };

            if let Some(event) = completed {
                result.completed.push(event.end_index);
                self.notify_completed(event);
            }
        }

        result.pending = self.inner.read().staging.len();
        result
    }

    /// Flag the next completed block as degraded
    ///
    /// Counters from repeated calls before the next cut are summed.
    pub fn mark_error(&self, available: u64, lost: u64, corrupted: u64, total: u64) {
        let quality = QualityCounters::new(available, lost, corrupted, total);
        {
            let mut inner = self.inner.write();
            *inner.pending_quality.get_or_insert_with(QualityCounters::default) += quality;
        }

        log::debug!(
            "[BUFFER] Next block flagged: lost={} corrupted={} of {}",
            lost,
            corrupted,
            total
        );

        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.buffer_error(quality);
        }
    }

    /// Concatenate the `count` blocks ending at `end_index` (inclusive)
    ///
    /// Near the start of a run fewer than `count` blocks may exist; the window
    /// then covers blocks `1..=end_index`.
    pub fn get_blocks(&self, count: usize, end_index: u64) -> StreamResult<Block> {
        let inner = self.inner.read();
        let newest = inner.end_index;
        let unavailable = || StreamError::BlockUnavailable {
            end_index,
            count,
            newest,
        };

        if count == 0 || count > self.blocks_per_buffer || end_index == 0 || end_index > newest {
            return Err(unavailable());
        }

        let count = count.min(end_index as usize);
        let oldest = end_index - count as u64 + 1;
        if newest - oldest >= self.blocks_per_buffer as u64 {
            return Err(unavailable());
        }

        let mut samples = Vec::with_capacity(count * self.block_size);
        let mut quality = QualityCounters::default();
        for index in oldest..=end_index {
            let slot = self.slot_of(index);
            let meta = &inner.slots[slot];
            debug_assert_eq!(meta.end_index, index);
            let start = slot * self.block_size;
            samples.extend_from_slice(&inner.data[start..start + self.block_size]);
            quality += meta.quality;
        }

        Ok(Block {
            samples,
            start_time: inner.slots[self.slot_of(oldest)].start_time,
            end_index,
            block_count: count,
            quality,
        })
    }

    /// Reset cursor and counters; backing storage is kept
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.staging.clear();
        inner.slots.iter_mut().for_each(|s| *s = SlotMeta::default());
        inner.end_index = 0;
        inner.origin = None;
        inner.pending_quality = None;
        inner.total_written = 0;
        inner.degraded_blocks = 0;
    }

    pub fn metrics(&self) -> BufferMetrics {
        let inner = self.inner.read();
        BufferMetrics {
            end_index: inner.end_index,
            pending: inner.staging.len(),
            total_samples_written: inner.total_written,
            degraded_blocks: inner.degraded_blocks,
            block_size: self.block_size,
            buffer_size: self.buffer_size,
        }
    }

    fn slot_of(&self, end_index: u64) -> usize {
        ((end_index - 1) % self.blocks_per_buffer as u64) as usize
    }

    /// Move the staged block into the ring. Caller holds the write lock.
    fn cut(&self, inner: &mut Inner) -> BlockCompleted {
        inner.end_index += 1;
        let end_index = inner.end_index;
        let slot = self.slot_of(end_index);
        let start = slot * self.block_size;

        let Inner { data, staging, .. } = &mut *inner;
        data[start..start + self.block_size].copy_from_slice(staging);
        staging.clear();

        let block_secs = self.block_size as f64 / self.sample_rate;
        let start_time = inner.origin.unwrap_or(0.0) + (end_index - 1) as f64 * block_secs;
        let quality = inner.pending_quality.take();
        if quality.is_some() {
            inner.degraded_blocks += 1;
        }

        inner.slots[slot] = SlotMeta {
            end_index,
            start_time,
            quality: quality.unwrap_or_default(),
        };

        BlockCompleted {
            end_index,
            start_time,
            quality,
        }
    }

    fn notify_completed(&self, event: BlockCompleted) {
        let listener = self.listener.read().clone();
        if let Some(listener) = listener {
            listener.block_completed(self, event);
        }
    }
}

fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<BlockCompleted>>,
        errors: Mutex<Vec<QualityCounters>>,
        windows: Mutex<Vec<Block>>,
    }

    impl BlockListener for Recorder {
        fn block_completed(&self, buffer: &ShiftingBuffer, event: BlockCompleted) {
            self.events.lock().push(event);
            if let Ok(window) = buffer.get_blocks(buffer.blocks_per_buffer(), event.end_index) {
                self.windows.lock().push(window);
            }
        }

        fn buffer_error(&self, quality: QualityCounters) {
            self.errors.lock().push(quality);
        }
    }

    fn ramp(start: usize, len: usize) -> Vec<Sample> {
        (start..start + len).map(|v| v as Sample).collect()
    }

    #[test]
    fn test_rejects_misaligned_sizes() {
        assert!(ShiftingBuffer::new(5000, 0, 250.0).is_err());
        assert!(ShiftingBuffer::new(5001, 1000, 250.0).is_err());
        assert!(ShiftingBuffer::new(500, 1000, 250.0).is_err());
        assert!(ShiftingBuffer::new(5000, 1000, 0.0).is_err());
        assert!(ShiftingBuffer::new(5000, 1000, 250.0).is_ok());
    }

    #[test]
    fn test_full_cycle_cuts_every_block() {
        for (buffer_size, block_size) in [(10, 1), (12, 4), (5000, 1000), (4096, 4096)] {
            let buffer = ShiftingBuffer::new(buffer_size, block_size, 100.0).unwrap();
            let result = buffer.write(&vec![1.0; buffer_size]);

            assert_eq!(result.completed.len(), buffer_size / block_size);
            assert_eq!(result.pending, 0);
            assert_eq!(buffer.end_index(), (buffer_size / block_size) as u64);
        }
    }

    #[test]
    fn test_partial_writes_carry_over() {
        let buffer = ShiftingBuffer::new(40, 10, 100.0).unwrap();

        let first = buffer.write(&ramp(0, 7));
        assert!(first.completed.is_empty());
        assert_eq!(first.pending, 7);

        let second = buffer.write(&ramp(7, 8));
        assert_eq!(second.completed, vec![1]);
        assert_eq!(second.pending, 5);

        buffer.write(&ramp(15, 5));
        let window = buffer.get_blocks(2, 2).unwrap();
        assert_eq!(window.samples, ramp(0, 20));
        assert_eq!(buffer.metrics().total_samples_written, 20);
    }

    #[test]
    fn test_get_blocks_window() {
        let buffer = ShiftingBuffer::new(50, 10, 10.0).unwrap();
        buffer.write(&ramp(0, 70));

        // Blocks 3..=7 are retained; 1 and 2 have been overwritten
        let window = buffer.get_blocks(3, 6).unwrap();
        assert_eq!(window.len(), 30);
        assert_eq!(window.samples, ramp(30, 30));
        assert_eq!(window.end_index, 6);
        assert_eq!(window.block_count, 3);

        let first = buffer.get_blocks(1, 3).unwrap();
        assert!((window.start_time - first.start_time - 1.0).abs() < 1e-9);

        assert!(buffer.get_blocks(1, 2).is_err());
        assert!(buffer.get_blocks(1, 8).is_err());
        assert!(buffer.get_blocks(6, 7).is_err());
        assert!(buffer.get_blocks(0, 7).is_err());
    }

    #[test]
    fn test_get_blocks_startup_underrun() {
        let buffer = ShiftingBuffer::new(50, 10, 10.0).unwrap();
        buffer.write(&ramp(0, 20));

        let window = buffer.get_blocks(5, 2).unwrap();
        assert_eq!(window.block_count, 2);
        assert_eq!(window.samples, ramp(0, 20));
    }

    #[test]
    fn test_listener_sees_window_before_overwrite() {
        let buffer = ShiftingBuffer::new(30, 10, 10.0).unwrap();
        let recorder = Arc::new(Recorder::default());
        buffer.set_listener(recorder.clone());

        // One large write cutting five blocks; each callback sees an intact window
        buffer.write(&ramp(0, 50));

        let events = recorder.events.lock();
        assert_eq!(events.iter().map(|e| e.end_index).collect::<Vec<_>>(), vec![1, 2, 3, 4, 5]);

        let windows = recorder.windows.lock();
        assert_eq!(windows.len(), 5);
        assert_eq!(windows[4].samples, ramp(20, 30));
        assert_eq!(windows[3].samples, ramp(10, 30));
    }

    #[test]
    fn test_mark_error_flags_next_block() {
        let buffer = ShiftingBuffer::new(40, 10, 10.0).unwrap();
        let recorder = Arc::new(Recorder::default());
        buffer.set_listener(recorder.clone());

        buffer.write(&ramp(0, 10));
        buffer.mark_error(8, 1, 1, 10);
        buffer.write(&ramp(10, 10));
        buffer.write(&ramp(20, 10));

        let events = recorder.events.lock();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].quality, None);
        assert_eq!(events[1].quality, Some(QualityCounters::new(8, 1, 1, 10)));
        assert!(events[1].is_degraded());
        assert_eq!(events[2].quality, None);

        assert_eq!(recorder.errors.lock().len(), 1);
        assert!(buffer.get_blocks(1, 2).unwrap().is_degraded());
        assert!(buffer.get_blocks(3, 3).unwrap().is_degraded());
        assert!(!buffer.get_blocks(1, 3).unwrap().is_degraded());
        assert_eq!(buffer.metrics().degraded_blocks, 1);
    }

    #[test]
    fn test_clear_resets_counters() {
        let buffer = ShiftingBuffer::new(40, 10, 10.0).unwrap();
        buffer.write(&ramp(0, 25));
        buffer.mark_error(1, 1, 0, 2);
        buffer.clear();

        let metrics = buffer.metrics();
        assert_eq!(metrics.end_index, 0);
        assert_eq!(metrics.pending, 0);
        assert_eq!(metrics.total_samples_written, 0);
        assert!(buffer.get_blocks(1, 1).is_err());

        let result = buffer.write(&ramp(0, 10));
        assert_eq!(result.completed, vec![1]);
        assert!(!buffer.get_blocks(1, 1).unwrap().is_degraded());
    }

    #[test]
    fn test_concurrent_reads_are_consistent() {
        let buffer = Arc::new(ShiftingBuffer::new(400, 100, 100.0).unwrap());
        let reader = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                for _ in 0..2000 {
                    let newest = buffer.end_index();
                    if newest == 0 {
                        continue;
                    }
                    if let Ok(block) = buffer.get_blocks(1, newest) {
                        // Each block holds one constant value: its end index
                        assert!(block.samples.iter().all(|&s| s == block.end_index as f64));
                    }
                }
            })
        };

        for index in 1..=500u64 {
            buffer.write(&vec![index as f64; 100]);
        }
        reader.join().unwrap();
    }
}
