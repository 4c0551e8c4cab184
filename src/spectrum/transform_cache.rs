// Memoized block spectra
//
// Several consumers usually ask for the spectrum of the same window (for
// example a 1 s window handed to both an indicator pipeline and a file
// writer). The cache keys spectra by a BLAKE3 digest of the window, so the
// transform runs once per window no matter how many consumers request it.
//
// Check, compute and insert happen under one mutex: a key is computed at most
// once, at the cost of serializing unrelated computations.

use super::transform::{FftTransform, SpectrumTransform};
use crate::streaming::block::{Block, Sample};
use crate::streaming::types::{StreamError, StreamResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Handling of blocks shorter than the transform size
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    /// Return no spectrum; the caller skips the block
    None,

    /// Pad with trailing zeros
    #[default]
    ZeroFill,

    /// Repeat the block's own samples cyclically
    DataFill,
}

/// Content and time derived identity of a block
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey([u8; 32]);

impl CacheKey {
    /// H(end_index || start_time || block_count || len || samples)
    pub fn of(block: &Block) -> Self {
        Self::hash(block, None)
    }

    /// Key of `block` as fed to a `transform_size`-point transform
    ///
    /// Blocks that need padding also hash the fill policy, since each policy
    /// yields a different transform input.
    pub fn for_transform(block: &Block, transform_size: usize, fill: FillPolicy) -> Self {
        let padding = (block.len() < transform_size).then_some(fill);
        Self::hash(block, padding)
    }

    fn hash(block: &Block, padding: Option<FillPolicy>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&block.end_index.to_le_bytes());
        hasher.update(&block.start_time.to_bits().to_le_bytes());
        hasher.update(&(block.block_count as u64).to_le_bytes());
        hasher.update(&(block.samples.len() as u64).to_le_bytes());
        for sample in &block.samples {
            hasher.update(&sample.to_le_bytes());
        }
        if let Some(policy) = padding {
            let tag: u8 = match policy {
                FillPolicy::None => 0,
                FillPolicy::ZeroFill => 1,
                FillPolicy::DataFill => 2,
            };
            hasher.update(&[tag]);
        }
        Self(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CacheKey({})", blake3::Hash::from(self.0).to_hex())
    }
}

/// Magnitude spectrum of one block window
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SpectrumBlock {
    pub magnitudes: Vec<f64>,
    pub frequency_step: f64,
    pub first_frequency: f64,
    pub last_frequency: f64,

    /// Samples in the source window before padding or truncation
    pub source_samples: usize,
    pub start_time: f64,
    pub end_time: f64,
    pub end_index: u64,
    pub padded: bool,
}

impl SpectrumBlock {
    /// Frequency of bin `i`
    pub fn frequency(&self, i: usize) -> f64 {
        self.first_frequency + i as f64 * self.frequency_step
    }

    /// Frequency of the largest magnitude
    pub fn peak_frequency(&self) -> Option<f64> {
        self.magnitudes
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_finite())
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(i, _)| self.frequency(i))
    }
}

/// Cache counters
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub skipped: u64,
}

/// Bring `samples` to exactly `size` entries according to `policy`
///
/// Longer inputs keep their most recent `size` samples. Returns `None` when
/// the policy is `FillPolicy::None` and padding would be needed, or when
/// there is nothing to pad from.
pub fn fit_to_size(samples: &[Sample], size: usize, policy: FillPolicy) -> Option<Vec<Sample>> {
    if samples.len() >= size {
        return Some(samples[samples.len() - size..].to_vec());
    }
    if samples.is_empty() {
        return None;
    }

    match policy {
        FillPolicy::None => None,
        FillPolicy::ZeroFill => {
            let mut padded = Vec::with_capacity(size);
            padded.extend_from_slice(samples);
            padded.resize(size, 0.0);
            Some(padded)
        }
        FillPolicy::DataFill => Some(samples.iter().copied().cycle().take(size).collect()),
    }
}

pub struct TransformCache {
    sample_rate: f64,
    transform_size: usize,
    block_duration: Duration,
    target_resolution_hz: f64,
    transform: Arc<dyn SpectrumTransform>,
    entries: Mutex<HashMap<CacheKey, Arc<SpectrumBlock>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    skipped: AtomicU64,
}

impl TransformCache {
    /// Cache backed by the rustfft transform
    pub fn new(
        sample_rate: f64,
        transform_size: usize,
        block_duration: Duration,
        target_resolution_hz: f64,
    ) -> StreamResult<Self> {
        Self::with_transform(
            sample_rate,
            transform_size,
            block_duration,
            target_resolution_hz,
            Arc::new(FftTransform),
        )
    }

    pub fn with_transform(
        sample_rate: f64,
        transform_size: usize,
        block_duration: Duration,
        target_resolution_hz: f64,
        transform: Arc<dyn SpectrumTransform>,
    ) -> StreamResult<Self> {
        if !(sample_rate > 0.0) {
            return Err(StreamError::InvalidConfig(format!(
                "sample rate must be positive, got {}",
                sample_rate
            )));
        }
        // Dropping DC must leave at least two bins to derive a step from
        if transform_size < 4 {
            return Err(StreamError::InvalidConfig(format!(
                "transform size must be at least 4, got {}",
                transform_size
            )));
        }

        let block_samples = (sample_rate * block_duration.as_secs_f64()).round() as usize;
        if block_samples < transform_size {
            log::info!(
                "[FFT-CACHE] Blocks of {} samples are shorter than the {}-point transform; fill policy applies",
                block_samples,
                transform_size
            );
        } else if block_samples > transform_size {
            log::info!(
                "[FFT-CACHE] Blocks of {} samples exceed the {}-point transform; newest samples are used",
                block_samples,
                transform_size
            );
        }

        Ok(Self {
            sample_rate,
            transform_size,
            block_duration,
            target_resolution_hz,
            transform,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
        })
    }

    pub fn transform_size(&self) -> usize {
        self.transform_size
    }

    pub fn block_duration(&self) -> Duration {
        self.block_duration
    }

    /// Spectrum of `block`, computed on first request and cached afterwards
    ///
    /// Returns `Ok(None)` when the block is too short and `fill` is
    /// `FillPolicy::None`. Transform errors are returned and nothing is cached.
    /// Short blocks are cached per fill policy.
    pub fn get(&self, block: &Block, fill: FillPolicy) -> StreamResult<Option<Arc<SpectrumBlock>>> {
        let key = CacheKey::for_transform(block, self.transform_size, fill);
        let mut entries = self.entries.lock();

        if let Some(hit) = entries.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Some(Arc::clone(hit)));
        }

        let input = match fit_to_size(&block.samples, self.transform_size, fill) {
            Some(input) => input,
            None => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                log::debug!(
                    "[FFT-CACHE] Skipping block {} ({} of {} samples, policy {:?})",
                    block.end_index,
                    block.len(),
                    self.transform_size,
                    fill
                );
                return Ok(None);
            }
        };

        self.misses.fetch_add(1, Ordering::Relaxed);
        let spectrum = Arc::new(self.compute(&input, block)?);
        entries.insert(key, Arc::clone(&spectrum));

        log::trace!(
            "[FFT-CACHE] Computed block {} ({} entries)",
            block.end_index,
            entries.len()
        );
        Ok(Some(spectrum))
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.lock().len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }

    fn compute(&self, input: &[Sample], block: &Block) -> StreamResult<SpectrumBlock> {
        let raw = self.transform.magnitudes(input)?;
        if raw.len() < 3 {
            return Err(StreamError::Transform(format!(
                "transform returned {} bins",
                raw.len()
            )));
        }

        // Bins 0..=n/2 are spaced sr/n apart, i.e. (sr/2)/(bins-1) for even n.
        // DC is dropped, so the first kept bin sits one step above zero.
        let step = self.sample_rate / input.len() as f64;
        let scale = 2.0 / input.len() as f64;
        let magnitudes: Vec<f64> = raw[1..].iter().map(|m| m * scale).collect();

        let (magnitudes, first_frequency, frequency_step) =
            downsample(magnitudes, step, step, self.target_resolution_hz);
        let last_frequency = first_frequency + (magnitudes.len() - 1) as f64 * frequency_step;

        Ok(SpectrumBlock {
            magnitudes,
            frequency_step,
            first_frequency,
            last_frequency,
            source_samples: block.len(),
            start_time: block.start_time,
            end_time: block.end_time(self.sample_rate),
            end_index: block.end_index,
            padded: block.len() < self.transform_size,
        })
    }
}

/// Average groups of adjacent bins so the step approaches `target_hz`
///
/// Returns the pooled magnitudes with the new first frequency and step. Each
/// pooled bin is labelled at the centre of its group. Targets finer than the
/// native step leave the spectrum unchanged.
fn downsample(
    magnitudes: Vec<f64>,
    first: f64,
    step: f64,
    target_hz: f64,
) -> (Vec<f64>, f64, f64) {
    if !(target_hz > step) {
        return (magnitudes, first, step);
    }

    let factor = (target_hz / step).round() as usize;
    if factor <= 1 {
        return (magnitudes, first, step);
    }

    let pooled = magnitudes
        .chunks(factor)
        .map(|group| group.iter().sum::<f64>() / group.len() as f64)
        .collect();
    let centre = first + (factor - 1) as f64 / 2.0 * step;
    (pooled, centre, step * factor as f64)
}
