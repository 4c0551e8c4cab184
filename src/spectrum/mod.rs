// Spectrum computation for completed blocks

pub mod transform;
pub mod transform_cache;

pub use transform::{FftTransform, SpectrumTransform};
pub use transform_cache::{fit_to_size, CacheKey, CacheStats, FillPolicy, SpectrumBlock, TransformCache};
