use crate::streaming::types::{StreamError, StreamResult};
use rustfft::{num_complex::Complex, FftPlanner};
use std::cell::RefCell;

// Thread-local FFT planner for efficient reuse across dispatch workers
thread_local! {
    static FFT_PLANNER: RefCell<FftPlanner<f64>> = RefCell::new(FftPlanner::new());
}

/// Frequency-domain transform used by the spectrum cache
pub trait SpectrumTransform: Send + Sync {
    /// Unnormalized magnitudes of the one-sided spectrum, bins `0..=n/2`
    fn magnitudes(&self, input: &[f64]) -> StreamResult<Vec<f64>>;
}

/// Real-input FFT via rustfft
#[derive(Debug, Default, Clone, Copy)]
pub struct FftTransform;

impl SpectrumTransform for FftTransform {
    fn magnitudes(&self, input: &[f64]) -> StreamResult<Vec<f64>> {
        let n = input.len();
        if n < 2 {
            return Err(StreamError::Transform(format!(
                "need at least 2 samples, got {}",
                n
            )));
        }
        if let Some(pos) = input.iter().position(|x| !x.is_finite()) {
            return Err(StreamError::Transform(format!(
                "non-finite sample at position {}",
                pos
            )));
        }

        let mut buffer: Vec<Complex<f64>> = input.iter().map(|&x| Complex::new(x, 0.0)).collect();

        FFT_PLANNER.with(|planner| {
            let fft = planner.borrow_mut().plan_fft_forward(n);
            fft.process(&mut buffer);
        });

        Ok(buffer[..n / 2 + 1].iter().map(|c| c.norm()).collect())
    }
}
