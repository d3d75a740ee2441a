use std::sync::Arc;

use realfft::{RealFftPlanner, RealToComplex};
use rustfft::num_complex::Complex32;

use crate::Sample;

// To turn a window of samples into bucket powers, we
// * multiply with the window function
// * real FFT
// * rescale as the fixed point transform does (X[k] / 2, its log2(N) - 1 bit post shift)
// * magnitude squared, no square root, power is what we compare against

const OUTPUT_SCALE: f32 = 0.5;

/// Symmetric Hann window, matching `numpy.hanning`
pub fn hann(len: usize) -> Vec<f32> {
    if len < 2 {
        return vec![1.0; len];
    }
    let denom = (len - 1) as f32;
    (0..len)
        .map(|n| 0.5 - 0.5 * (core::f32::consts::TAU * n as f32 / denom).cos())
        .collect()
}

pub struct PowerSpectrum {
    fft: Arc<dyn RealToComplex<f32>>,
    window: Vec<f32>,
    working: Vec<f32>,
    output: Vec<Complex32>,
    scratch: Vec<Complex32>,
}

impl std::fmt::Debug for PowerSpectrum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PowerSpectrum")
            .field("size", &self.window.len())
            .finish_non_exhaustive()
    }
}

impl PowerSpectrum {
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "FFT size must be a power of two");
        let fft = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        Self {
            scratch: fft.make_scratch_vec(),
            output: fft.make_output_vec(),
            working: fft.make_input_vec(),
            window: hann(size),
            fft,
        }
    }

    pub fn size(&self) -> usize {
        self.window.len()
    }

    /// Fill `buckets` (`size / 2` of them) with the power of each frequency bucket
    pub fn process(&mut self, input: &[Sample], buckets: &mut [u64]) {
        assert_eq!(input.len(), self.size());
        assert_eq!(buckets.len(), self.size() / 2);
        // The transform uses its input as scratch, so work on a copy
        for ((w, x), win) in self.working.iter_mut().zip(input).zip(&self.window) {
            *w = *x as f32 * win;
        }
        if self
            .fft
            .process_with_scratch(&mut self.working, &mut self.output, &mut self.scratch)
            .is_err()
        {
            // Only happens on length mismatch, which the asserts rule out
            buckets.fill(0);
            return;
        }
        for (bucket, c) in buckets.iter_mut().zip(&self.output) {
            *bucket = (*c * OUTPUT_SCALE).norm_sqr().round() as u64;
        }
    }
}
