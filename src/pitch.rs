//! Pitch Detector
//!
//! Fundamental frequency estimation using the normalized square difference
//! function (NSDF), computed from an FFT autocorrelation.

use std::sync::Arc;

use rustfft::{num_complex::Complex, Fft, FftPlanner};

use crate::analysis::AnalysisConfig;

/// Mean-square level below which a window counts as silence.
const SILENCE_ENERGY: f32 = 1e-10;

/// A key maximum within this fraction of the highest one is taken as the period.
const KEY_MAXIMUM_RATIO: f32 = 0.9;

/// A detected fundamental.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct PitchEstimate {
    /// Fundamental frequency in Hz.
    pub frequency_hz: f32,
    /// NSDF value at the chosen period, in `0.0..=1.0`. Higher is more periodic.
    pub clarity: f32,
}

/// Windowed pitch detector.
pub struct PitchDetector {
    window_size: usize,
    sample_rate: f32,
    min_lag: usize,
    max_lag: usize,
    fft_len: usize,
    forward: Arc<dyn Fft<f32>>,
    inverse: Arc<dyn Fft<f32>>,
    spectrum: Vec<Complex<f32>>,
    centered: Vec<f32>,
    nsdf: Vec<f32>,
    key_maxima: Vec<(usize, f32)>,
}

impl PitchDetector {
    /// Create a detector for windows of `config.window_size()` samples,
    /// searching between the configured minimum and maximum frequency.
    pub fn new(config: &AnalysisConfig) -> Self {
        let window_size = config.window_size();
        let sample_rate = config.sample_rate() as f32;
        let fft_len = (window_size * 2).next_power_of_two();

        let mut planner = FftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(fft_len);
        let inverse = planner.plan_fft_inverse(fft_len);

        let min_lag = ((sample_rate / config.max_frequency()).floor() as usize).max(2);
        let max_lag = ((sample_rate / config.min_frequency()).ceil() as usize)
            .min(window_size.saturating_sub(2));

        PitchDetector {
            window_size,
            sample_rate,
            min_lag,
            max_lag,
            fft_len,
            forward,
            inverse,
            spectrum: vec![Complex { re: 0.0, im: 0.0 }; fft_len],
            centered: vec![0.0; window_size],
            nsdf: vec![0.0; window_size],
            key_maxima: Vec::new(),
        }
    }

    /// Estimate the fundamental of `window`.
    ///
    /// Returns `None` for silence or when no periodicity is found inside the
    /// search range. Otherwise returns the best period even if its clarity is low;
    /// thresholding is left to the caller.
    pub fn detect(&mut self, window: &[f32]) -> Option<PitchEstimate> {
        let n = window.len().min(self.window_size);
        if n < 4 {
            return None;
        }
        let window = &window[..n];

        // Remove DC so offsets don't read as correlation
        let mean = window.iter().sum::<f32>() / n as f32;
        let mut energy = 0.0;
        for (dst, &x) in self.centered.iter_mut().zip(window) {
            *dst = x - mean;
            energy += *dst * *dst;
        }
        if energy / (n as f32) < SILENCE_ENERGY {
            return None;
        }

        self.autocorrelate(n);
        self.normalize(n, energy);
        self.collect_key_maxima(n);

        let highest = self
            .key_maxima
            .iter()
            .map(|&(_, v)| v)
            .fold(f32::NEG_INFINITY, f32::max);
        let &(tau, _) = self
            .key_maxima
            .iter()
            .find(|&&(_, v)| v >= highest * KEY_MAXIMUM_RATIO)?;

        let (period, clarity) = self.refine(tau);
        if period <= 0.0 {
            return None;
        }

        Some(PitchEstimate {
            frequency_hz: self.sample_rate / period,
            clarity: clarity.clamp(0.0, 1.0),
        })
    }

    /// Autocorrelation of the centered window via zero-padded FFT.
    /// Leaves `r(τ) * fft_len` in `spectrum[τ].re`.
    fn autocorrelate(&mut self, n: usize) {
        for (i, c) in self.spectrum.iter_mut().enumerate() {
            c.re = if i < n { self.centered[i] } else { 0.0 };
            c.im = 0.0;
        }
        self.forward.process(&mut self.spectrum);
        for c in self.spectrum.iter_mut() {
            *c = Complex {
                re: c.norm_sqr(),
                im: 0.0,
            };
        }
        self.inverse.process(&mut self.spectrum);
    }

    /// NSDF: `2 r(τ) / m(τ)` with `m(τ)` the summed energy of both overlapping parts.
    fn normalize(&mut self, n: usize, energy: f32) {
        let x = &self.centered;
        let scale = 1.0 / self.fft_len as f32;
        let upper = (self.max_lag + 1).min(n - 1);

        let mut m = 2.0 * energy;
        self.nsdf[0] = 1.0;
        for tau in 1..=upper {
            m -= x[tau - 1] * x[tau - 1] + x[n - tau] * x[n - tau];
            let r = self.spectrum[tau].re * scale;
            self.nsdf[tau] = if m > f32::EPSILON { 2.0 * r / m } else { 0.0 };
        }
    }

    /// Maximum of every positive lobe after the first zero crossing.
    fn collect_key_maxima(&mut self, n: usize) {
        self.key_maxima.clear();
        let upper = self.max_lag.min(n - 2);

        let mut tau = 1;
        while tau <= upper && self.nsdf[tau] > 0.0 {
            tau += 1;
        }

        let mut lobe: Option<(usize, f32)> = None;
        while tau <= upper {
            let v = self.nsdf[tau];
            if v > 0.0 {
                let higher = match lobe {
                    Some((_, best)) => v > best,
                    None => true,
                };
                if tau >= self.min_lag && higher {
                    lobe = Some((tau, v));
                }
            } else if let Some(peak) = lobe.take() {
                self.key_maxima.push(peak);
            }
            tau += 1;
        }
        if let Some(peak) = lobe {
            self.key_maxima.push(peak);
        }
    }

    /// Parabolic interpolation around `tau`; returns (period, peak value).
    fn refine(&self, tau: usize) -> (f32, f32) {
        let a = self.nsdf[tau - 1];
        let b = self.nsdf[tau];
        let c = self.nsdf[tau + 1];
        let denom = a - 2.0 * b + c;
        if denom.abs() <= f32::EPSILON {
            return (tau as f32, b);
        }
        let delta = (0.5 * (a - c) / denom).clamp(-0.5, 0.5);
        (tau as f32 + delta, b - 0.25 * (a - c) * delta)
    }
}
