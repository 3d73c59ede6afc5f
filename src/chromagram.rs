//! Chromagram
//!
//! 12-bin pitch-class energy computed from the spectral peaks of one analysis
//! window.
//!
//! Derived from the streaming chromagram by Adam Stark, Queen Mary University of London.
//! https://github.com/adamstark/Chord-Detector-and-Chromagram

use std::{f32::consts::PI, sync::Arc};

use rustfft::{num_complex::Complex, Fft, FftPlanner};
use thiserror::Error;

use crate::chord_detector::NoteName;

const SEMITONES: usize = 12;

/// Errors returned by the Chromagram pipeline.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChromagramError {
    /// Window received was not of the expected size.
    #[error("expected window of length {expected}, got {got}")]
    InvalidWindowSize {
        /// The expected window length.
        expected: usize,
        /// The actual length received.
        got: usize,
    },

    /// An error occurred during the configuration of the Chromagram.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Builder for a Chromagram.
pub struct ChromagramBuilder {
    window_size: usize,
    sampling_rate: u32,
    min_frequency: f32,
    max_frequency: f32,
    peak_threshold: f32,
}

impl ChromagramBuilder {
    /// Start with default parameters:
    /// window_size = 4096, sampling_rate = 44_100,
    /// min_frequency = 50 Hz, max_frequency = 4 kHz, peak_threshold = 0.1.
    pub fn new() -> Self {
        ChromagramBuilder {
            window_size: 4096,
            sampling_rate: 44_100,
            min_frequency: 50.0,
            max_frequency: 4_000.0,
            peak_threshold: 0.1,
        }
    }

    /// Set the number of samples per analysis window.
    pub fn window_size(mut self, size: usize) -> Self {
        self.window_size = size;
        self
    }

    /// Set the sampling rate of the audio.
    pub fn sampling_rate(mut self, rate: u32) -> Self {
        self.sampling_rate = rate;
        self
    }

    /// Ignore spectral peaks below this frequency.
    pub fn min_frequency(mut self, hz: f32) -> Self {
        self.min_frequency = hz;
        self
    }

    /// Ignore spectral peaks above this frequency (clamped to Nyquist).
    pub fn max_frequency(mut self, hz: f32) -> Self {
        self.max_frequency = hz;
        self
    }

    /// Peaks weaker than this fraction of the strongest one are ignored.
    pub fn peak_threshold(mut self, ratio: f32) -> Self {
        self.peak_threshold = ratio;
        self
    }

    /// Finalize and create the Chromagram.
    pub fn build(self) -> Result<Chromagram, ChromagramError> {
        if self.window_size < 4 {
            return Err(ChromagramError::Configuration(
                "window_size must be at least 4".into(),
            ));
        }
        if self.sampling_rate == 0 {
            return Err(ChromagramError::Configuration(
                "sampling_rate cannot be zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.peak_threshold) {
            return Err(ChromagramError::Configuration(
                "peak_threshold must be within 0.0..=1.0".into(),
            ));
        }

        let bin_width = self.sampling_rate as f32 / self.window_size as f32;
        let nyquist_bin = self.window_size / 2;
        let min_bin = ((self.min_frequency / bin_width).ceil() as usize).max(1);
        let max_bin = ((self.max_frequency / bin_width).floor() as usize).min(nyquist_bin - 1);
        if min_bin >= max_bin {
            return Err(ChromagramError::Configuration(
                "frequency range covers no spectral bins".into(),
            ));
        }

        // Prepare FFT plan once
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.window_size);

        Ok(Chromagram {
            fft_buffer: vec![Complex { re: 0.0, im: 0.0 }; self.window_size],
            magnitude: vec![0.0; nyquist_bin + 1],
            window: make_hamming_window(self.window_size),
            chroma: [0.0; SEMITONES],
            window_size: self.window_size,
            bin_width,
            min_bin,
            max_bin,
            peak_threshold: self.peak_threshold,
            fft,
        })
    }
}

impl Default for ChromagramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Spectral-peak chromagram calculator.
pub struct Chromagram {
    fft_buffer: Vec<Complex<f32>>,
    magnitude: Vec<f32>,
    window: Vec<f32>,
    chroma: [f32; SEMITONES],
    window_size: usize,
    bin_width: f32,
    min_bin: usize,
    max_bin: usize,
    peak_threshold: f32,
    fft: Arc<dyn Fft<f32>>,
}

impl Chromagram {
    /// Start customizing with a builder.
    pub fn builder() -> ChromagramBuilder {
        ChromagramBuilder::new()
    }

    /// Compute the chromagram of one window, normalized so its strongest bin is 1.
    /// An all-zero window yields an all-zero chromagram.
    pub fn compute(&mut self, window: &[f32]) -> Result<[f32; SEMITONES], ChromagramError> {
        if window.len() != self.window_size {
            return Err(ChromagramError::InvalidWindowSize {
                expected: self.window_size,
                got: window.len(),
            });
        }

        self.compute_spectrum(window);
        self.compute_chromagram();
        Ok(self.chroma)
    }

    #[inline]
    fn compute_spectrum(&mut self, window: &[f32]) {
        for ((dst, &sample), &w) in self.fft_buffer.iter_mut().zip(window).zip(&self.window) {
            dst.re = sample * w;
            dst.im = 0.0;
        }

        self.fft.process(&mut self.fft_buffer);

        for (i, mag) in self.magnitude.iter_mut().enumerate() {
            let c = &self.fft_buffer[i];
            *mag = (c.re * c.re + c.im * c.im).sqrt();
        }
    }

    #[inline]
    fn compute_chromagram(&mut self) {
        self.chroma = [0.0; SEMITONES];

        let strongest = self.magnitude[self.min_bin..=self.max_bin]
            .iter()
            .cloned()
            .fold(0.0_f32, f32::max);
        if strongest <= 0.0 {
            return;
        }
        let floor = strongest * self.peak_threshold;

        for k in self.min_bin..=self.max_bin {
            let (a, b, c) = (
                self.magnitude[k - 1],
                self.magnitude[k],
                self.magnitude[k + 1],
            );
            if b < floor || b <= a || b < c {
                continue;
            }

            let denom = a - 2.0 * b + c;
            let delta = if denom.abs() > f32::EPSILON {
                (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
            } else {
                0.0
            };
            let freq = (k as f32 + delta) * self.bin_width;
            if let Some(pc) = NoteName::pitch_class(freq) {
                self.chroma[pc] += b;
            }
        }

        let peak = self.chroma.iter().cloned().fold(0.0_f32, f32::max);
        if peak > 0.0 {
            for bin in self.chroma.iter_mut() {
                *bin /= peak;
            }
        }
    }
}

/// Hamming window of `len` samples.
fn make_hamming_window(len: usize) -> Vec<f32> {
    let denom = (len as f32 - 1.0).max(1.0);
    (0..len)
        .map(|n| 0.54 - 0.46 * (2.0 * PI * n as f32 / denom).cos())
        .collect()
}
