//! Analysis Engine
//!
//! Accumulates captured audio into overlapping windows and turns each full
//! window into an [`AnalysisResult`]: the fundamental frequency plus the
//! closest chord.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::chord_detector::{Chord, ChordDetector, ChordError, NoteName};
use crate::chromagram::{Chromagram, ChromagramError};
use crate::frame::AudioFrame;
use crate::pitch::PitchDetector;

/// Label reported when no chord can be named.
pub const UNKNOWN_CHORD: &str = "unknown";

/// Upper bound of the spectral range used for chord classification.
const CHROMA_MAX_FREQUENCY: f32 = 4_000.0;

/// Errors raised by the analysis stage.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    /// A frame arrived at a different rate than the engine was built for.
    #[error("expected {expected} Hz audio, got {got} Hz")]
    SampleRateMismatch {
        /// Rate the engine was configured with.
        expected: u32,
        /// Rate carried by the frame.
        got: u32,
    },

    /// The analysis settings are inconsistent.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Spectrum computation failed.
    #[error(transparent)]
    Chromagram(#[from] ChromagramError),

    /// Chord classification failed.
    #[error(transparent)]
    Chord(#[from] ChordError),
}

/// Settings for an [`AnalysisEngine`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    sample_rate: u32,
    window_size: usize,
    hop_size: usize,
    min_frequency: f32,
    max_frequency: f32,
    confidence_threshold: f32,
    peak_threshold: f32,
    bleed: f32,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        AnalysisConfig {
            sample_rate: 44_100,
            window_size: 4096,
            hop_size: 2048,
            min_frequency: 50.0,
            max_frequency: 1_500.0,
            confidence_threshold: 0.6,
            peak_threshold: 0.1,
            bleed: 0.157,
        }
    }
}

impl AnalysisConfig {
    /// Start customizing with a builder.
    pub fn builder() -> AnalysisConfigBuilder {
        AnalysisConfigBuilder::new()
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Samples per analysis window.
    pub fn window_size(&self) -> usize {
        self.window_size
    }

    /// New samples between two consecutive windows.
    pub fn hop_size(&self) -> usize {
        self.hop_size
    }

    /// Lowest detectable fundamental in Hz.
    pub fn min_frequency(&self) -> f32 {
        self.min_frequency
    }

    /// Highest detectable fundamental in Hz.
    pub fn max_frequency(&self) -> f32 {
        self.max_frequency
    }

    /// Minimum pitch clarity for a result to count as detected.
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    /// Same settings for a different sample rate.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        self.sample_rate = sample_rate;
        self
    }

    /// Check that every setting is in range and the settings agree with each other.
    pub fn validate(&self) -> Result<(), AnalysisError> {
        let fail = |msg: &str| Err(AnalysisError::Configuration(msg.to_string()));

        if self.sample_rate == 0 {
            return fail("sample_rate cannot be zero");
        }
        if self.window_size < 256 || !self.window_size.is_power_of_two() {
            return fail("window_size must be a power of two of at least 256");
        }
        if self.hop_size == 0 || self.hop_size > self.window_size {
            return fail("hop_size must be within 1..=window_size");
        }
        if !self.min_frequency.is_finite() || self.min_frequency <= 0.0 {
            return fail("min_frequency must be positive");
        }
        if !self.max_frequency.is_finite() || self.max_frequency <= self.min_frequency {
            return fail("max_frequency must be above min_frequency");
        }
        if self.max_frequency >= self.sample_rate as f32 / 2.0 {
            return fail("max_frequency must be below the Nyquist frequency");
        }
        if self.sample_rate as f32 / self.min_frequency > (self.window_size / 2) as f32 {
            return fail("window_size is too short to hold two periods of min_frequency");
        }
        for (name, value) in [
            ("confidence_threshold", self.confidence_threshold),
            ("peak_threshold", self.peak_threshold),
            ("bleed", self.bleed),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AnalysisError::Configuration(format!(
                    "{name} must be within 0.0..=1.0"
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`AnalysisConfig`].
pub struct AnalysisConfigBuilder {
    config: AnalysisConfig,
}

impl AnalysisConfigBuilder {
    /// Start with default parameters:
    /// sample_rate = 44_100, window_size = 4096, hop_size = 2048,
    /// min_frequency = 50 Hz, max_frequency = 1.5 kHz,
    /// confidence_threshold = 0.6, peak_threshold = 0.1, bleed = 0.157.
    pub fn new() -> Self {
        AnalysisConfigBuilder {
            config: AnalysisConfig::default(),
        }
    }

    /// Set the sample rate of the incoming audio.
    pub fn sample_rate(mut self, rate: u32) -> Self {
        self.config.sample_rate = rate;
        self
    }

    /// Set the analysis window length (power of two).
    pub fn window_size(mut self, size: usize) -> Self {
        self.config.window_size = size;
        self
    }

    /// Set how many new samples trigger the next window.
    pub fn hop_size(mut self, size: usize) -> Self {
        self.config.hop_size = size;
        self
    }

    /// Set the lowest detectable fundamental.
    pub fn min_frequency(mut self, hz: f32) -> Self {
        self.config.min_frequency = hz;
        self
    }

    /// Set the highest detectable fundamental.
    pub fn max_frequency(mut self, hz: f32) -> Self {
        self.config.max_frequency = hz;
        self
    }

    /// Set the minimum pitch clarity (0.0..=1.0).
    pub fn confidence_threshold(mut self, threshold: f32) -> Self {
        self.config.confidence_threshold = threshold;
        self
    }

    /// Set the relative level a spectral peak needs to enter the chromagram.
    pub fn peak_threshold(mut self, ratio: f32) -> Self {
        self.config.peak_threshold = ratio;
        self
    }

    /// Set the chord detector's bleed suppression factor.
    pub fn bleed(mut self, bleed: f32) -> Self {
        self.config.bleed = bleed;
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<AnalysisConfig, AnalysisError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for AnalysisConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// What an [`AnalysisResult`] represents.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AnalysisStatus {
    /// No window has been analyzed yet.
    NoData,
    /// A window was analyzed but held silence or no clear pitch.
    Unknown,
    /// A pitch was found and a chord assigned.
    Detected,
}

/// Snapshot produced from one analysis window.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    /// Fundamental frequency in Hz, `0.0` unless detected.
    pub frequency_hz: f32,
    /// Chord symbol, or [`UNKNOWN_CHORD`].
    pub chord_label: String,
    /// Detected chord, if any.
    pub chord: Option<Chord>,
    /// Pitch clarity of the window, `0.0..=1.0`.
    pub clarity: f32,
    /// Position in the result stream, starting at 1. `0` means no data yet.
    pub sequence: u64,
    /// Number of samples consumed when the window closed.
    pub end_sample: u64,
    /// Kind of result.
    pub status: AnalysisStatus,
}

impl AnalysisResult {
    /// Placeholder published before the first window completes.
    pub fn no_data() -> Self {
        AnalysisResult {
            frequency_hz: 0.0,
            chord_label: UNKNOWN_CHORD.to_string(),
            chord: None,
            clarity: 0.0,
            sequence: 0,
            end_sample: 0,
            status: AnalysisStatus::NoData,
        }
    }

    /// `true` when a pitch and chord were found.
    pub fn is_detected(&self) -> bool {
        self.status == AnalysisStatus::Detected
    }

    fn unknown(clarity: f32, sequence: u64, end_sample: u64) -> Self {
        AnalysisResult {
            clarity,
            sequence,
            end_sample,
            status: AnalysisStatus::Unknown,
            ..Self::no_data()
        }
    }

    fn detected(
        frequency_hz: f32,
        clarity: f32,
        chord: Chord,
        sequence: u64,
        end_sample: u64,
    ) -> Self {
        AnalysisResult {
            frequency_hz,
            chord_label: chord.label(),
            chord: Some(chord),
            clarity,
            sequence,
            end_sample,
            status: AnalysisStatus::Detected,
        }
    }
}

impl Default for AnalysisResult {
    fn default() -> Self {
        Self::no_data()
    }
}

/// Windowed pitch and chord analysis over a stream of frames.
pub struct AnalysisEngine {
    config: AnalysisConfig,
    history: Vec<f32>,
    head: usize,
    filled: usize,
    since_last: usize,
    total_samples: u64,
    sequence: u64,
    window: Vec<f32>,
    pitch: PitchDetector,
    chromagram: Chromagram,
    detector: ChordDetector,
}

impl AnalysisEngine {
    /// Build an engine, validating `config` first.
    pub fn new(config: AnalysisConfig) -> Result<Self, AnalysisError> {
        config.validate()?;

        let nyquist = config.sample_rate as f32 / 2.0;
        let chromagram = Chromagram::builder()
            .window_size(config.window_size)
            .sampling_rate(config.sample_rate)
            .min_frequency(config.min_frequency)
            .max_frequency(CHROMA_MAX_FREQUENCY.min(nyquist))
            .peak_threshold(config.peak_threshold)
            .build()?;
        let detector = ChordDetector::builder().bleed(config.bleed).build();
        let pitch = PitchDetector::new(&config);

        Ok(AnalysisEngine {
            history: vec![0.0; config.window_size],
            head: 0,
            filled: 0,
            since_last: 0,
            total_samples: 0,
            sequence: 0,
            window: vec![0.0; config.window_size],
            pitch,
            chromagram,
            detector,
            config,
        })
    }

    /// Settings the engine runs with.
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Feed one captured frame, downmixed to mono.
    ///
    /// Returns the newest result if at least one window completed inside the frame.
    pub fn push_frame(
        &mut self,
        frame: &AudioFrame,
    ) -> Result<Option<AnalysisResult>, AnalysisError> {
        if frame.sample_rate() != self.config.sample_rate {
            return Err(AnalysisError::SampleRateMismatch {
                expected: self.config.sample_rate,
                got: frame.sample_rate(),
            });
        }

        let mut latest = None;
        for sample in frame.mono_samples() {
            if let Some(result) = self.push_sample(sample)? {
                latest = Some(result);
            }
        }
        Ok(latest)
    }

    /// Feed mono samples at the configured rate.
    pub fn push_samples(
        &mut self,
        samples: &[f32],
    ) -> Result<Option<AnalysisResult>, AnalysisError> {
        let mut latest = None;
        for &sample in samples {
            if let Some(result) = self.push_sample(sample)? {
                latest = Some(result);
            }
        }
        Ok(latest)
    }

    /// Forget all history; the next result needs a full window again.
    /// Sequence numbering continues so results stay ordered.
    pub fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
        self.head = 0;
        self.filled = 0;
        self.since_last = 0;
    }

    fn push_sample(&mut self, sample: f32) -> Result<Option<AnalysisResult>, AnalysisError> {
        let size = self.config.window_size;
        self.history[self.head] = sample;
        self.head = (self.head + 1) % size;
        self.filled = (self.filled + 1).min(size);
        self.since_last += 1;
        self.total_samples += 1;

        if self.filled < size || self.since_last < self.config.hop_size {
            return Ok(None);
        }
        self.since_last = 0;
        self.analyze_window().map(Some)
    }

    fn analyze_window(&mut self) -> Result<AnalysisResult, AnalysisError> {
        // Unwrap the ring, oldest sample first
        let tail = self.config.window_size - self.head;
        self.window[..tail].copy_from_slice(&self.history[self.head..]);
        self.window[tail..].copy_from_slice(&self.history[..self.head]);

        self.sequence += 1;
        let (sequence, end_sample) = (self.sequence, self.total_samples);

        let estimate = match self.pitch.detect(&self.window) {
            Some(estimate) if estimate.clarity >= self.config.confidence_threshold => estimate,
            other => {
                let clarity = other.map_or(0.0, |e| e.clarity);
                return Ok(AnalysisResult::unknown(clarity, sequence, end_sample));
            }
        };

        let mut chroma = self.chromagram.compute(&self.window)?;
        if let Some(pc) = NoteName::pitch_class(estimate.frequency_hz) {
            chroma[pc] = 1.0;
        }
        let chord = self
            .detector
            .detect_chord(&chroma, Some(estimate.frequency_hz))?;

        Ok(AnalysisResult::detected(
            estimate.frequency_hz,
            estimate.clarity,
            chord,
            sequence,
            end_sample,
        ))
    }
}
