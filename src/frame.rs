//! Audio frames
//!
//! Immutable, channel-interleaved chunks of `f32` samples as produced by a
//! [`SampleSource`](crate::SampleSource).

use thiserror::Error;

/// Errors when constructing an [`AudioFrame`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// A frame must carry at least one channel.
    #[error("channel count must be at least 1")]
    NoChannels,

    /// A frame must have a non-zero sample rate.
    #[error("sample rate must be greater than zero")]
    ZeroSampleRate,

    /// The interleaved sample count is not a multiple of the channel count.
    #[error("{len} samples cannot be split evenly into {channels} channels")]
    Misaligned {
        /// Number of interleaved samples supplied.
        len: usize,
        /// Channel count of the frame.
        channels: u16,
    },
}

/// One chunk of interleaved audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Box<[f32]>,
    sample_rate: u32,
    channels: u16,
}

impl AudioFrame {
    /// Build a frame from interleaved samples.
    pub fn new(
        samples: impl Into<Box<[f32]>>,
        sample_rate: u32,
        channels: u16,
    ) -> Result<Self, FrameError> {
        let samples = samples.into();
        if channels == 0 {
            return Err(FrameError::NoChannels);
        }
        if sample_rate == 0 {
            return Err(FrameError::ZeroSampleRate);
        }
        if samples.len() % channels as usize != 0 {
            return Err(FrameError::Misaligned {
                len: samples.len(),
                channels,
            });
        }
        Ok(AudioFrame {
            samples,
            sample_rate,
            channels,
        })
    }

    /// Build a single-channel frame.
    pub fn mono(samples: impl Into<Box<[f32]>>, sample_rate: u32) -> Result<Self, FrameError> {
        Self::new(samples, sample_rate, 1)
    }

    /// Interleaved samples.
    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    /// Sample rate in Hz.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Number of interleaved channels.
    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Samples per channel.
    pub fn frame_len(&self) -> usize {
        self.samples.len() / self.channels as usize
    }

    /// Channel average of every sample position.
    pub fn mono_samples(&self) -> impl Iterator<Item = f32> + '_ {
        let channels = self.channels as usize;
        let scale = 1.0 / channels as f32;
        self.samples
            .chunks_exact(channels)
            .map(move |chunk| chunk.iter().sum::<f32>() * scale)
    }
}
