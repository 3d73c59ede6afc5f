//! Sample sources
//!
//! The capture thread pulls frames from a [`SampleSource`]. Device backends live
//! outside this crate; [`BufferSource`] replays samples held in memory.

use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::frame::AudioFrame;

/// Device-level failures reported by a [`SampleSource`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The input device could not be opened.
    #[error("input device unavailable: {0}")]
    DeviceUnavailable(String),

    /// The stream failed while running.
    #[error("input stream failed: {0}")]
    StreamFailure(String),

    /// The source has no more frames to give.
    #[error("input stream ended")]
    EndOfStream,
}

/// Format negotiated when a source is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Interleaved channel count.
    pub channels: u16,
}

/// A live input stream.
///
/// `read_frame` is called in a tight loop on the capture thread. It returns
/// `Ok(None)` when no frame is ready yet and must come back within roughly one
/// frame period, otherwise stopping the session stalls until it does.
pub trait SampleSource: Send + 'static {
    /// Acquire the device and report its stream format.
    fn open(&mut self) -> Result<StreamFormat, CaptureError>;

    /// Fetch the next frame, if one is ready.
    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError>;

    /// Release the device. Called once per successful `open`.
    fn close(&mut self);
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn open(&mut self) -> Result<StreamFormat, CaptureError> {
        (**self).open()
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError> {
        (**self).read_frame()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Replays interleaved samples from memory in fixed-size frames.
pub struct BufferSource {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
    frame_len: usize,
    looping: bool,
    realtime: bool,
    position: usize,
    next_due: Option<Instant>,
    open: bool,
}

impl BufferSource {
    /// Replay `samples` (interleaved, `channels` wide) at `sample_rate`,
    /// in frames of 1024 samples per channel.
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16) -> Self {
        BufferSource {
            samples,
            sample_rate,
            channels: channels.max(1),
            frame_len: 1024,
            looping: false,
            realtime: false,
            position: 0,
            next_due: None,
            open: false,
        }
    }

    /// Samples per channel in each emitted frame.
    pub fn frame_len(mut self, frame_len: usize) -> Self {
        self.frame_len = frame_len.max(1);
        self
    }

    /// Start over from the beginning instead of ending the stream.
    pub fn looping(mut self, looping: bool) -> Self {
        self.looping = looping;
        self
    }

    /// Emit frames no faster than a device would.
    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    fn frame_period(&self) -> Duration {
        Duration::from_secs_f64(self.frame_len as f64 / self.sample_rate.max(1) as f64)
    }
}

impl SampleSource for BufferSource {
    fn open(&mut self) -> Result<StreamFormat, CaptureError> {
        if self.sample_rate == 0 {
            return Err(CaptureError::DeviceUnavailable(
                "sample rate must be greater than zero".into(),
            ));
        }
        self.position = 0;
        self.next_due = None;
        self.open = true;
        Ok(StreamFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError> {
        if !self.open {
            return Err(CaptureError::StreamFailure("source is not open".into()));
        }

        if self.realtime {
            let now = Instant::now();
            match self.next_due {
                Some(due) if due > now => {
                    // Never sleep longer than a frame so stop stays responsive.
                    thread::sleep((due - now).min(self.frame_period()));
                    return Ok(None);
                }
                Some(due) => self.next_due = Some(due + self.frame_period()),
                None => self.next_due = Some(now + self.frame_period()),
            }
        }

        let width = self.frame_len * self.channels as usize;
        if self.position + width > self.samples.len() {
            if !self.looping || self.samples.len() < width {
                return Err(CaptureError::EndOfStream);
            }
            self.position = 0;
        }

        let chunk = &self.samples[self.position..self.position + width];
        self.position += width;
        AudioFrame::new(chunk.to_vec(), self.sample_rate, self.channels)
            .map(Some)
            .map_err(|e| CaptureError::StreamFailure(e.to_string()))
    }

    fn close(&mut self) {
        self.open = false;
    }
}
