//! Sources and signal helpers shared by the integration tests.
#![allow(dead_code)]

use audiorig::{AudioFrame, CaptureError, SampleSource, StreamFormat};
use std::f32::consts::PI;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const SAMPLE_RATE: u32 = 44_100;

/// `len` samples of a unit sine at `freq` Hz.
pub fn sine(freq: f32, len: usize, sample_rate: u32) -> Vec<f32> {
    (0..len)
        .map(|i| (2.0 * PI * freq * i as f32 / sample_rate as f32).sin())
        .collect()
}

/// Equal-amplitude sum of sines, scaled to stay within `[-1, 1]`.
pub fn mix(freqs: &[f32], len: usize, sample_rate: u32) -> Vec<f32> {
    let scale = 1.0 / freqs.len() as f32;
    let mut out = vec![0.0; len];
    for &freq in freqs {
        for (dst, s) in out.iter_mut().zip(sine(freq, len, sample_rate)) {
            *dst += s * scale;
        }
    }
    out
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

/// Open/close bookkeeping visible from outside the session.
#[derive(Debug, Default)]
pub struct Calls {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
}

impl Calls {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Endless sine tone, paced roughly like a device.
pub struct ToneSource {
    freq: f32,
    sample_rate: u32,
    channels: u16,
    frame_len: usize,
    phase: f32,
    next_due: Option<Instant>,
    pub calls: Arc<Calls>,
}

impl ToneSource {
    pub fn new(freq: f32) -> Self {
        ToneSource {
            freq,
            sample_rate: SAMPLE_RATE,
            channels: 1,
            frame_len: 512,
            phase: 0.0,
            next_due: None,
            calls: Arc::new(Calls::default()),
        }
    }

    pub fn stereo(mut self) -> Self {
        self.channels = 2;
        self
    }

    fn period(&self) -> Duration {
        Duration::from_secs_f64(self.frame_len as f64 / self.sample_rate as f64)
    }
}

impl SampleSource for ToneSource {
    fn open(&mut self) -> Result<StreamFormat, CaptureError> {
        self.calls.opened.fetch_add(1, Ordering::SeqCst);
        self.next_due = None;
        Ok(StreamFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
        })
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError> {
        // Run at ~4x real time so tests stay quick
        let now = Instant::now();
        if let Some(due) = self.next_due {
            if due > now {
                thread::sleep((due - now).min(Duration::from_millis(1)));
                return Ok(None);
            }
        }
        self.next_due = Some(now + self.period() / 4);

        let step = 2.0 * PI * self.freq / self.sample_rate as f32;
        let mut samples = Vec::with_capacity(self.frame_len * self.channels as usize);
        for _ in 0..self.frame_len {
            let s = self.phase.sin() * 0.8;
            self.phase = (self.phase + step) % (2.0 * PI);
            for _ in 0..self.channels {
                samples.push(s);
            }
        }
        AudioFrame::new(samples, self.sample_rate, self.channels)
            .map(Some)
            .map_err(|e| CaptureError::StreamFailure(e.to_string()))
    }

    fn close(&mut self) {
        self.calls.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Source whose failures are scripted by the test.
pub struct FailingSource {
    pub open_error: Option<CaptureError>,
    /// Frames delivered before `read_frame` starts failing.
    pub frames_before_failure: usize,
    delivered: usize,
    pub calls: Arc<Calls>,
    pub armed: Arc<Mutex<bool>>,
}

impl FailingSource {
    /// Opens fine, fails on the first read.
    pub fn failing_reads() -> Self {
        FailingSource {
            open_error: None,
            frames_before_failure: 0,
            delivered: 0,
            calls: Arc::new(Calls::default()),
            armed: Arc::new(Mutex::new(true)),
        }
    }

    /// Refuses to open while armed, otherwise serves silence.
    pub fn failing_open() -> Self {
        FailingSource {
            open_error: Some(CaptureError::DeviceUnavailable("no input device".into())),
            ..Self::failing_reads()
        }
    }

    fn armed(&self) -> bool {
        *self.armed.lock().unwrap()
    }
}

impl SampleSource for FailingSource {
    fn open(&mut self) -> Result<StreamFormat, CaptureError> {
        if let (Some(err), true) = (&self.open_error, self.armed()) {
            return Err(err.clone());
        }
        self.calls.opened.fetch_add(1, Ordering::SeqCst);
        self.delivered = 0;
        Ok(StreamFormat {
            sample_rate: SAMPLE_RATE,
            channels: 1,
        })
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError> {
        if self.open_error.is_none() && self.armed() && self.delivered >= self.frames_before_failure
        {
            return Err(CaptureError::StreamFailure("device unplugged".into()));
        }
        self.delivered += 1;
        thread::sleep(Duration::from_millis(1));
        AudioFrame::mono(vec![0.0; 256], SAMPLE_RATE)
            .map(Some)
            .map_err(|e| CaptureError::StreamFailure(e.to_string()))
    }

    fn close(&mut self) {
        self.calls.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Source that never has a frame ready.
pub struct NullSource;

impl SampleSource for NullSource {
    fn open(&mut self) -> Result<StreamFormat, CaptureError> {
        Ok(StreamFormat {
            sample_rate: SAMPLE_RATE,
            channels: 1,
        })
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError> {
        thread::sleep(Duration::from_millis(1));
        Ok(None)
    }

    fn close(&mut self) {}
}

/// Source whose `read_frame` panics while armed, like a buggy driver binding.
pub struct PanickingSource {
    pub calls: Arc<Calls>,
    pub armed: Arc<Mutex<bool>>,
}

impl PanickingSource {
    pub fn new() -> Self {
        PanickingSource {
            calls: Arc::new(Calls::default()),
            armed: Arc::new(Mutex::new(true)),
        }
    }
}

impl SampleSource for PanickingSource {
    fn open(&mut self) -> Result<StreamFormat, CaptureError> {
        self.calls.opened.fetch_add(1, Ordering::SeqCst);
        Ok(StreamFormat {
            sample_rate: SAMPLE_RATE,
            channels: 1,
        })
    }

    fn read_frame(&mut self) -> Result<Option<AudioFrame>, CaptureError> {
        let armed = *self.armed.lock().unwrap();
        if armed {
            panic!("driver callback blew up");
        }
        thread::sleep(Duration::from_millis(1));
        AudioFrame::mono(vec![0.0; 256], SAMPLE_RATE)
            .map(Some)
            .map_err(|e| CaptureError::StreamFailure(e.to_string()))
    }

    fn close(&mut self) {
        self.calls.closed.fetch_add(1, Ordering::SeqCst);
    }
}
