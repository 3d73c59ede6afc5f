//! Capture session
//!
//! Owns the whole pipeline and the control-surface API:
//!
//! ```text
//!  SampleSource ──read_frame──► capture thread ──write──► CaptureBuffer
//!                                                            │ try_read
//!                                                            ▼
//!  analyze() ◄──── latest result cell ◄──publish──── analysis thread
//!
//!  process(buffer) ──► current EffectChain snapshot ──► processed buffer
//! ```
//!
//! `start`, `stop` and `reset` are serialized on a control mutex. `analyze`,
//! `process` and `status` never touch it, so they can run from any thread
//! while capture is active.

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use basedrop::{Handle, Shared, SharedCell};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::analysis::{AnalysisConfig, AnalysisEngine, AnalysisError, AnalysisResult};
use crate::capture_buffer::{CaptureBuffer, CaptureConsumer, CaptureProducer};
use crate::chain::{ChainStore, EffectChain};
use crate::effects::{ConfigError, EffectSpec, ProcessingError};
use crate::reclaim::Reclaimer;
use crate::source::{CaptureError, SampleSource};

const IDLE: u8 = 0;
const CAPTURING: u8 = 1;
const ERROR: u8 = 2;

/// Errors returned by session control operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// `start` was called while the session was not idle.
    #[error("capture is already running")]
    AlreadyCapturing,

    /// The operation needs a running capture.
    #[error("capture is not running")]
    NotCapturing,

    /// The sample source failed to open or failed while running.
    #[error("capture device failed: {0}")]
    DeviceFailure(#[from] CaptureError),

    /// The analysis stage could not be set up for the opened stream.
    #[error("cannot analyze stream: {0}")]
    Analysis(#[from] AnalysisError),

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),
}

/// Lifecycle of a [`CaptureSession`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Not capturing; `start` is allowed.
    Idle,
    /// Worker threads are running.
    Capturing,
    /// The source failed; only `stop`/`reset` make progress.
    Error,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            CAPTURING => SessionState::Capturing,
            ERROR => SessionState::Error,
            _ => SessionState::Idle,
        }
    }
}

/// Point-in-time view of a session, for control surfaces that poll.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    /// Current state.
    pub state: SessionState,
    /// Cause of the last device failure, until `reset`.
    pub last_error: Option<CaptureError>,
    /// Frames read from the source since the last `start`.
    pub frames_captured: u64,
    /// Frames evicted unread because the capture buffer was full.
    pub frames_dropped: u64,
    /// Analysis results published since the last `start`.
    pub results_published: u64,
}

/// Settings for a [`CaptureSession`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    buffer_capacity: usize,
    idle_poll_ms: u64,
    analysis_poll_ms: u64,
    effect_sample_rate: u32,
    analysis: AnalysisConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            buffer_capacity: 16,
            idle_poll_ms: 1,
            analysis_poll_ms: 5,
            effect_sample_rate: 44_100,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Start customizing with a builder.
    pub fn builder() -> SessionConfigBuilder {
        SessionConfigBuilder::new()
    }

    /// Frames the capture buffer holds before evicting.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Capture thread back-off when the source has nothing ready.
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    /// Analysis thread back-off when the buffer is empty.
    pub fn analysis_poll(&self) -> Duration {
        Duration::from_millis(self.analysis_poll_ms)
    }

    /// Sample rate effect chains are built for.
    pub fn effect_sample_rate(&self) -> u32 {
        self.effect_sample_rate
    }

    /// Analysis settings; the sample rate is replaced by the stream's at `start`.
    pub fn analysis(&self) -> &AnalysisConfig {
        &self.analysis
    }

    /// Check every setting.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_capacity == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "buffer_capacity",
                reason: "must hold at least one frame".into(),
            });
        }
        if self.effect_sample_rate == 0 {
            return Err(ConfigError::InvalidSetting {
                setting: "effect_sample_rate",
                reason: "must be greater than zero".into(),
            });
        }
        self.analysis
            .validate()
            .map_err(|e| ConfigError::InvalidSetting {
                setting: "analysis",
                reason: e.to_string(),
            })
    }
}

/// Builder for [`SessionConfig`].
pub struct SessionConfigBuilder {
    config: SessionConfig,
}

impl SessionConfigBuilder {
    /// Start with default parameters:
    /// buffer_capacity = 16 frames, idle_poll = 1 ms, analysis_poll = 5 ms,
    /// effect_sample_rate = 44_100, default analysis settings.
    pub fn new() -> Self {
        SessionConfigBuilder {
            config: SessionConfig::default(),
        }
    }

    /// Set the capture buffer size in frames.
    pub fn buffer_capacity(mut self, frames: usize) -> Self {
        self.config.buffer_capacity = frames;
        self
    }

    /// Set the capture thread back-off.
    pub fn idle_poll(mut self, interval: Duration) -> Self {
        self.config.idle_poll_ms = interval.as_millis() as u64;
        self
    }

    /// Set the analysis thread back-off.
    pub fn analysis_poll(mut self, interval: Duration) -> Self {
        self.config.analysis_poll_ms = interval.as_millis() as u64;
        self
    }

    /// Set the sample rate effect chains are built for.
    pub fn effect_sample_rate(mut self, rate: u32) -> Self {
        self.config.effect_sample_rate = rate;
        self
    }

    /// Set the analysis settings.
    pub fn analysis(mut self, analysis: AnalysisConfig) -> Self {
        self.config.analysis = analysis;
        self
    }

    /// Validate and finish.
    pub fn build(self) -> Result<SessionConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for SessionConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared with the worker threads.
#[derive(Default)]
struct Status {
    state: AtomicU8,
    failure: Mutex<Option<CaptureError>>,
    frames_captured: AtomicU64,
    frames_dropped: AtomicU64,
    results_published: AtomicU64,
}

impl Status {
    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: u8) {
        self.state.store(state, Ordering::Release);
    }

    fn failure(&self) -> Option<CaptureError> {
        self.failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear_failure(&self) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Record `err` and move Capturing → Error.
    fn fail(&self, err: CaptureError) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(err);
        let _ = self
            .state
            .compare_exchange(CAPTURING, ERROR, Ordering::AcqRel, Ordering::Acquire);
    }

    fn failure_or_unknown(&self) -> CaptureError {
        self.failure()
            .unwrap_or_else(|| CaptureError::StreamFailure("unknown failure".into()))
    }

    fn reset_counters(&self) {
        self.frames_captured.store(0, Ordering::Relaxed);
        self.frames_dropped.store(0, Ordering::Relaxed);
        self.results_published.store(0, Ordering::Relaxed);
    }
}

struct Workers<S> {
    stop: Arc<AtomicBool>,
    capture: JoinHandle<Option<S>>,
    analysis: JoinHandle<()>,
}

struct Control<S> {
    source: Option<S>,
    workers: Option<Workers<S>>,
}

/// Live capture with pitch/chord analysis and an effect chain.
pub struct CaptureSession<S: SampleSource> {
    config: SessionConfig,
    control: Mutex<Control<S>>,
    status: Arc<Status>,
    latest: Arc<SharedCell<AnalysisResult>>,
    chain: ChainStore,
    // Dropped last: frees everything the fields above retired
    reclaimer: Reclaimer,
}

impl<S: SampleSource> CaptureSession<S> {
    /// Create an idle session with default settings.
    pub fn new(source: S) -> Result<Self, SessionError> {
        Self::with_config(source, SessionConfig::default())
    }

    /// Create an idle session.
    pub fn with_config(source: S, config: SessionConfig) -> Result<Self, SessionError> {
        let reclaimer = Reclaimer::spawn().map_err(SessionError::Spawn)?;
        let handle = reclaimer.handle();
        let chain = ChainStore::new(handle.clone(), config.effect_sample_rate);
        let latest = Arc::new(SharedCell::new(Shared::new(
            &handle,
            AnalysisResult::no_data(),
        )));

        Ok(CaptureSession {
            config,
            control: Mutex::new(Control {
                source: Some(source),
                workers: None,
            }),
            status: Arc::new(Status::default()),
            latest,
            chain,
            reclaimer,
        })
    }

    /// Settings the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.status.state()
    }

    /// Current state, last failure and counters.
    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.status.state(),
            last_error: self.status.failure(),
            frames_captured: self.status.frames_captured.load(Ordering::Relaxed),
            frames_dropped: self.status.frames_dropped.load(Ordering::Relaxed),
            results_published: self.status.results_published.load(Ordering::Relaxed),
        }
    }

    /// Same as [`start`](Self::start).
    pub fn start_capture(&self) -> Result<(), SessionError> {
        self.start()
    }

    /// Open the source and start the capture and analysis threads.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut control = self.lock_control();
        if self.state() != SessionState::Idle {
            return Err(SessionError::AlreadyCapturing);
        }

        let mut source = control.source.take().ok_or_else(|| {
            CaptureError::DeviceUnavailable(
                "sample source was lost with a crashed capture thread".into(),
            )
        })?;

        let format = match source.open() {
            Ok(format) => format,
            Err(err) => {
                log::warn!("failed to open sample source: {err}");
                control.source = Some(source);
                return Err(err.into());
            }
        };

        let analysis = self
            .config
            .analysis
            .clone()
            .with_sample_rate(format.sample_rate);
        let engine = match AnalysisEngine::new(analysis) {
            Ok(engine) => engine,
            Err(err) => {
                source.close();
                control.source = Some(source);
                return Err(err.into());
            }
        };

        let (producer, consumer) = CaptureBuffer::new(self.config.buffer_capacity).split();
        self.latest
            .set(Shared::new(&self.reclaimer.handle(), AnalysisResult::no_data()));
        self.status.clear_failure();
        self.status.reset_counters();
        self.status.set_state(CAPTURING);

        let stop = Arc::new(AtomicBool::new(false));
        let analysis = match self.spawn_analysis(consumer, engine, &stop) {
            Ok(thread) => thread,
            Err(err) => {
                self.status.set_state(IDLE);
                source.close();
                control.source = Some(source);
                return Err(SessionError::Spawn(err));
            }
        };
        let capture = match self.spawn_capture(source, producer, &stop) {
            Ok(thread) => thread,
            Err((err, mut source)) => {
                log::error!("capture thread failed to spawn: {err}");
                stop.store(true, Ordering::Release);
                if analysis.join().is_err() {
                    log::error!("analysis thread panicked");
                }
                source.close();
                control.source = Some(source);
                self.status.set_state(IDLE);
                return Err(SessionError::Spawn(err));
            }
        };

        control.workers = Some(Workers {
            stop,
            capture,
            analysis,
        });
        log::info!(
            "capture started: {} Hz, {} channel(s)",
            format.sample_rate,
            format.channels
        );
        Ok(())
    }

    /// Stop capture, join both threads and get the (closed) source back.
    ///
    /// After a device failure this still cleans up, then reports the failure
    /// and leaves the session in `Error` until [`reset`](Self::reset).
    pub fn stop(&self) -> Result<(), SessionError> {
        let mut control = self.lock_control();
        if self.state() == SessionState::Idle {
            return Err(SessionError::NotCapturing);
        }

        if let Some(workers) = control.workers.take() {
            if let Some(source) = shutdown(workers, &self.status) {
                control.source = Some(source);
            }
        }

        match self
            .status
            .state
            .compare_exchange(CAPTURING, IDLE, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                log::info!("capture stopped");
                Ok(())
            }
            Err(_) => Err(SessionError::DeviceFailure(self.status.failure_or_unknown())),
        }
    }

    /// Leave the `Error` state. A no-op when idle.
    pub fn reset(&self) -> Result<(), SessionError> {
        let mut control = self.lock_control();
        match self.state() {
            SessionState::Idle => Ok(()),
            SessionState::Capturing => Err(SessionError::AlreadyCapturing),
            SessionState::Error => {
                if let Some(workers) = control.workers.take() {
                    if let Some(source) = shutdown(workers, &self.status) {
                        control.source = Some(source);
                    }
                }
                self.status.clear_failure();
                self.status.set_state(IDLE);
                log::info!("session reset after device failure");
                Ok(())
            }
        }
    }

    /// Latest analysis result; never waits for a new one.
    pub fn analyze(&self) -> Result<AnalysisResult, SessionError> {
        match self.state() {
            SessionState::Capturing => Ok((*self.latest.get()).clone()),
            SessionState::Idle => Err(SessionError::NotCapturing),
            SessionState::Error => Err(SessionError::DeviceFailure(
                self.status.failure_or_unknown(),
            )),
        }
    }

    /// Run `buffer` through the current effect chain. Valid in any state.
    pub fn process(&self, mut buffer: Vec<f32>) -> Result<Vec<f32>, ProcessingError> {
        self.chain.process(&mut buffer)?;
        Ok(buffer)
    }

    /// Run `buffer` through a one-off chain built from `specs`, leaving the
    /// installed chain alone.
    pub fn process_with(
        &self,
        specs: &[EffectSpec],
        mut buffer: Vec<f32>,
    ) -> Result<Vec<f32>, ProcessingError> {
        let chain = EffectChain::from_specs(specs, self.chain.sample_rate())?;
        chain.process_in_place(&mut buffer)?;
        Ok(buffer)
    }

    /// Replace the effect chain. The old chain stays installed on error.
    pub fn configure_chain(&self, specs: &[EffectSpec]) -> Result<(), ConfigError> {
        self.chain.configure(specs)?;
        log::info!("effect chain configured with {} effect(s)", specs.len());
        Ok(())
    }

    /// Append an effect to the chain.
    pub fn add_effect(&self, spec: EffectSpec) -> Result<(), ConfigError> {
        self.chain.add_effect(spec)
    }

    /// Remove the effect at `index`.
    pub fn remove_effect(&self, index: usize) -> Result<(), ConfigError> {
        self.chain.remove_effect(index)
    }

    /// Move the effect at `from` to position `to`.
    pub fn move_effect(&self, from: usize, to: usize) -> Result<(), ConfigError> {
        self.chain.move_effect(from, to)
    }

    /// Rearrange the chain; `order[i]` is the current index of the effect
    /// that should end up at position `i`.
    pub fn reorder_effects(&self, order: &[usize]) -> Result<(), ConfigError> {
        self.chain.reorder(order)
    }

    /// Clear compressor envelopes and other carried effect state.
    pub fn reset_effects(&self) {
        self.chain.reset();
    }

    /// The installed chain snapshot.
    pub fn chain(&self) -> EffectChain {
        (*self.chain.load()).clone()
    }

    fn lock_control(&self) -> MutexGuard<'_, Control<S>> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// On failure the source comes back with the error.
    fn spawn_capture(
        &self,
        source: S,
        producer: CaptureProducer,
        stop: &Arc<AtomicBool>,
    ) -> Result<JoinHandle<Option<S>>, (io::Error, S)> {
        let stop = Arc::clone(stop);
        let status = Arc::clone(&self.status);
        let idle = self.config.idle_poll();

        let builder = thread::Builder::new().name("audiorig-capture".to_string());
        spawn_with(builder, (source, producer), move |(source, producer)| {
            capture_loop(source, producer, &stop, &status, idle)
        })
        .map_err(|(err, (source, _producer))| (err, source))
    }

    fn spawn_analysis(
        &self,
        consumer: CaptureConsumer,
        engine: AnalysisEngine,
        stop: &Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        let stop = Arc::clone(stop);
        let status = Arc::clone(&self.status);
        let latest = Arc::clone(&self.latest);
        let handle = self.reclaimer.handle();
        let poll = self.config.analysis_poll();

        thread::Builder::new()
            .name("audiorig-analysis".to_string())
            .spawn(move || {
                analysis_loop(consumer, engine, &stop, &status, &latest, &handle, poll)
            })
    }
}

impl<S: SampleSource> Drop for CaptureSession<S> {
    fn drop(&mut self) {
        let control = self
            .control
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(workers) = control.workers.take() {
            log::info!("capture session dropped while running; stopping");
            shutdown(workers, &self.status);
        }
    }
}

/// Start `body` on a new thread and hand it `payload` once the thread exists,
/// so the caller keeps `payload` if the thread cannot be spawned.
fn spawn_with<T, R, F>(
    builder: thread::Builder,
    payload: T,
    body: F,
) -> Result<JoinHandle<Option<R>>, (io::Error, T)>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(T) -> R + Send + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<T>(1);
    let thread = match builder.spawn(move || rx.recv().ok().map(body)) {
        Ok(thread) => thread,
        Err(err) => return Err((err, payload)),
    };

    match tx.send(payload) {
        Ok(()) => Ok(thread),
        Err(mpsc::SendError(payload)) => {
            let _ = thread.join();
            Err((io::Error::other("worker thread exited before start"), payload))
        }
    }
}

/// Signal both workers, join them, and return the source if the capture
/// thread handed it back.
fn shutdown<S>(workers: Workers<S>, status: &Status) -> Option<S> {
    workers.stop.store(true, Ordering::Release);

    let source = match workers.capture.join() {
        Ok(source) => source,
        Err(_) => {
            log::error!("capture thread panicked");
            status.fail(CaptureError::StreamFailure("capture thread panicked".into()));
            None
        }
    };
    if workers.analysis.join().is_err() {
        log::error!("analysis thread panicked");
    }
    source
}

/// Source → buffer until stopped or the source fails. Always closes the source.
fn capture_loop<S: SampleSource>(
    mut source: S,
    mut producer: CaptureProducer,
    stop: &AtomicBool,
    status: &Status,
    idle: Duration,
) -> S {
    while !stop.load(Ordering::Acquire) {
        let read = match panic::catch_unwind(AssertUnwindSafe(|| source.read_frame())) {
            Ok(read) => read,
            Err(_) => Err(CaptureError::StreamFailure(
                "sample source panicked while reading".into(),
            )),
        };

        match read {
            Ok(Some(frame)) => {
                status.frames_captured.fetch_add(1, Ordering::Relaxed);
                if producer.write(frame) {
                    status.frames_dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(None) => thread::sleep(idle),
            Err(err) => {
                log::error!("capture stopped by device failure: {err}");
                status.fail(err);
                break;
            }
        }
    }

    if panic::catch_unwind(AssertUnwindSafe(|| source.close())).is_err() {
        log::error!("sample source panicked while closing");
    }
    source
}

/// Buffer → engine → latest result, while the session is capturing.
fn analysis_loop(
    mut consumer: CaptureConsumer,
    mut engine: AnalysisEngine,
    stop: &AtomicBool,
    status: &Status,
    latest: &SharedCell<AnalysisResult>,
    handle: &Handle,
    poll: Duration,
) {
    while !stop.load(Ordering::Acquire) && status.state() == SessionState::Capturing {
        let Some(frame) = consumer.try_read() else {
            thread::sleep(poll);
            continue;
        };

        match engine.push_frame(&frame) {
            Ok(Some(result)) => {
                latest.set(Shared::new(handle, result));
                status.results_published.fetch_add(1, Ordering::Relaxed);
            }
            Ok(None) => {}
            Err(err) => log::warn!("dropping captured frame: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_with_runs_body_on_payload() {
        let thread = spawn_with(thread::Builder::new(), vec![1, 2, 3], |v| v.len()).unwrap();
        assert_eq!(thread.join().unwrap(), Some(3));
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn spawn_failure_returns_the_payload() {
        // No address space can back a 128 TiB stack
        let builder = thread::Builder::new().stack_size(1 << 47);
        match spawn_with(builder, vec![1, 2, 3], |v| v.len()) {
            Err((_, payload)) => assert_eq!(payload, vec![1, 2, 3]),
            Ok(_) => panic!("spawn with an impossible stack size succeeded"),
        }
    }
}
