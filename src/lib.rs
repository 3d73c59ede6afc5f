//! # audiorig
//!
//! Live audio capture with real-time pitch and chord analysis, plus an effect
//! chain that can be reconfigured while audio is flowing.
//!
//! A [`CaptureSession`] pulls frames from a [`SampleSource`] on a capture
//! thread, hands them to an analysis thread through a bounded
//! [`CaptureBuffer`], and publishes the newest [`AnalysisResult`] for
//! [`CaptureSession::analyze`] to pick up. Independently,
//! [`CaptureSession::process`] runs buffers through the installed
//! [`EffectChain`].
//!
//! ## Example
//! ```rust
//! use audiorig::{BufferSource, CaptureSession, EffectSpec};
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1) A source; device backends implement `SampleSource` the same way
//!     let tone: Vec<f32> = (0..44_100)
//!         .map(|i| (2.0 * std::f32::consts::PI * 440.0 * i as f32 / 44_100.0).sin())
//!         .collect();
//!     let source = BufferSource::new(tone, 44_100, 1).looping(true).realtime(true);
//!
//!     // 2) A session with an effect chain
//!     let session = CaptureSession::new(source)?;
//!     session.configure_chain(&[EffectSpec::booster(2.0), EffectSpec::distortion(0.3)])?;
//!
//!     // 3) Capture, then poll from your UI loop
//!     session.start()?;
//!     std::thread::sleep(std::time::Duration::from_millis(250));
//!     let result = session.analyze()?;
//!     println!("{:.1} Hz, chord {}", result.frequency_hz, result.chord_label);
//!
//!     let processed = session.process(vec![0.1; 256])?;
//!     assert_eq!(processed.len(), 256);
//!
//!     session.stop()?;
//!     Ok(())
//! }
//! # run().unwrap();
//! ```

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rust_2018_idioms)]
#![deny(clippy::all)]

/// Session lifecycle and control surface.
pub use session::{
    CaptureSession, SessionConfig, SessionConfigBuilder, SessionError, SessionState, SessionStatus,
};

/// Windowed pitch and chord analysis.
pub use analysis::{
    AnalysisConfig, AnalysisConfigBuilder, AnalysisEngine, AnalysisError, AnalysisResult,
    AnalysisStatus, UNKNOWN_CHORD,
};

/// Effects and chains.
pub use chain::{ChainStore, EffectChain};
pub use effects::{ConfigError, Effect, EffectKind, EffectSpec, ProcessingError};

/// Capture plumbing.
pub use capture_buffer::{CaptureBuffer, CaptureConsumer, CaptureProducer};
pub use frame::{AudioFrame, FrameError};
pub use source::{BufferSource, CaptureError, SampleSource, StreamFormat};

/// High‐level chord detector API.
pub use chord_detector::{
    Chord, ChordDetector, ChordDetectorBuilder, ChordError, ChordKind, NoteName,
};

/// Spectral chromagram extractor.
pub use chromagram::{Chromagram, ChromagramBuilder, ChromagramError};

/// Fundamental frequency estimation.
pub use pitch::{PitchDetector, PitchEstimate};

/// Windowed pitch and chord analysis module.
pub mod analysis;

/// Bounded frame queue between the capture and analysis threads.
pub mod capture_buffer;

/// Effect chain snapshots and their store.
pub mod chain;

/// Chord detection module.
pub mod chord_detector;

/// Chromagram computation module.
pub mod chromagram;

/// Effect definitions.
pub mod effects;

/// Captured audio frames.
pub mod frame;

/// Pitch detection module.
pub mod pitch;

/// Capture session.
pub mod session;

/// Sample sources.
pub mod source;

mod reclaim;
