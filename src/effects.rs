//! Effects
//!
//! The closed set of effects a chain can hold. An [`EffectSpec`] is the plain
//! description a control surface sends; building it validates the parameters
//! and yields a live [`Effect`] that owns any per-instance state.

use std::fmt::Display;
use std::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Drive at `amount = 1.0` for the distortion curve.
const MAX_DRIVE: f32 = 29.0;

const DEFAULT_ATTACK_MS: f32 = 5.0;
const DEFAULT_RELEASE_MS: f32 = 50.0;

/// Effect variants, for error reporting and inspection.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectKind {
    /// Soft-clipping distortion.
    Distortion,
    /// Dynamic range compressor.
    Compressor,
    /// Linear gain.
    Booster,
}

impl Display for EffectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Errors when configuring effects or chains.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// A parameter is outside the range its effect accepts.
    #[error("invalid {effect} parameter `{parameter}`: {reason}")]
    InvalidEffectParameter {
        /// Effect the parameter belongs to.
        effect: EffectKind,
        /// Parameter name.
        parameter: &'static str,
        /// What is wrong with the value.
        reason: String,
    },

    /// An index does not address an effect in the chain.
    #[error("effect index {index} out of range for chain of {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: usize,
        /// Chain length.
        len: usize,
    },

    /// A reorder request is not a permutation of the chain.
    #[error("invalid effect order: {0}")]
    InvalidOrder(String),

    /// A session setting is out of range.
    #[error("invalid setting `{setting}`: {reason}")]
    InvalidSetting {
        /// Setting name.
        setting: &'static str,
        /// What is wrong with the value.
        reason: String,
    },
}

/// Errors raised while processing a buffer.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProcessingError {
    /// An ad-hoc chain could not be built.
    #[error(transparent)]
    InvalidEffectParameter(#[from] ConfigError),

    /// An effect could not produce valid output.
    #[error("{effect} failed: {reason}")]
    EffectRuntimeFailure {
        /// Effect that failed.
        effect: EffectKind,
        /// What went wrong.
        reason: String,
    },
}

fn default_attack_ms() -> f32 {
    DEFAULT_ATTACK_MS
}

fn default_release_ms() -> f32 {
    DEFAULT_RELEASE_MS
}

/// Parameters for one effect, as supplied by a control surface.
#[derive(Debug, Copy, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectSpec {
    /// Soft clipping.
    Distortion {
        /// `0.0` leaves the signal untouched, `1.0` clips hardest.
        amount: f32,
    },
    /// Downward compression above a threshold.
    Compressor {
        /// Linear level (`0.0..=1.0`) above which gain is reduced.
        threshold: f32,
        /// Input-to-output ratio above the threshold, at least `1.0`.
        ratio: f32,
        /// Envelope rise time in milliseconds.
        #[serde(default = "default_attack_ms")]
        attack_ms: f32,
        /// Envelope fall time in milliseconds.
        #[serde(default = "default_release_ms")]
        release_ms: f32,
    },
    /// Linear amplification.
    Booster {
        /// Multiplier, greater than zero.
        gain: f32,
    },
}

impl EffectSpec {
    /// Distortion with the given amount.
    pub fn distortion(amount: f32) -> Self {
        EffectSpec::Distortion { amount }
    }

    /// Compressor with default attack and release times.
    pub fn compressor(threshold: f32, ratio: f32) -> Self {
        EffectSpec::Compressor {
            threshold,
            ratio,
            attack_ms: DEFAULT_ATTACK_MS,
            release_ms: DEFAULT_RELEASE_MS,
        }
    }

    /// Booster with the given gain.
    pub fn booster(gain: f32) -> Self {
        EffectSpec::Booster { gain }
    }

    /// Variant of this spec.
    pub fn kind(&self) -> EffectKind {
        match self {
            EffectSpec::Distortion { .. } => EffectKind::Distortion,
            EffectSpec::Compressor { .. } => EffectKind::Compressor,
            EffectSpec::Booster { .. } => EffectKind::Booster,
        }
    }

    /// Check every parameter against its allowed range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let effect = self.kind();
        match *self {
            EffectSpec::Distortion { amount } => {
                let in_range = (0.0..=1.0).contains(&amount);
                check(effect, "amount", amount, in_range, "must be within 0.0..=1.0")
            }
            EffectSpec::Compressor {
                threshold,
                ratio,
                attack_ms,
                release_ms,
            } => {
                let in_range = (0.0..=1.0).contains(&threshold);
                check(effect, "threshold", threshold, in_range, "must be within 0.0..=1.0")?;
                check(effect, "ratio", ratio, ratio >= 1.0, "must be at least 1.0")?;
                check(effect, "attack_ms", attack_ms, attack_ms > 0.0, "must be greater than 0")?;
                check(effect, "release_ms", release_ms, release_ms > 0.0, "must be greater than 0")
            }
            EffectSpec::Booster { gain } => {
                check(effect, "gain", gain, gain > 0.0, "must be greater than 0")
            }
        }
    }

    /// Validate and create a live effect for audio at `sample_rate`.
    pub fn build(&self, sample_rate: u32) -> Result<Effect, ConfigError> {
        self.validate()?;
        let effect = match *self {
            EffectSpec::Distortion { amount } => Effect::Distortion(Distortion::new(amount)),
            EffectSpec::Compressor {
                threshold,
                ratio,
                attack_ms,
                release_ms,
            } => Effect::Compressor(Compressor::new(
                threshold,
                ratio,
                attack_ms,
                release_ms,
                sample_rate,
            )),
            EffectSpec::Booster { gain } => Effect::Booster(Booster { gain }),
        };
        Ok(effect)
    }
}

fn check(
    effect: EffectKind,
    parameter: &'static str,
    value: f32,
    in_range: bool,
    requirement: &str,
) -> Result<(), ConfigError> {
    if value.is_finite() && in_range {
        return Ok(());
    }
    Err(ConfigError::InvalidEffectParameter {
        effect,
        parameter,
        reason: format!("{requirement}, got {value}"),
    })
}

/// A live effect instance.
#[derive(Debug)]
pub enum Effect {
    /// Soft-clipping distortion.
    Distortion(Distortion),
    /// Envelope-following compressor.
    Compressor(Compressor),
    /// Linear gain.
    Booster(Booster),
}

impl Effect {
    /// Variant of this effect.
    pub fn kind(&self) -> EffectKind {
        match self {
            Effect::Distortion(_) => EffectKind::Distortion,
            Effect::Compressor(_) => EffectKind::Compressor,
            Effect::Booster(_) => EffectKind::Booster,
        }
    }

    /// Parameters this effect was built from.
    pub fn spec(&self) -> EffectSpec {
        match self {
            Effect::Distortion(d) => EffectSpec::Distortion { amount: d.amount },
            Effect::Compressor(c) => EffectSpec::Compressor {
                threshold: c.threshold,
                ratio: c.ratio,
                attack_ms: c.attack_ms,
                release_ms: c.release_ms,
            },
            Effect::Booster(b) => EffectSpec::Booster { gain: b.gain },
        }
    }

    /// Transform `buffer` in place.
    ///
    /// Fails without touching effect state if the input holds a non-finite
    /// sample or the output would.
    pub fn process(&self, buffer: &mut [f32]) -> Result<(), ProcessingError> {
        let pending = self.render(buffer)?;
        self.commit(pending);
        Ok(())
    }

    /// Transform `buffer` without storing carried state. Returns the state to
    /// hand to [`commit`](Self::commit) once the whole pass has succeeded.
    pub(crate) fn render(&self, buffer: &mut [f32]) -> Result<Option<f32>, ProcessingError> {
        if let Some(index) = buffer.iter().position(|s| !s.is_finite()) {
            return Err(self.failure(format!("non-finite input sample at index {index}")));
        }

        let envelope = match self {
            Effect::Distortion(d) => {
                d.process(buffer);
                None
            }
            Effect::Compressor(c) => Some(c.process(buffer)),
            Effect::Booster(b) => {
                b.process(buffer);
                None
            }
        };

        if let Some(index) = buffer.iter().position(|s| !s.is_finite()) {
            return Err(self.failure(format!("non-finite output sample at index {index}")));
        }
        Ok(envelope)
    }

    /// Store state produced by [`render`](Self::render).
    pub(crate) fn commit(&self, pending: Option<f32>) {
        if let (Effect::Compressor(c), Some(envelope)) = (self, pending) {
            c.store_envelope(envelope);
        }
    }

    /// Clear any state carried between calls.
    pub fn reset(&self) {
        if let Effect::Compressor(c) = self {
            c.reset();
        }
    }

    fn failure(&self, reason: String) -> ProcessingError {
        ProcessingError::EffectRuntimeFailure {
            effect: self.kind(),
            reason,
        }
    }
}

/// Soft clipping `tanh(d·x) / tanh(d)` with drive `d = 1 + 29·amount`.
///
/// Full-scale input stays at full scale while everything below is pushed
/// towards it. Stateless.
#[derive(Debug)]
pub struct Distortion {
    amount: f32,
    drive: f32,
    norm: f32,
}

impl Distortion {
    fn new(amount: f32) -> Self {
        let drive = 1.0 + MAX_DRIVE * amount;
        Distortion {
            amount,
            drive,
            norm: 1.0 / drive.tanh(),
        }
    }

    /// Distortion amount, `0.0..=1.0`.
    pub fn amount(&self) -> f32 {
        self.amount
    }

    fn process(&self, buffer: &mut [f32]) {
        if self.amount == 0.0 {
            return;
        }
        for sample in buffer.iter_mut() {
            *sample = (self.drive * *sample).tanh() * self.norm;
        }
    }
}

/// Feed-forward peak compressor.
///
/// A one-pole envelope follower (attack coefficient while the level rises,
/// release while it falls) drives the gain:
/// above `threshold`, the envelope is mapped to `threshold + (env - threshold) / ratio`.
/// The envelope is carried from one call to the next.
#[derive(Debug)]
pub struct Compressor {
    threshold: f32,
    ratio: f32,
    attack_ms: f32,
    release_ms: f32,
    attack_coeff: f32,
    release_coeff: f32,
    /// `f32` bits of the envelope left by the last successful call.
    envelope: AtomicU32,
}

impl Compressor {
    fn new(threshold: f32, ratio: f32, attack_ms: f32, release_ms: f32, sample_rate: u32) -> Self {
        Compressor {
            threshold,
            ratio,
            attack_ms,
            release_ms,
            attack_coeff: ms_to_coeff(attack_ms, sample_rate),
            release_coeff: ms_to_coeff(release_ms, sample_rate),
            envelope: AtomicU32::new(0.0_f32.to_bits()),
        }
    }

    /// Threshold level, `0.0..=1.0`.
    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    /// Compression ratio.
    pub fn ratio(&self) -> f32 {
        self.ratio
    }

    /// Current envelope level.
    pub fn envelope(&self) -> f32 {
        f32::from_bits(self.envelope.load(Ordering::Acquire))
    }

    fn reset(&self) {
        self.envelope.store(0.0_f32.to_bits(), Ordering::Release);
    }

    fn store_envelope(&self, envelope: f32) {
        self.envelope.store(envelope.to_bits(), Ordering::Release);
    }

    /// Returns the envelope reached at the end of `buffer`.
    fn process(&self, buffer: &mut [f32]) -> f32 {
        let mut env = self.envelope();
        for sample in buffer.iter_mut() {
            let level = sample.abs();
            let coeff = if level > env {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            env = coeff * env + (1.0 - coeff) * level;

            if env > self.threshold {
                let target = self.threshold + (env - self.threshold) / self.ratio;
                *sample *= target / env;
            }
        }
        env
    }
}

/// Convert milliseconds to an exponential smoothing coefficient
fn ms_to_coeff(time_ms: f32, sample_rate: u32) -> f32 {
    let samples = time_ms / 1000.0 * sample_rate as f32;
    (-1.0 / samples.max(1.0)).exp()
}

/// Linear gain. Stateless.
#[derive(Debug)]
pub struct Booster {
    gain: f32,
}

impl Booster {
    /// Gain multiplier.
    pub fn gain(&self) -> f32 {
        self.gain
    }

    fn process(&self, buffer: &mut [f32]) {
        for sample in buffer.iter_mut() {
            *sample *= self.gain;
        }
    }
}
