//! Chord Detector
//!
//! Detection of musical chords from 12-bin chromagrams, anchored on a detected
//! fundamental.
//!
//! Derived from the C++ chord detector by Adam Stark, Queen Mary University of London.
//! https://github.com/adamstark/Chord-Detector-and-Chromagram

use std::fmt::Display;
use thiserror::Error;

const SEMITONES: usize = 12;

/// Number of chord qualities
const NUM_CHORD_KINDS: usize = 10;

/// Total number of chords (root × quality)
const NUM_CHORDS: usize = SEMITONES * NUM_CHORD_KINDS;

/// Scores this close to the best one are treated as ties.
const TIE_EPSILON: f32 = 1e-4;

/// Reference pitch for A4.
const A4_HZ: f32 = 440.0;

/// Pitch class of A.
const A_PITCH_CLASS: f32 = 9.0;

/// Supported chord qualities in canonical order, matching `CHORD_SPECS` and `CHORD_INTERVALS`
const CHORD_KINDS: [ChordKind; NUM_CHORD_KINDS] = [
    ChordKind::Major,
    ChordKind::Minor,
    ChordKind::PowerFifth,
    ChordKind::DominantSeventh,
    ChordKind::MajorSeventh,
    ChordKind::MinorSeventh,
    ChordKind::Diminished,
    ChordKind::Augmented,
    ChordKind::SuspendedSecond,
    ChordKind::SuspendedFourth,
];

/// (quality, bias, number_of_intervals)
const CHORD_SPECS: &[(ChordKind, f32, f32)] = &[
    (ChordKind::Major,           1.06, 3.0),
    (ChordKind::Minor,           1.06, 3.0),
    (ChordKind::PowerFifth,      1.005, 2.0),
    (ChordKind::DominantSeventh, 1.06, 4.0),
    (ChordKind::MajorSeventh,    1.00, 4.0),
    (ChordKind::MinorSeventh,    1.06, 4.0),
    (ChordKind::Diminished,      1.05, 3.0),
    (ChordKind::Augmented,       1.055, 3.0),
    (ChordKind::SuspendedSecond, 1.0, 3.0),
    (ChordKind::SuspendedFourth, 1.0, 3.0),
];

/// Intervals (in semitones) matching `CHORD_SPECS` order
const CHORD_INTERVALS: [&[usize]; NUM_CHORD_KINDS] = [
    &[0, 4, 7],
    &[0, 3, 7],
    &[0, 7],
    &[0, 4, 7, 10],
    &[0, 4, 7, 11],
    &[0, 3, 7, 10],
    &[0, 3, 6],
    &[0, 4, 8],
    &[0, 2, 7],
    &[0, 5, 7],
];

/// A single chromagram: energy for each of the 12 semitones
type Chromagram = [f32; SEMITONES];

/// Precomputed chord profile + inverse normalizer
#[derive(Copy, Clone)]
struct PrecalcProfile {
    weights: Chromagram,
    inv_norm: f32,
}

/// Represents a musical chord detected from an audio signal.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Chord {
    /// The root note of the detected chord.
    pub root: NoteName,
    /// The quality (e.g., Major, Minor) of the detected chord.
    pub quality: ChordKind,
    /// A confidence score for the detection, where lower values indicate a better match.
    pub confidence: f32,
}

impl Chord {
    /// Short chord symbol, e.g. `"A"`, `"F#m"`, `"Cmaj7"`.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl Display for Chord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.root, self.quality.suffix())
    }
}

/// Supported chord qualities
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ChordKind {
    /// Major chord (e.g., C-E-G)
    Major,
    /// Minor chord (e.g., C-Eb-G)
    Minor,
    /// Power chord (e.g., C-G)
    PowerFifth,
    /// Dominant seventh chord (e.g., C-E-G-Bb)
    DominantSeventh,
    /// Major seventh chord (e.g., C-E-G-B)
    MajorSeventh,
    /// Minor seventh chord (e.g., C-Eb-G-Bb)
    MinorSeventh,
    /// Diminished chord (e.g., C-Eb-Gb)
    Diminished,
    /// Augmented chord (e.g., C-E-G#)
    Augmented,
    /// Suspended second chord (e.g., C-D-G)
    SuspendedSecond,
    /// Suspended fourth chord (e.g., C-F-G)
    SuspendedFourth,
}

impl ChordKind {
    /// Symbol appended to the root name in a chord label.
    pub const fn suffix(self) -> &'static str {
        match self {
            ChordKind::Major => "",
            ChordKind::Minor => "m",
            ChordKind::PowerFifth => "5",
            ChordKind::DominantSeventh => "7",
            ChordKind::MajorSeventh => "maj7",
            ChordKind::MinorSeventh => "m7",
            ChordKind::Diminished => "dim",
            ChordKind::Augmented => "aug",
            ChordKind::SuspendedSecond => "sus2",
            ChordKind::SuspendedFourth => "sus4",
        }
    }

    /// Semitone offsets from the root.
    pub fn intervals(self) -> &'static [usize] {
        CHORD_INTERVALS[self as usize]
    }
}

impl Display for ChordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Twelve chromatic pitch classes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NoteName {
    /// C
    C,
    /// C sharp / D flat
    Cs,
    /// D
    D,
    /// D sharp / E flat
    Ds,
    /// E
    E,
    /// F
    F,
    /// F sharp / G flat
    Fs,
    /// G
    G,
    /// G sharp / A flat
    Gs,
    /// A
    A,
    /// A sharp / B flat
    As,
    /// B
    B,
    /// Unknown note name
    Unknown,
}

impl NoteName {
    /// Pitch class for an index in `0..12` (C = 0).
    pub const fn from_idx(idx: usize) -> NoteName {
        match idx {
            0 => NoteName::C,
            1 => NoteName::Cs,
            2 => NoteName::D,
            3 => NoteName::Ds,
            4 => NoteName::E,
            5 => NoteName::F,
            6 => NoteName::Fs,
            7 => NoteName::G,
            8 => NoteName::Gs,
            9 => NoteName::A,
            10 => NoteName::As,
            11 => NoteName::B,
            _ => NoteName::Unknown,
        }
    }

    /// Nearest equal-tempered pitch class of `freq_hz` (A4 = 440 Hz).
    pub fn from_frequency(freq_hz: f32) -> NoteName {
        Self::pitch_class(freq_hz).map_or(NoteName::Unknown, NoteName::from_idx)
    }

    /// Index (C = 0) of the nearest pitch class, `None` for non-positive input.
    pub fn pitch_class(freq_hz: f32) -> Option<usize> {
        let position = chroma_position(freq_hz)?;
        Some((position.round() as usize) % SEMITONES)
    }
}

impl Display for NoteName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NoteName::C => "C",
            NoteName::Cs => "C#",
            NoteName::D => "D",
            NoteName::Ds => "D#",
            NoteName::E => "E",
            NoteName::F => "F",
            NoteName::Fs => "F#",
            NoteName::G => "G",
            NoteName::Gs => "G#",
            NoteName::A => "A",
            NoteName::As => "A#",
            NoteName::B => "B",
            NoteName::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Unquantized position of `freq_hz` on the pitch-class circle, in `0.0..12.0`.
fn chroma_position(freq_hz: f32) -> Option<f32> {
    if !freq_hz.is_finite() || freq_hz <= 0.0 {
        return None;
    }
    let semitones = SEMITONES as f32 * (freq_hz / A4_HZ).log2() + A_PITCH_CLASS;
    Some(semitones.rem_euclid(SEMITONES as f32))
}

/// Semitone steps between a root and a raw position, going the short way round.
fn circular_distance(root: usize, position: f32) -> f32 {
    let d = (root as f32 - position).abs() % SEMITONES as f32;
    d.min(SEMITONES as f32 - d)
}

/// Errors when detecting chords
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ChordError {
    /// The chromagram provided did not have the expected number of semitones.
    #[error("expected a {expected}-bin chromagram, got {got}")]
    InvalidLength {
        /// The expected number of semitones (12).
        expected: usize,
        /// The actual number of semitones provided.
        got: usize,
    },

    /// An invalid argument was provided to a detection function.
    #[error("invalid argument `{arg}`: {msg}")]
    InvalidArgument {
        /// The name of the invalid argument.
        arg: &'static str,
        /// A description of the invalid argument.
        msg: String,
    },
}

/// Builder for `ChordDetector` to customize bleed factor
pub struct ChordDetectorBuilder {
    bleed: f32,
}

impl ChordDetectorBuilder {
    /// Create a new builder with default bleed = 0.157
    pub fn new() -> Self {
        ChordDetectorBuilder { bleed: 0.157 }
    }

    /// Set the bleed suppression factor (0.0..1.0)
    pub fn bleed(mut self, value: f32) -> Self {
        self.bleed = value;
        self
    }

    /// Build the `ChordDetector`
    pub fn build(self) -> ChordDetector {
        ChordDetector::with_bleed(self.bleed)
    }
}

impl Default for ChordDetectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Main chord detector
pub struct ChordDetector {
    bleed: f32,
    chroma_work: Chromagram,
    profiles: [PrecalcProfile; NUM_CHORDS],
    scores: [f32; NUM_CHORDS],
    idx_scores: Vec<(usize, f32)>,
}

impl ChordDetector {
    /// Return a builder to customize bleed suppression factor
    pub fn builder() -> ChordDetectorBuilder {
        ChordDetectorBuilder::new()
    }

    /// Create a detector with default bleed = 0.157
    pub fn new() -> Self {
        Self::with_bleed(0.157)
    }

    /// Create a detector with a custom bleed suppression factor
    fn with_bleed(bleed: f32) -> Self {
        // Precompute profiles
        let mut profiles = [PrecalcProfile {
            weights: [0.0; SEMITONES],
            inv_norm: 0.0,
        }; NUM_CHORDS];

        for (kind_idx, &(_kind, bias, interval_count)) in CHORD_SPECS.iter().enumerate() {
            let inv = 1.0 / (((SEMITONES as f32) - interval_count) * bias);
            let intervals = CHORD_INTERVALS[kind_idx];
            for root in 0..SEMITONES {
                let base = kind_idx * SEMITONES + root;
                profiles[base].inv_norm = inv;
                for &off in intervals {
                    let note = (root + off) % SEMITONES;
                    profiles[base].weights[note] = 1.0;
                }
            }
        }

        ChordDetector {
            bleed,
            chroma_work: [0.0; SEMITONES],
            profiles,
            scores: [0.0; NUM_CHORDS],
            idx_scores: Vec::with_capacity(NUM_CHORDS),
        }
    }

    /// Detect the single best chord from a chromagram slice.
    ///
    /// Templates scoring within a small tolerance of the best are resolved by
    /// (1) fewest semitone steps between the chord root and `fundamental_hz`,
    /// (2) canonical quality order (major before minor, ...), (3) lower root index.
    ///
    /// Returns `Err(ChordError::InvalidLength)` if `chroma.len() != SEMITONES`.
    pub fn detect_chord(
        &mut self,
        chroma: &[f32],
        fundamental_hz: Option<f32>,
    ) -> Result<Chord, ChordError> {
        check_length(chroma)?;
        self.score_all(chroma);

        let best = self.scores.iter().cloned().fold(f32::INFINITY, f32::min);
        let anchor = fundamental_hz.and_then(chroma_position);

        let mut winner: Option<(usize, f32)> = None;
        for (idx, &score) in self.scores.iter().enumerate() {
            if score > best + TIE_EPSILON {
                continue;
            }
            let distance = anchor.map_or(0.0, |pos| circular_distance(idx % SEMITONES, pos));
            winner = match winner {
                Some((prev, prev_distance)) if !prefer(idx, distance, prev, prev_distance) => {
                    Some((prev, prev_distance))
                }
                _ => Some((idx, distance)),
            };
        }

        // NaN scores only; fall back to the first template
        let idx = winner.map_or(0, |(idx, _)| idx);
        Ok(self.chord_at(idx))
    }

    /// Detect the top `k` chords from a chromagram slice, best first.
    ///
    /// Returns:
    /// - `Err(InvalidLength)` if `chroma.len() != SEMITONES`.
    /// - `Err(InvalidArgument)` if `k == 0`.
    pub fn top_k(&mut self, chroma: &[f32], k: usize) -> Result<Vec<Chord>, ChordError> {
        check_length(chroma)?;
        if k == 0 {
            return Err(ChordError::InvalidArgument {
                arg: "k",
                msg: "must be >= 1".to_string(),
            });
        }
        let choices = k.min(NUM_CHORDS);
        self.score_all(chroma);

        self.idx_scores.clear();
        for (i, &s) in self.scores.iter().enumerate() {
            self.idx_scores.push((i, s));
        }

        // Canonical index breaks equal scores so the ranking is stable
        let order = |a: &(usize, f32), b: &(usize, f32)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
        self.idx_scores.select_nth_unstable_by(choices - 1, order);
        self.idx_scores[..choices].sort_unstable_by(order);

        let result = self.idx_scores[..choices]
            .iter()
            .map(|&(idx, _)| self.chord_at(idx))
            .collect();
        Ok(result)
    }

    /// Bleed suppression followed by scoring every profile.
    fn score_all(&mut self, chroma: &[f32]) {
        self.chroma_work.copy_from_slice(chroma);
        for i in 0..SEMITONES {
            let bleed_amt = self.bleed * self.chroma_work[i];
            let target = (i + SEMITONES - 5) % SEMITONES; // shift down a perfect fourth
            let reduced = (self.chroma_work[target] - bleed_amt).max(0.0);
            self.chroma_work[target] = reduced;
        }

        for (i, p) in self.profiles.iter().enumerate() {
            self.scores[i] = score_chord(&self.chroma_work, p);
        }
    }

    fn chord_at(&self, idx: usize) -> Chord {
        Chord {
            root: NoteName::from_idx(idx % SEMITONES),
            quality: CHORD_KINDS[idx / SEMITONES],
            confidence: self.scores[idx],
        }
    }
}

fn check_length(chroma: &[f32]) -> Result<(), ChordError> {
    if chroma.len() != SEMITONES {
        return Err(ChordError::InvalidLength {
            expected: SEMITONES,
            got: chroma.len(),
        });
    }
    Ok(())
}

/// Whether candidate `a` beats `b` among equally scored templates.
/// Profile indices are laid out quality-major, so a lower index means an
/// earlier quality, then a lower root.
fn prefer(a: usize, a_distance: f32, b: usize, b_distance: f32) -> bool {
    if (a_distance - b_distance).abs() > 1e-3 {
        return a_distance < b_distance;
    }
    a < b
}

/// Score a single chord profile against the chromagram
#[inline(always)]
fn score_chord(chroma: &Chromagram, p: &PrecalcProfile) -> f32 {
    let mut acc = 0.0;
    (0..SEMITONES).for_each(|i| {
        let miss = 1.0 - p.weights[i];
        let c = chroma[i];
        acc += miss * (c * c);
    });
    acc.sqrt() * p.inv_norm
}

impl Default for ChordDetector {
    fn default() -> Self {
        ChordDetector::new()
    }
}
