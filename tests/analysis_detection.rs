//! Pitch, chromagram and chord detection on synthesized signals.

mod common;

use audiorig::{
    AnalysisConfig, AnalysisEngine, AnalysisError, AnalysisStatus, AudioFrame, ChordDetector,
    ChordKind, Chromagram, NoteName, PitchDetector, UNKNOWN_CHORD,
};
use common::{mix, sine, SAMPLE_RATE};
use lazy_static::lazy_static;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};

const WINDOW: usize = 4096;
const HOP: usize = 2048;

lazy_static! {
    /// One second of A4.
    static ref A4_TONE: Vec<f32> = sine(440.0, SAMPLE_RATE as usize, SAMPLE_RATE);
    /// One second of middle C.
    static ref C4_TONE: Vec<f32> = sine(261.63, SAMPLE_RATE as usize, SAMPLE_RATE);
}

fn engine() -> AnalysisEngine {
    AnalysisEngine::new(AnalysisConfig::default()).unwrap()
}

fn within(actual: f32, expected: f32, tolerance: f32) -> bool {
    (actual - expected).abs() <= expected * tolerance
}

#[test]
fn a4_sine_reports_440_hz_and_a() {
    let mut engine = engine();
    let result = engine
        .push_samples(&A4_TONE)
        .unwrap()
        .expect("a full second must close several windows");

    assert_eq!(result.status, AnalysisStatus::Detected);
    assert!(
        within(result.frequency_hz, 440.0, 0.01),
        "expected ~440 Hz, got {}",
        result.frequency_hz
    );
    assert_eq!(result.chord_label, "A");
    let chord = result.chord.unwrap();
    assert_eq!(chord.root, NoteName::A);
    assert_eq!(chord.quality, ChordKind::Major);
    assert!(result.clarity >= AnalysisConfig::default().confidence_threshold());
}

#[test]
fn middle_c_reports_c() {
    let mut engine = engine();
    let result = engine.push_samples(&C4_TONE).unwrap().unwrap();

    assert!(
        within(result.frequency_hz, 261.63, 0.01),
        "expected ~261.63 Hz, got {}",
        result.frequency_hz
    );
    assert_eq!(result.chord_label, "C");
}

#[test]
fn pitch_tracks_a_range_of_notes() {
    let notes = [82.41_f32, 110.0, 196.0, 329.63, 523.25, 987.77];

    notes.par_iter().for_each(|&freq| {
        let mut detector = PitchDetector::new(&AnalysisConfig::default());
        let window = sine(freq, WINDOW, SAMPLE_RATE);
        let estimate = detector.detect(&window).expect("tone must have a pitch");
        assert!(
            within(estimate.frequency_hz, freq, 0.01),
            "{freq} Hz detected as {}",
            estimate.frequency_hz
        );
        assert!(estimate.clarity > 0.9, "{freq} Hz clarity {}", estimate.clarity);
    });
}

#[test]
fn silence_is_unknown_with_zero_frequency() {
    let mut engine = engine();
    let result = engine.push_samples(&vec![0.0; WINDOW]).unwrap().unwrap();

    assert_eq!(result.status, AnalysisStatus::Unknown);
    assert_eq!(result.frequency_hz, 0.0);
    assert_eq!(result.chord_label, UNKNOWN_CHORD);
    assert!(result.chord.is_none());
}

#[test]
fn no_result_before_first_full_window() {
    let mut engine = engine();
    assert!(engine.push_samples(&A4_TONE[..WINDOW - 1]).unwrap().is_none());

    let first = engine.push_samples(&A4_TONE[WINDOW - 1..WINDOW]).unwrap();
    let first = first.expect("window is now full");
    assert_eq!(first.sequence, 1);
    assert_eq!(first.end_sample, WINDOW as u64);

    // Next window closes one hop later
    assert!(engine
        .push_samples(&A4_TONE[WINDOW..WINDOW + HOP - 1])
        .unwrap()
        .is_none());
    let second = engine
        .push_samples(&A4_TONE[WINDOW + HOP - 1..WINDOW + HOP])
        .unwrap()
        .unwrap();
    assert_eq!(second.sequence, 2);
    assert_eq!(second.end_sample, (WINDOW + HOP) as u64);
}

#[test]
fn reset_requires_a_new_full_window_but_keeps_ordering() {
    let mut engine = engine();
    let before = engine.push_samples(&A4_TONE[..WINDOW]).unwrap().unwrap();

    engine.reset();
    assert!(engine.push_samples(&A4_TONE[..WINDOW - 1]).unwrap().is_none());
    let after = engine.push_samples(&A4_TONE[..1]).unwrap().unwrap();
    assert!(after.sequence > before.sequence);
}

#[test]
fn stereo_frames_are_downmixed() {
    let mut engine = engine();
    let interleaved: Vec<f32> = A4_TONE[..WINDOW]
        .iter()
        .flat_map(|&s| [s, s])
        .collect();
    let frame = AudioFrame::new(interleaved, SAMPLE_RATE, 2).unwrap();

    let result = engine.push_frame(&frame).unwrap().unwrap();
    assert!(within(result.frequency_hz, 440.0, 0.01));
    assert_eq!(result.chord_label, "A");
}

#[test]
fn frames_at_another_rate_are_rejected() {
    let mut engine = engine();
    let frame = AudioFrame::mono(vec![0.0; 512], 48_000).unwrap();

    assert_eq!(
        engine.push_frame(&frame),
        Err(AnalysisError::SampleRateMismatch {
            expected: SAMPLE_RATE,
            got: 48_000
        })
    );
}

#[test]
fn inconsistent_configuration_is_rejected() {
    assert!(AnalysisConfig::builder().window_size(3000).build().is_err());
    assert!(AnalysisConfig::builder().hop_size(0).build().is_err());
    assert!(AnalysisConfig::builder()
        .min_frequency(500.0)
        .max_frequency(400.0)
        .build()
        .is_err());
    assert!(AnalysisConfig::builder()
        .sample_rate(8_000)
        .max_frequency(5_000.0)
        .build()
        .is_err());
    assert!(AnalysisConfig::builder()
        .confidence_threshold(1.5)
        .build()
        .is_err());
}

#[test]
fn config_fills_missing_fields_with_defaults() {
    let config: AnalysisConfig = serde_json::from_str(r#"{ "window_size": 8192 }"#).unwrap();
    assert_eq!(config.window_size(), 8192);
    assert_eq!(config.hop_size(), AnalysisConfig::default().hop_size());
    assert!(config.validate().is_ok());
}

fn chroma_of(notes: &[NoteName]) -> [f32; 12] {
    let mut chroma = [0.0; 12];
    for &note in notes {
        chroma[note as usize] = 1.0;
    }
    chroma
}

#[test]
fn triads_from_chroma() {
    let mut detector = ChordDetector::new();

    let a_major = chroma_of(&[NoteName::A, NoteName::Cs, NoteName::E]);
    let chord = detector.detect_chord(&a_major, None).unwrap();
    assert_eq!(chord.label(), "A");

    let a_minor = chroma_of(&[NoteName::A, NoteName::C, NoteName::E]);
    let chord = detector.detect_chord(&a_minor, Some(220.0)).unwrap();
    assert_eq!(chord.label(), "Am");
    assert_eq!(chord.quality.intervals(), &[0, 3, 7]);

    assert_eq!(NoteName::from_frequency(466.16), NoteName::As);
    assert_eq!(NoteName::from_frequency(0.0), NoteName::Unknown);
}

#[test]
fn equal_scores_prefer_root_nearest_the_fundamental() {
    let mut detector = ChordDetector::new();
    // A lone E fits E major, A major, C major7 ... equally
    let chroma = chroma_of(&[NoteName::E]);

    let chord = detector.detect_chord(&chroma, Some(329.63)).unwrap();
    assert_eq!(chord.root, NoteName::E);
    assert_eq!(chord.quality, ChordKind::Major);

    // Same answer on every call
    for _ in 0..10 {
        assert_eq!(detector.detect_chord(&chroma, Some(329.63)).unwrap(), chord);
    }
}

#[test]
fn chromagram_of_a_major_triad() {
    let mut chromagram = Chromagram::builder()
        .window_size(WINDOW)
        .sampling_rate(SAMPLE_RATE)
        .build()
        .unwrap();
    let window = mix(&[220.0, 277.18, 329.63], WINDOW, SAMPLE_RATE);

    let chroma = chromagram.compute(&window).unwrap();
    for note in [NoteName::A, NoteName::Cs, NoteName::E] {
        assert!(chroma[note as usize] > 0.5, "{note} missing from {chroma:?}");
    }
    assert!(chroma[NoteName::C as usize] < 0.1);

    let chord = ChordDetector::new()
        .detect_chord(&chroma, Some(220.0))
        .unwrap();
    assert_eq!(chord.label(), "A");
}

#[test]
fn chromagram_rejects_wrong_window_length() {
    let mut chromagram = Chromagram::builder().window_size(WINDOW).build().unwrap();
    assert!(chromagram.compute(&[0.0; 100]).is_err());
}

#[test]
fn top_k_ranks_every_template_without_panicking() {
    let mut detector = ChordDetector::new();
    let chroma = chroma_of(&[NoteName::G, NoteName::B, NoteName::D]);

    let all = detector.top_k(&chroma, 120).unwrap();
    assert_eq!(all.len(), 120);
    assert!(all.windows(2).all(|w| w[0].confidence <= w[1].confidence));

    let top = detector.top_k(&chroma, 1).unwrap();
    assert_eq!(top[0].confidence, all[0].confidence);
    assert!(detector.top_k(&chroma, 0).is_err());
}
