//! Start/stop/reset behavior of a capture session.

mod common;

use std::time::Duration;

use audiorig::{
    AnalysisStatus, BufferSource, CaptureError, CaptureSession, SessionConfig, SessionError,
    SessionState,
};
use common::{
    sine, wait_until, FailingSource, NullSource, PanickingSource, ToneSource, SAMPLE_RATE,
};

const TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn new_session_is_idle() {
    let session = CaptureSession::new(NullSource).unwrap();
    assert_eq!(session.state(), SessionState::Idle);

    let status = session.status();
    assert_eq!(status.state, SessionState::Idle);
    assert_eq!(status.last_error, None);
    assert_eq!(status.frames_captured, 0);
}

#[test]
fn analyze_and_stop_need_a_running_capture() {
    let session = CaptureSession::new(NullSource).unwrap();
    assert!(matches!(session.analyze(), Err(SessionError::NotCapturing)));
    assert!(matches!(session.stop(), Err(SessionError::NotCapturing)));
    // Reset from idle is a no-op
    assert!(session.reset().is_ok());
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn detects_a_live_tone() {
    let session = CaptureSession::new(ToneSource::new(440.0)).unwrap();
    session.start().unwrap();
    assert_eq!(session.state(), SessionState::Capturing);

    let found = wait_until(TIMEOUT, || {
        session
            .analyze()
            .map(|r| r.is_detected())
            .unwrap_or(false)
    });
    assert!(found, "no detection within {TIMEOUT:?}");

    let result = session.analyze().unwrap();
    assert!((result.frequency_hz - 440.0).abs() < 4.4, "{result:?}");
    assert_eq!(result.chord_label, "A");
    assert!(session.status().results_published >= 1);

    session.stop().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn first_result_is_no_data() {
    let session = CaptureSession::new(NullSource).unwrap();
    session.start().unwrap();

    let result = session.analyze().unwrap();
    assert_eq!(result.status, AnalysisStatus::NoData);
    assert_eq!(result.sequence, 0);
    session.stop().unwrap();
}

#[test]
fn starting_twice_is_rejected() {
    let session = CaptureSession::new(NullSource).unwrap();
    session.start_capture().unwrap();
    assert!(matches!(
        session.start(),
        Err(SessionError::AlreadyCapturing)
    ));
    assert_eq!(session.state(), SessionState::Capturing);
    session.stop().unwrap();
}

#[test]
fn stop_closes_the_source_and_restart_reopens_it() {
    let source = ToneSource::new(261.63);
    let calls = source.calls.clone();
    let session = CaptureSession::new(source).unwrap();

    for round in 1..=3 {
        session.start().unwrap();
        assert!(wait_until(TIMEOUT, || session.status().frames_captured > 0));
        session.stop().unwrap();

        assert_eq!(calls.opened(), round);
        assert_eq!(calls.closed(), round);
    }
}

#[test]
fn device_failure_moves_to_error_until_reset() {
    let source = FailingSource::failing_reads();
    let armed = source.armed.clone();
    let calls = source.calls.clone();
    let session = CaptureSession::new(source).unwrap();

    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.state() == SessionState::Error));

    let expected = CaptureError::StreamFailure("device unplugged".into());
    assert_eq!(session.status().last_error, Some(expected.clone()));
    match session.analyze() {
        Err(SessionError::DeviceFailure(err)) => assert_eq!(err, expected),
        other => panic!("expected device failure, got {other:?}"),
    }
    assert!(matches!(
        session.start(),
        Err(SessionError::AlreadyCapturing)
    ));

    // Stop cleans up but keeps reporting the failure
    assert!(matches!(
        session.stop(),
        Err(SessionError::DeviceFailure(_))
    ));
    assert_eq!(session.state(), SessionState::Error);
    assert_eq!(calls.closed(), 1);

    session.reset().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.status().last_error, None);

    // Once the device is back, capture resumes
    *armed.lock().unwrap() = false;
    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.status().frames_captured > 0));
    assert_eq!(session.state(), SessionState::Capturing);
    session.stop().unwrap();
}

#[test]
fn panicking_source_is_a_device_failure() {
    let source = PanickingSource::new();
    let armed = source.armed.clone();
    let calls = source.calls.clone();
    let session = CaptureSession::new(source).unwrap();

    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.state() == SessionState::Error));
    match session.analyze() {
        Err(SessionError::DeviceFailure(CaptureError::StreamFailure(_))) => {}
        other => panic!("expected stream failure, got {other:?}"),
    }
    assert!(matches!(
        session.status().last_error,
        Some(CaptureError::StreamFailure(_))
    ));
    assert!(matches!(
        session.stop(),
        Err(SessionError::DeviceFailure(_))
    ));
    assert_eq!(calls.closed(), 1);

    // The source survived the panic and can be reopened
    session.reset().unwrap();
    *armed.lock().unwrap() = false;
    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.status().frames_captured > 0));
    assert_eq!(calls.opened(), 2);
    session.stop().unwrap();
}

#[test]
fn reset_directly_from_error() {
    let session = CaptureSession::new(FailingSource::failing_reads()).unwrap();
    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.state() == SessionState::Error));

    session.reset().unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    assert!(matches!(session.analyze(), Err(SessionError::NotCapturing)));
}

#[test]
fn open_failure_keeps_the_session_idle() {
    let source = FailingSource::failing_open();
    let armed = source.armed.clone();
    let session = CaptureSession::new(source).unwrap();

    match session.start() {
        Err(SessionError::DeviceFailure(CaptureError::DeviceUnavailable(_))) => {}
        other => panic!("expected unavailable device, got {other:?}"),
    }
    assert_eq!(session.state(), SessionState::Idle);

    *armed.lock().unwrap() = false;
    session.start().unwrap();
    session.stop().unwrap();
}

#[test]
fn stream_rate_outside_analysis_range_is_rejected() {
    // Nyquist at 2 kHz is below the default 1.5 kHz search ceiling
    let source = BufferSource::new(vec![0.0; 4096], 2_000, 1);
    let session = CaptureSession::new(source).unwrap();

    assert!(matches!(session.start(), Err(SessionError::Analysis(_))));
    assert_eq!(session.state(), SessionState::Idle);
}

#[test]
fn processing_works_in_every_state() {
    let session = CaptureSession::new(FailingSource::failing_reads()).unwrap();
    let input = vec![0.5_f32; 16];

    assert_eq!(session.process(input.clone()).unwrap(), input);
    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.state() == SessionState::Error));
    assert_eq!(session.process(input.clone()).unwrap(), input);
}

#[test]
fn finite_buffer_source_ends_in_error() {
    let samples = sine(440.0, SAMPLE_RATE as usize / 2, SAMPLE_RATE);
    let source = BufferSource::new(samples, SAMPLE_RATE, 1);
    let session = CaptureSession::new(source).unwrap();

    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.state() == SessionState::Error));
    assert_eq!(
        session.status().last_error,
        Some(CaptureError::EndOfStream)
    );
}

#[test]
fn small_buffer_drops_oldest_frames_under_load() {
    let config = SessionConfig::builder()
        .buffer_capacity(1)
        .analysis_poll(Duration::from_millis(50))
        .build()
        .unwrap();
    let samples = sine(440.0, SAMPLE_RATE as usize * 4, SAMPLE_RATE);
    let source = BufferSource::new(samples, SAMPLE_RATE, 1)
        .frame_len(256)
        .looping(true);
    let session = CaptureSession::with_config(source, config).unwrap();

    session.start().unwrap();
    assert!(wait_until(TIMEOUT, || session.status().frames_dropped > 0));
    session.stop().unwrap();
}

#[test]
fn dropping_a_running_session_stops_it() {
    let source = ToneSource::new(440.0);
    let calls = source.calls.clone();
    {
        let session = CaptureSession::new(source).unwrap();
        session.start().unwrap();
    }
    assert_eq!(calls.closed(), 1);
}

#[test]
fn invalid_session_settings_are_rejected() {
    assert!(SessionConfig::builder().buffer_capacity(0).build().is_err());
    assert!(SessionConfig::builder().effect_sample_rate(0).build().is_err());

    let config: SessionConfig =
        serde_json::from_str(r#"{ "buffer_capacity": 32, "analysis": { "hop_size": 1024 } }"#)
            .unwrap();
    assert_eq!(config.buffer_capacity(), 32);
    assert_eq!(config.analysis().hop_size(), 1024);
    assert!(config.validate().is_ok());
}
