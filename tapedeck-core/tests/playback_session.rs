//! End-to-end playback sessions against the simulated backend.

mod common;

use std::time::Duration;

use common::{drain, fast_config, session, wait_for_idle, wait_until};
use tapedeck_core::{
    SessionConfig, SessionEnd, SessionMode, SessionStatus, SimulatedConfig, SourceBuffer,
    SourceCursor, TapedeckError, ToneSource, Transition, Waveform,
};

const WAIT: Duration = Duration::from_secs(5);

fn mono_cursor(frames: usize, value: f32, rate: u32) -> Box<SourceCursor> {
    Box::new(SourceCursor::new(
        SourceBuffer::new(vec![value; frames], 1, rate).unwrap(),
    ))
}

#[test]
fn short_source_ends_with_silence_and_one_finished_event() {
    let (session, backend) = session(
        fast_config(),
        SimulatedConfig {
            block_sizes: vec![128],
            pace: Duration::from_micros(200),
            ..Default::default()
        },
    );
    let mut finished = session.subscribe_finished();

    let info = match session.start_playback(mono_cursor(300, 0.5, 48_000)).unwrap() {
        Transition::Started(info) => info,
        other => panic!("expected Started, got {other:?}"),
    };
    assert_eq!(info.channels, 2);
    wait_for_idle(&session);

    let report = session.take_finished().unwrap().unwrap();
    assert_eq!(report.end, SessionEnd::EndOfStream);
    assert_eq!(report.mode, SessionMode::Playback);
    assert!(report.recording.is_none());
    assert_eq!(report.diagnostics.frames_played, 300);

    let events = drain(&mut finished);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].frames_played, 300);

    let out = backend.output_samples();
    assert!(out.len() >= 3 * 128 * 2);
    assert!(out[..600].iter().all(|&s| s == 0.5));
    assert!(out[600..].iter().all(|&s| s == 0.0), "tail must be silent");

    assert!(matches!(session.stop().unwrap(), Transition::NotRunning));
}

#[test]
fn stop_before_end_emits_no_finished_event() {
    let (session, _backend) = session(
        fast_config(),
        SimulatedConfig {
            pace: Duration::from_millis(1),
            ..Default::default()
        },
    );
    let mut finished = session.subscribe_finished();
    let mut status = session.subscribe_status();

    session
        .start_playback(mono_cursor(48_000 * 10, 0.1, 48_000))
        .unwrap();
    assert!(wait_until(WAIT, || session.diagnostics_snapshot().frames_played > 0));

    let report = match session.stop().unwrap() {
        Transition::Stopped(report) => report,
        other => panic!("expected Stopped, got {other:?}"),
    };
    assert_eq!(report.end, SessionEnd::Requested);
    assert!(drain(&mut finished).is_empty());

    let statuses: Vec<_> = drain(&mut status).iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        [SessionStatus::Active, SessionStatus::Stopping, SessionStatus::Idle]
    );
}

#[test]
fn pause_freezes_position_and_resume_continues() {
    let (session, _backend) = session(
        fast_config(),
        SimulatedConfig {
            pace: Duration::from_micros(500),
            ..Default::default()
        },
    );

    session
        .start_playback(mono_cursor(48_000 * 10, 0.2, 48_000))
        .unwrap();
    assert!(wait_until(WAIT, || session.diagnostics_snapshot().frames_played > 0));

    assert!(matches!(session.toggle_pause(), Transition::Paused));
    std::thread::sleep(Duration::from_millis(20));
    let frozen = session.progress().unwrap();
    assert!(frozen.paused);
    std::thread::sleep(Duration::from_millis(30));
    assert_eq!(session.progress().unwrap().frames, frozen.frames);
    assert!(session.diagnostics_snapshot().silence_frames > 0);

    assert!(matches!(session.toggle_pause(), Transition::Resumed));
    assert!(wait_until(WAIT, || {
        session.progress().is_some_and(|p| p.frames > frozen.frames)
    }));
    let progress = session.progress().unwrap();
    assert_eq!(progress.total_frames, Some(480_000));
    assert!(progress.position_secs() > 0.0);
    session.stop().unwrap();
}

#[test]
fn rate_mismatch_plays_at_device_rate_by_default() {
    let (session, _backend) = session(
        fast_config(),
        SimulatedConfig {
            sample_rate: 48_000,
            block_sizes: vec![512],
            ..Default::default()
        },
    );

    session
        .start_playback(mono_cursor(4_410, 0.3, 44_100))
        .unwrap();
    wait_for_idle(&session);

    let report = session.take_finished().unwrap().unwrap();
    assert_eq!(report.stream.sample_rate, 48_000);
    assert_eq!(report.diagnostics.frames_played, 4_410);
}

#[test]
fn rate_mismatch_is_resampled_when_asked() {
    let (session, _backend) = session(
        SessionConfig {
            resample_to_device: true,
            ..fast_config()
        },
        SimulatedConfig {
            sample_rate: 48_000,
            block_sizes: vec![512],
            ..Default::default()
        },
    );

    session
        .start_playback(mono_cursor(4_410, 0.3, 44_100))
        .unwrap();
    wait_for_idle(&session);

    let played = session
        .take_finished()
        .unwrap()
        .unwrap()
        .diagnostics
        .frames_played;
    assert!((4_750..=4_800).contains(&played), "played {played} frames");
}

#[test]
fn generated_tone_is_rendered_at_device_rate() {
    let (session, backend) = session(
        fast_config(),
        SimulatedConfig {
            sample_rate: 48_000,
            block_sizes: vec![128],
            ..Default::default()
        },
    );

    let tone = ToneSource::new(Waveform::Square, 1_000.0, 0.5, 44_100).with_duration(0.01);
    session.start_playback(Box::new(tone)).unwrap();
    wait_for_idle(&session);

    let report = session.take_finished().unwrap().unwrap();
    assert_eq!(report.diagnostics.frames_played, 480);
    let out = backend.output_samples();
    assert!(out[..960].iter().all(|s| s.abs() == 0.5));
}

#[test]
fn looping_source_keeps_playing_until_stopped() {
    let (session, _backend) = session(
        fast_config(),
        SimulatedConfig {
            block_sizes: vec![64],
            pace: Duration::from_micros(100),
            ..Default::default()
        },
    );
    let source = SourceCursor::new(SourceBuffer::new(vec![0.25; 100], 1, 48_000).unwrap())
        .looping(true);

    session.start_playback(Box::new(source)).unwrap();
    assert!(wait_until(WAIT, || session.diagnostics_snapshot().frames_played > 1_000));
    assert_eq!(session.state(), SessionStatus::Active);

    let Transition::Stopped(report) = session.stop().unwrap() else {
        panic!("expected Stopped");
    };
    assert_eq!(report.end, SessionEnd::Requested);
}

#[test]
fn disconnect_during_playback_ends_without_finished_event() {
    let (session, _backend) = session(
        fast_config(),
        SimulatedConfig {
            pace: Duration::from_micros(200),
            disconnect_after: Some(3),
            ..Default::default()
        },
    );
    let mut finished = session.subscribe_finished();

    session
        .start_playback(mono_cursor(48_000, 0.1, 48_000))
        .unwrap();
    wait_for_idle(&session);

    let report = session.take_finished().unwrap().unwrap();
    assert_eq!(report.end, SessionEnd::Disconnected);
    assert!(drain(&mut finished).is_empty());
}

#[test]
fn output_open_failure_leaves_session_idle() {
    let (session, backend) = session(
        fast_config(),
        SimulatedConfig {
            fail_open: true,
            ..Default::default()
        },
    );

    let err = session
        .start_playback(mono_cursor(100, 0.1, 48_000))
        .unwrap_err();
    assert!(matches!(err, TapedeckError::AudioDevice(_)), "{err:?}");
    assert_eq!(session.state(), SessionStatus::Idle);
    assert!(session.progress().is_none());
    assert_eq!(backend.live_streams(), 0);
}

#[test]
fn capture_and_playback_share_one_session_in_turn() {
    let (session, _backend) = session(
        fast_config(),
        SimulatedConfig {
            pace: Duration::from_micros(200),
            ..Default::default()
        },
    );

    session
        .start_playback(mono_cursor(48_000 * 10, 0.1, 48_000))
        .unwrap();
    assert!(matches!(
        session
            .start_capture(tapedeck_core::CaptureTarget::File(None))
            .unwrap(),
        Transition::AlreadyRunning
    ));
    assert_eq!(session.connections().unwrap().sample_rate, 48_000);
    session.stop().unwrap();
    assert!(session.connections().is_none());
}
