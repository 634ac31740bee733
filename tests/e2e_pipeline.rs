//! E2E tests for run modes and the command line
//!
//! Library-level tests drive `run_session` against the loopback; binary tests
//! run the `audiobat` executable and check its exit code and JSON report.

use audiobat::audio::loopback::{LoopbackBackend, LoopbackConfig};
use audiobat::audio::pipeline::{run_session, CancelToken};
use audiobat::session::RunMode;
use audiobat::{SessionConfig, TestSession};
use std::path::Path;
use std::process::Command;

fn audiobat(args: &[&str]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_audiobat"))
        .args(args)
        .env("RUST_LOG", "audiobat=warn,audiobat_core=warn")
        .output()
        .expect("Failed to run audiobat")
}

fn read_report(path: &Path) -> serde_json::Value {
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
}

#[test]
fn test_playback_only_session() {
    let session = TestSession::new(SessionConfig {
        playback_device: Some("lo".into()),
        frames: Some(4000),
        ..SessionConfig::default()
    })
    .unwrap();
    assert_eq!(session.mode(), RunMode::PlaybackOnly);

    let backend = LoopbackBackend::for_session(&session, LoopbackConfig::default());
    let outcome = run_session(&session, &backend, &CancelToken::new()).unwrap();
    assert_eq!(outcome.frames_played, 4000);
    assert_eq!(outcome.frames_captured, 0);
    assert!(outcome.capture_path.is_none());
}

#[test]
fn test_capture_only_session() {
    let dir = tempfile::tempdir().unwrap();
    let session = TestSession::new(SessionConfig {
        capture_device: Some("lo".into()),
        frames: Some(3000),
        capture_file: Some(dir.path().join("capture.wav")),
        ..SessionConfig::default()
    })
    .unwrap();
    assert_eq!(session.mode(), RunMode::CaptureOnly);

    // only the delay prefill is there to capture
    let backend = LoopbackBackend::for_session(
        &session,
        LoopbackConfig {
            delay_frames: 4000,
            ..LoopbackConfig::default()
        },
    );
    let outcome = run_session(&session, &backend, &CancelToken::new()).unwrap();
    assert_eq!(outcome.frames_captured, 3000);
    assert!(dir.path().join("capture.wav").exists());
}

#[test]
fn test_period_limit_overrides_duration() {
    let dir = tempfile::tempdir().unwrap();
    let session = TestSession::new(SessionConfig {
        local: true,
        periods_total: Some(3),
        period_size: Some(256),
        capture_delay_ms: 0,
        capture_file: Some(dir.path().join("capture.wav")),
        ..SessionConfig::default()
    })
    .unwrap();
    let backend = LoopbackBackend::for_session(&session, LoopbackConfig::default());
    let outcome = run_session(&session, &backend, &CancelToken::new()).unwrap();
    assert_eq!(outcome.frames_played, 768);
    assert_eq!(outcome.frames_captured, 768);
}

#[test]
fn test_cancel_stops_capture_only_session() {
    let dir = tempfile::tempdir().unwrap();
    let session = TestSession::new(SessionConfig {
        capture_device: Some("lo".into()),
        frames: Some(100_000),
        capture_file: Some(dir.path().join("capture.wav")),
        ..SessionConfig::default()
    })
    .unwrap();
    let backend = LoopbackBackend::for_session(&session, LoopbackConfig::default());
    let cancel = CancelToken::new();
    cancel.cancel();
    let outcome = run_session(&session, &backend, &cancel).unwrap();
    assert_eq!(outcome.frames_captured, 0);
}

#[test]
fn test_binary_local_run_passes() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("capture.wav");
    let report = dir.path().join("report.json");
    let output = audiobat(&[
        "--local",
        "-n",
        "22050",
        "--capture-file",
        capture.to_str().unwrap(),
        "--report",
        report.to_str().unwrap(),
    ]);
    assert_eq!(
        output.status.code(),
        Some(0),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let value = read_report(&report);
    assert_eq!(value["exit_code"], 0);
    assert_eq!(value["frames_captured"], 22050);
    assert_eq!(value["harmonic"].as_array().unwrap().len(), 1);
    assert_eq!(value["noise"][0]["noisy"], 0);
}

#[test]
fn test_binary_standalone_skips_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let report = dir.path().join("report.json");
    let output = audiobat(&[
        "--local",
        "--standalone",
        "-n",
        "4096",
        "--report",
        report.to_str().unwrap(),
    ]);
    assert_eq!(output.status.code(), Some(0));
    assert!(read_report(&report)["harmonic"].as_array().unwrap().is_empty());
}

#[test]
fn test_binary_bad_format_exits_22() {
    let output = audiobat(&["--local", "-f", "S12_LE"]);
    assert_eq!(output.status.code(), Some(22));
}

#[test]
fn test_binary_two_frequencies_for_mono_exits_22() {
    let output = audiobat(&["--local", "-F", "500:1000", "-c", "1"]);
    assert_eq!(output.status.code(), Some(22));
}

#[test]
fn test_binary_missing_input_file_exits_2() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("missing.wav");
    let output = audiobat(&["--local", "--file", missing.to_str().unwrap()]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn test_binary_log_file_receives_diagnostics() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("bat.log");
    let output = Command::new(env!("CARGO_BIN_EXE_audiobat"))
        .args(["--local", "--standalone", "-n", "4096", "--log"])
        .arg(&log)
        .env_remove("RUST_LOG")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(0));
    assert!(output.stdout.is_empty());
    let contents = std::fs::read_to_string(&log).unwrap();
    assert!(contents.contains("Session configured"));
}
