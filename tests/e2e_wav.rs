//! E2E tests for WAV interoperability
//!
//! Files written by the tester must open in other WAV readers, and files
//! written elsewhere must play back through the tester.

use approx::assert_abs_diff_eq;
use audiobat::audio::loopback::{LoopbackBackend, LoopbackConfig};
use audiobat::audio::pipeline::{analyze_capture, run_session, CancelToken, CaptureAnalysis};
use audiobat::audio::wav::{self, WavFileWriter, WavFormat};
use audiobat::{SampleFormat, SessionConfig, TestSession};
use std::fs::File;
use std::path::Path;

fn write_hound_tone(path: &Path, channels: u16, rate: u32, freq: f64, frames: usize) {
    let spec = hound::WavSpec {
        channels,
        sample_rate: rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    for i in 0..frames {
        let t = i as f64 / f64::from(rate);
        let sample = (0.5 * (2.0 * std::f64::consts::PI * freq * t).sin() * 32767.0) as i16;
        for _ in 0..channels {
            writer.write_sample(sample).unwrap();
        }
    }
    writer.finalize().unwrap();
}

/// A capture file opens in hound with the session's format and length
#[test]
fn test_capture_file_readable_by_hound() {
    let dir = tempfile::tempdir().unwrap();
    let capture = dir.path().join("capture.wav");
    let session = TestSession::new(SessionConfig {
        local: true,
        channels: 2,
        sample_rate: 48000,
        format: SampleFormat::S24_3Le,
        frames: Some(4800),
        capture_delay_ms: 0,
        capture_file: Some(capture.clone()),
        ..SessionConfig::default()
    })
    .unwrap();
    let backend = LoopbackBackend::for_session(&session, LoopbackConfig::default());
    run_session(&session, &backend, &CancelToken::new()).unwrap();

    let reader = hound::WavReader::open(&capture).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.sample_rate, 48000);
    assert_eq!(spec.bits_per_sample, 24);
    assert_eq!(reader.duration(), 4800);
}

/// Samples written through the tester decode to the same values in hound
#[test]
fn test_written_samples_match_hound() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ramp.wav");
    let values: Vec<i16> = (0..1000).map(|i| (i * 61 - 30000) as i16).collect();
    let mut writer = WavFileWriter::create(&path, WavFormat::pcm(1, 44100, 16)).unwrap();
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    writer.write_data(&bytes).unwrap();
    writer.finish().unwrap();

    let mut reader = hound::WavReader::open(&path).unwrap();
    let read: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
    assert_eq!(read, values);
}

/// A hound-written file's header is applied onto the session
#[test]
fn test_hound_header_applies_to_session() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tone.wav");
    write_hound_tone(&path, 2, 22050, 440.0, 2205);

    let mut session = TestSession::new(SessionConfig {
        local: true,
        frequencies: vec![440.0],
        ..SessionConfig::default()
    })
    .unwrap();
    let info = wav::read_header_into(&mut File::open(&path).unwrap(), &mut session).unwrap();
    assert_eq!(info.frames, 2205);
    assert_eq!(session.channels(), 2);
    assert_eq!(session.sample_rate(), 22050);
    assert_eq!(session.format(), SampleFormat::S16Le);
    assert_eq!(session.target_frequencies(), &[440.0, 440.0]);
}

/// A hound-written tone played as the input file passes the analysis
#[test]
fn test_play_hound_file_through_loopback() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.wav");
    write_hound_tone(&input, 1, 44100, 997.0, 44100);

    let mut session = TestSession::new(SessionConfig {
        local: true,
        frames: Some(44100),
        capture_delay_ms: 0,
        input_file: Some(input.clone()),
        capture_file: Some(dir.path().join("capture.wav")),
        ..SessionConfig::default()
    })
    .unwrap();
    wav::read_header_into(&mut File::open(&input).unwrap(), &mut session).unwrap();

    let backend = LoopbackBackend::for_session(&session, LoopbackConfig::default());
    let outcome = run_session(&session, &backend, &CancelToken::new()).unwrap();
    assert_eq!(outcome.frames_played, 44100);

    let mut analysis = CaptureAnalysis::default();
    analyze_capture(&session, &outcome.capture_path.unwrap(), &mut analysis).unwrap();
    assert_eq!(analysis.harmonic[0].peaks.len(), 1);
    assert_abs_diff_eq!(analysis.harmonic[0].peaks[0].hz, 997.0, epsilon = 1.5);
    // hound tone is written at half scale
    assert_abs_diff_eq!(analysis.harmonic[0].amplitude_percent, 50.0, epsilon = 1.0);
}

/// Files that are not RIFF/WAVE are rejected with a file-class exit code
#[test]
fn test_non_wav_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bogus.wav");
    std::fs::write(&path, b"this is not a wave file at all, not even close").unwrap();
    let err = wav::open(&path, true).unwrap_err();
    assert_eq!(err.exit_code(), 2);
}
