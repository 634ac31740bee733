//! JSON summary of a test session

use crate::audio::analyzer::HarmonicReport;
use crate::audio::latency::LatencyReport;
use crate::audio::noise::NoiseReport;
use crate::audio::pipeline::{CaptureAnalysis, SessionOutcome};
use crate::error::{BatError, Result};
use crate::session::{RunMode, SampleFormat, TestSession};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};

/// Everything a session measured, plus its verdict
#[derive(Debug, Clone, Serialize)]
pub struct SessionReport {
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub mode: RunMode,
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    pub target_frequencies: Vec<f64>,
    pub frames_played: u64,
    pub frames_captured: u64,
    pub capture_file: Option<PathBuf>,
    pub harmonic: Vec<HarmonicReport>,
    pub noise: Vec<NoiseReport>,
    pub latency: Option<LatencyReport>,
    /// Process exit code, 0 on success
    pub exit_code: u8,
    pub error: Option<String>,
}

impl SessionReport {
    pub fn new(session: &TestSession) -> Self {
        Self {
            timestamp: Utc::now(),
            version: crate::VERSION.to_string(),
            mode: session.mode(),
            format: session.format(),
            channels: session.channels(),
            sample_rate: session.sample_rate(),
            target_frequencies: session.target_frequencies().to_vec(),
            frames_played: 0,
            frames_captured: 0,
            capture_file: None,
            harmonic: Vec::new(),
            noise: Vec::new(),
            latency: None,
            exit_code: 0,
            error: None,
        }
    }

    pub fn record_outcome(&mut self, outcome: &SessionOutcome) {
        self.frames_played = outcome.frames_played;
        self.frames_captured = outcome.frames_captured;
        self.capture_file = outcome.capture_path.clone();
    }

    pub fn record_analysis(&mut self, analysis: CaptureAnalysis) {
        self.harmonic = analysis.harmonic;
        self.noise = analysis.noise;
    }

    /// Record the session's final error, if any
    pub fn record_result(&mut self, result: std::result::Result<(), &BatError>) {
        match result {
            Ok(()) => {
                self.exit_code = 0;
                self.error = None;
            }
            Err(e) => {
                self.exit_code = e.exit_code();
                self.error = Some(e.to_string());
            }
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| BatError::Configuration(format!("report serialization: {e}")))
    }

    /// Write the report as pretty JSON
    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_json()?).map_err(|e| BatError::file(path, e))?;
        tracing::info!(path = %path.display(), "Report written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;

    fn session() -> TestSession {
        TestSession::new(SessionConfig {
            local: true,
            ..SessionConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_failure_sets_exit_code() {
        let mut report = SessionReport::new(&session());
        report.record_result(Err(&BatError::BadPeakDetected));
        assert_eq!(report.exit_code, 102);
        assert!(report.error.as_deref().unwrap().contains("wrong frequency"));
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let mut report = SessionReport::new(&session());
        report.record_result(Ok(()));
        report.write(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["mode"], "Loopback");
        assert_eq!(value["format"], "S16_LE");
        assert_eq!(value["sample_rate"], 44100);
        assert_eq!(value["exit_code"], 0);
        assert!(value["latency"].is_null());
    }
}
