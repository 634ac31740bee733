//! Error types for audiobat
//!
//! Every fatal condition of a test session maps onto one [`BatError`]
//! variant, and every variant maps onto a process exit code. Transient xruns
//! never show up here: they are recovered inside [`crate::audio::pcm`].

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can end a test session
#[derive(Error, Debug)]
pub enum BatError {
    /// Invalid option value, unsupported channel count, out-of-range frequency
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Device open/negotiate failure or non-recoverable I/O error
    #[error("Device error: {0}")]
    Device(String),

    /// A WAV or log file could not be opened, read or written
    #[error("File error on {}: {source}", path.display())]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// I/O failure without a known path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Not a RIFF/WAVE stream, or a malformed chunk
    #[error("Invalid WAV data: {0}")]
    Format(String),

    #[error("No peak detected")]
    NoPeakDetected,

    #[error("Only DC detected")]
    OnlyDcDetected,

    #[error("Peak detected at wrong frequency")]
    BadPeakDetected,

    #[error("Excessive noise: {noisy} of {windows} windows below threshold")]
    ExcessiveNoise { noisy: usize, windows: usize },

    #[error("Round trip latency test failed: {0}")]
    LatencyFailed(String),
}

/// Result type alias for audiobat
pub type Result<T> = std::result::Result<T, BatError>;

impl BatError {
    /// Wrap an I/O error with the path it happened on
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::File {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::File { .. } | Self::Io(_) | Self::Format(_) => 2,
            Self::Device(_) => 5,
            Self::Configuration(_) => 22,
            Self::NoPeakDetected => 100,
            Self::OnlyDcDetected => 101,
            Self::BadPeakDetected => 102,
            Self::ExcessiveNoise { .. } => 103,
            Self::LatencyFailed(_) => 104,
        }
    }

    /// Whether this error came out of the analysis phase
    pub fn is_analysis(&self) -> bool {
        matches!(
            self,
            Self::NoPeakDetected
                | Self::OnlyDcDetected
                | Self::BadPeakDetected
                | Self::ExcessiveNoise { .. }
                | Self::LatencyFailed(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let errors = [
            BatError::Configuration("x".into()),
            BatError::Device("x".into()),
            BatError::Format("x".into()),
            BatError::NoPeakDetected,
            BatError::OnlyDcDetected,
            BatError::BadPeakDetected,
            BatError::ExcessiveNoise {
                noisy: 3,
                windows: 3,
            },
            BatError::LatencyFailed("x".into()),
        ];
        let mut codes: Vec<u8> = errors.iter().map(BatError::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
        assert!(codes.iter().all(|&c| c != 0));
    }

    #[test]
    fn test_file_error_mentions_path() {
        let err = BatError::file(
            "/tmp/missing.wav",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert!(err.to_string().contains("/tmp/missing.wav"));
        assert_eq!(err.exit_code(), 2);
        assert!(!err.is_analysis());
    }
}
