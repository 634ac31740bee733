//! Audiobat Core - Signal generation, PCM pipeline, and analysis
//!
//! This library provides everything behind the `audiobat` command: it plays a
//! test tone (or a WAV file) through a PCM device while capturing the loopback
//! signal, then verifies the capture's frequency content, noise floor and
//! round-trip latency.

pub mod audio;
pub mod error;
pub mod report;
pub mod session;

pub use audio::{
    analyzer::HarmonicAnalyzer, latency::LatencyMachine, noise::NoiseAnalyzer,
    pcm::PcmBackend, signal::SineGenerator,
};
pub use error::{BatError, Result};
pub use session::{SampleFormat, SessionConfig, TestSession};

/// Library version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date stamped by build.rs
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Default sample rate in Hz
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Default target frequency in Hz
pub const DEFAULT_FREQUENCY: f64 = 997.0;

/// Maximum number of channels the tester drives
pub const MAX_CHANNELS: u16 = 2;
