//! Audiobat - basic audio tester
//!
//! Plays a test tone (or a WAV file) through a PCM device while capturing the
//! loopback signal, then checks the capture's frequency content, noise floor
//! and round-trip latency. The engine lives in `audiobat-core`; this crate
//! adds the command line.

pub mod cli;

pub use audiobat_core::audio;
pub use audiobat_core::report;
pub use audiobat_core::session;

pub use audiobat_core::{BatError, Result, SampleFormat, SessionConfig, TestSession};
pub use audiobat_core::{BUILD_DATE, DEFAULT_FREQUENCY, DEFAULT_SAMPLE_RATE, VERSION};
