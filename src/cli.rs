//! Command-line interface for audiobat
//!
//! Handles argument parsing and logging configuration.

use audiobat_core::error::{BatError, Result};
use audiobat_core::session::{
    parse_duration, parse_format, parse_frequencies, snr_db_from_percent, SessionConfig,
};
use clap::Parser;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::Level;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::EnvFilter;

/// Default log filter when RUST_LOG is unset
pub const DEFAULT_LOG_FILTER: &str = "audiobat=info,audiobat_core=info";

/// Audiobat - play a test tone through a PCM loopback and verify the capture
#[derive(Parser, Debug)]
#[command(name = "audiobat")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Device used for both playback and capture
    #[arg(short = 'D', long)]
    pub device: Option<String>,

    /// Playback device
    #[arg(short = 'P', long)]
    pub playback: Option<String>,

    /// Capture device
    #[arg(short = 'C', long)]
    pub capture: Option<String>,

    /// Sample format: U8, S16_LE, S24_3LE, S32_LE, or the cd/dat shortcuts
    #[arg(short = 'f', long)]
    pub format: Option<String>,

    /// Number of channels (1 or 2)
    #[arg(short = 'c', long)]
    pub channels: Option<u16>,

    /// Sample rate in Hz
    #[arg(short = 'r', long)]
    pub rate: Option<u32>,

    /// Duration as a frame count, or seconds with an `s` suffix
    #[arg(short = 'n', long)]
    pub duration: Option<String>,

    /// Target frequency in Hz, or `left:right` for two channels
    #[arg(short = 'F', long)]
    pub frequency: Option<String>,

    /// Peak detection threshold in standard deviations
    #[arg(short = 'k', long)]
    pub sigma: Option<f64>,

    /// Stop after this many periods
    #[arg(long)]
    pub periods: Option<u64>,

    /// Buffer size in frames
    #[arg(long)]
    pub buffer_size: Option<u32>,

    /// Period size in frames
    #[arg(long)]
    pub period_size: Option<u32>,

    /// Write all diagnostics to this file
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Play this WAV file instead of the generated tone
    #[arg(long)]
    pub file: Option<PathBuf>,

    /// Save the generated playback signal to this WAV file
    #[arg(long)]
    pub saveplay: Option<PathBuf>,

    /// Write the capture to this WAV file instead of a temporary one
    #[arg(long)]
    pub capture_file: Option<PathBuf>,

    /// Use the in-memory loopback instead of a sound card
    #[arg(long)]
    pub local: bool,

    /// Skip the analysis of the capture
    #[arg(long)]
    pub standalone: bool,

    /// Measure the round-trip latency instead of analyzing a capture
    #[arg(long)]
    pub roundtriplatency: bool,

    /// SNR threshold in dB
    #[arg(long, conflicts_with = "snr_pc")]
    pub snr_db: Option<f64>,

    /// SNR threshold as noise percentage of the signal
    #[arg(long)]
    pub snr_pc: Option<f64>,

    /// JSON session config; command line options override its fields
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Write a JSON report of the session to this file
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// List sound card devices and exit
    #[arg(short = 'l', long)]
    pub list: bool,
}

impl Args {
    /// Build the session configuration
    pub fn to_config(&self) -> Result<SessionConfig> {
        let mut config = match &self.config {
            Some(path) => SessionConfig::load(path)?,
            None => SessionConfig::default(),
        };

        if let Some(device) = &self.device {
            config.playback_device = Some(device.clone());
            config.capture_device = Some(device.clone());
        }
        if let Some(device) = &self.playback {
            config.playback_device = Some(device.clone());
        }
        if let Some(device) = &self.capture {
            config.capture_device = Some(device.clone());
        }

        if let Some(format) = &self.format {
            let choice = parse_format(format)?;
            config.format = choice.format;
            if let Some(rate) = choice.sample_rate {
                config.sample_rate = rate;
            }
            if let Some(channels) = choice.channels {
                config.channels = channels;
            }
        }
        if let Some(channels) = self.channels {
            config.channels = channels;
        }
        if let Some(rate) = self.rate {
            config.sample_rate = rate;
        }
        if let Some(duration) = &self.duration {
            config.frames = Some(parse_duration(duration, config.sample_rate)?);
        }
        if let Some(frequency) = &self.frequency {
            config.frequencies = parse_frequencies(frequency)?;
        }
        if let Some(sigma) = self.sigma {
            config.sigma_k = sigma;
        }

        config.periods_total = self.periods.or(config.periods_total);
        config.buffer_size = self.buffer_size.or(config.buffer_size);
        config.period_size = self.period_size.or(config.period_size);
        config.input_file = self.file.clone().or(config.input_file);
        config.saveplay = self.saveplay.clone().or(config.saveplay);
        config.capture_file = self.capture_file.clone().or(config.capture_file);
        config.local |= self.local;
        config.standalone |= self.standalone;
        config.round_trip_latency |= self.roundtriplatency;

        if let Some(db) = self.snr_db {
            config.snr_threshold_db = db;
        }
        if let Some(percent) = self.snr_pc {
            config.snr_threshold_db = snr_db_from_percent(percent)?;
        }
        Ok(config)
    }
}

/// Initialize the logging system
///
/// Without a log file WARN and ERROR go to stderr and everything else to
/// stdout; with one, both streams go to the file.
pub fn init_logging(log_file: Option<&Path>) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    let installed = match log_file {
        Some(path) => {
            let file = File::create(path).map_err(|e| BatError::file(path, e))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder
            .with_writer(
                std::io::stderr
                    .with_max_level(Level::WARN)
                    .and(std::io::stdout.with_min_level(Level::INFO)),
            )
            .try_init(),
    };
    installed.map_err(|e| BatError::Configuration(format!("logging setup: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("audiobat").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_device_sets_both_directions() {
        let config = parse(&["-D", "hw:0"]).to_config().unwrap();
        assert_eq!(config.playback_device.as_deref(), Some("hw:0"));
        assert_eq!(config.capture_device.as_deref(), Some("hw:0"));
    }

    #[test]
    fn test_format_shortcut_then_override() {
        let config = parse(&["--local", "-f", "dat", "-c", "1"]).to_config().unwrap();
        assert_eq!(config.sample_rate, 48000);
        assert_eq!(config.channels, 1);
    }

    #[test]
    fn test_duration_uses_final_rate() {
        let config = parse(&["--local", "-r", "8000", "-n", "2s"]).to_config().unwrap();
        assert_eq!(config.frames, Some(16000));
    }

    #[test]
    fn test_frequency_pair_and_snr_percent() {
        let config = parse(&["--local", "-F", "500:1000", "--snr-pc", "1"])
            .to_config()
            .unwrap();
        assert_eq!(config.frequencies, vec![500.0, 1000.0]);
        assert!((config.snr_threshold_db - 40.0).abs() < 1e-9);
    }

    #[test]
    fn test_snr_options_conflict() {
        let args = ["audiobat", "--snr-db", "20", "--snr-pc", "1"];
        assert!(Args::try_parse_from(args).is_err());
    }

    #[test]
    fn test_bad_format_is_configuration_error() {
        let err = parse(&["--local", "-f", "S12_LE"]).to_config().unwrap_err();
        assert_eq!(err.exit_code(), 22);
    }

    #[test]
    fn test_config_file_then_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bat.json");
        std::fs::write(&path, r#"{"local": true, "sample_rate": 96000, "sigma_k": 4.0}"#).unwrap();
        let config = parse(&["--config", path.to_str().unwrap(), "-k", "5"])
            .to_config()
            .unwrap();
        assert!(config.local);
        assert_eq!(config.sample_rate, 96000);
        assert_eq!(config.sigma_k, 5.0);
    }
}
