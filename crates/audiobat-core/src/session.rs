//! Test session configuration and runtime parameters
//!
//! [`SessionConfig`] is the serializable, user-facing configuration (JSON file
//! and command line). [`TestSession`] is the validated form handed by
//! reference to every component: the pipeline roles, the WAV codec and the
//! analyzers.

use crate::audio::analyzer::DC_THRESHOLD_HZ;
use crate::error::{BatError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// PCM sample encodings supported by the tester
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleFormat {
    /// Unsigned 8 bit, centered on 128
    #[serde(rename = "U8")]
    U8,
    /// Signed 16 bit little endian
    #[serde(rename = "S16_LE")]
    S16Le,
    /// Signed 24 bit little endian packed in 3 bytes
    #[serde(rename = "S24_3LE")]
    S24_3Le,
    /// Signed 32 bit little endian
    #[serde(rename = "S32_LE")]
    S32Le,
}

impl SampleFormat {
    /// Bytes per sample
    pub fn sample_size(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16Le => 2,
            Self::S24_3Le => 3,
            Self::S32Le => 4,
        }
    }

    /// Significant bits per sample
    pub fn bits(self) -> u16 {
        self.sample_size() as u16 * 8
    }

    /// Format stored with the given WAV bit depth
    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(Self::U8),
            16 => Some(Self::S16Le),
            24 => Some(Self::S24_3Le),
            32 => Some(Self::S32Le),
            _ => None,
        }
    }

    pub fn is_unsigned(self) -> bool {
        matches!(self, Self::U8)
    }

    /// Magnitude of the most negative sample, `2^(bits-1)`
    pub fn full_scale(self) -> f64 {
        (1u64 << (self.bits() - 1)) as f64
    }

    /// Largest positive sample value, `2^(bits-1) - 1`
    pub fn max_amplitude(self) -> f64 {
        self.full_scale() - 1.0
    }

    /// Offset added to signed values to get the stored value
    pub fn dc_offset(self) -> i64 {
        if self.is_unsigned() {
            1 << (self.bits() - 1)
        } else {
            0
        }
    }

    /// Decode one sample to the normalized range [-1.0, 1.0)
    ///
    /// `bytes` must hold at least [`Self::sample_size`] bytes.
    pub fn decode(self, bytes: &[u8]) -> f64 {
        let raw = match self {
            Self::U8 => i64::from(bytes[0]) - self.dc_offset(),
            Self::S16Le => i64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            Self::S24_3Le => {
                // sign extend through the high byte
                let hi = i64::from(bytes[2] as i8);
                (hi << 16) | (i64::from(bytes[1]) << 8) | i64::from(bytes[0])
            }
            Self::S32Le => i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
        };
        raw as f64 / self.full_scale()
    }

    /// Encode a signed integer sample (before DC offset), clamping to range
    pub fn encode_raw(self, value: i64, out: &mut [u8]) {
        let max = self.full_scale() as i64;
        let value = value.clamp(-max, max - 1) + self.dc_offset();
        match self {
            Self::U8 => out[0] = value as u8,
            Self::S16Le => out[..2].copy_from_slice(&(value as i16).to_le_bytes()),
            Self::S24_3Le => out[..3].copy_from_slice(&(value as i32).to_le_bytes()[..3]),
            Self::S32Le => out[..4].copy_from_slice(&(value as i32).to_le_bytes()),
        }
    }

    /// Encode a normalized sample, clamping to range
    pub fn encode(self, value: f64, out: &mut [u8]) {
        self.encode_raw((value * self.full_scale()).round() as i64, out);
    }
}

impl FromStr for SampleFormat {
    type Err = BatError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "U8" => Ok(Self::U8),
            "S16_LE" => Ok(Self::S16Le),
            "S24_3LE" => Ok(Self::S24_3Le),
            "S32_LE" => Ok(Self::S32Le),
            _ => Err(BatError::Configuration(format!(
                "unsupported sample format: {s}"
            ))),
        }
    }
}

impl fmt::Display for SampleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::U8 => "U8",
            Self::S16Le => "S16_LE",
            Self::S24_3Le => "S24_3LE",
            Self::S32Le => "S32_LE",
        };
        f.write_str(name)
    }
}

/// A `--format` value: a raw sample format or a named shortcut that also
/// fixes rate and channel count
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FormatChoice {
    pub format: SampleFormat,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

/// Parse a format name, accepting the `cd` and `dat` shortcuts
///
/// # Example
/// ```
/// use audiobat_core::session::{parse_format, SampleFormat};
///
/// let cd = parse_format("cd").unwrap();
/// assert_eq!(cd.format, SampleFormat::S16Le);
/// assert_eq!(cd.sample_rate, Some(44100));
/// assert_eq!(cd.channels, Some(2));
/// ```
pub fn parse_format(s: &str) -> Result<FormatChoice> {
    let preset = |sample_rate| FormatChoice {
        format: SampleFormat::S16Le,
        sample_rate: Some(sample_rate),
        channels: Some(2),
    };
    match s.to_ascii_lowercase().as_str() {
        "cd" => Ok(preset(44100)),
        "dat" => Ok(preset(48000)),
        _ => Ok(FormatChoice {
            format: s.parse()?,
            sample_rate: None,
            channels: None,
        }),
    }
}

/// Parse a duration as a frame count (`88200`) or seconds (`2s`, `0.5s`)
pub fn parse_duration(s: &str, sample_rate: u32) -> Result<u64> {
    let invalid = || BatError::Configuration(format!("invalid duration: {s}"));
    let frames = if let Some(secs) = s.strip_suffix('s') {
        let secs: f64 = secs.trim().parse().map_err(|_| invalid())?;
        if !secs.is_finite() || secs <= 0.0 {
            return Err(invalid());
        }
        (secs * f64::from(sample_rate)).round() as u64
    } else {
        s.trim().parse::<u64>().map_err(|_| invalid())?
    };
    if frames == 0 {
        return Err(invalid());
    }
    Ok(frames)
}

/// Parse a target frequency, or a colon separated pair for two channels
pub fn parse_frequencies(s: &str) -> Result<Vec<f64>> {
    let freqs = s
        .split(':')
        .map(|part| {
            part.trim().parse::<f64>().map_err(|_| {
                BatError::Configuration(format!("invalid frequency: {part}"))
            })
        })
        .collect::<Result<Vec<_>>>()?;
    if freqs.is_empty() || freqs.len() > usize::from(crate::MAX_CHANNELS) {
        return Err(BatError::Configuration(format!(
            "expected one or two frequencies, got {s}"
        )));
    }
    Ok(freqs)
}

/// Convert an SNR threshold given as noise percentage to decibels
///
/// # Example
/// ```
/// use audiobat_core::session::snr_db_from_percent;
///
/// let db = snr_db_from_percent(1.0)?;
/// assert!((db - 40.0).abs() < 1e-9);
/// assert!(snr_db_from_percent(0.0).is_err());
/// # Ok::<(), audiobat_core::BatError>(())
/// ```
pub fn snr_db_from_percent(percent: f64) -> Result<f64> {
    if !(percent > 0.0 && percent <= 100.0) {
        return Err(BatError::Configuration(format!(
            "SNR percentage out of range (0, 100]: {percent}"
        )));
    }
    Ok(20.0 * (100.0 / percent).log10())
}

fn default_sample_rate() -> u32 {
    crate::DEFAULT_SAMPLE_RATE
}

fn default_channels() -> u16 {
    1
}

fn default_format() -> SampleFormat {
    SampleFormat::S16Le
}

fn default_duration_secs() -> f64 {
    2.0
}

fn default_frequencies() -> Vec<f64> {
    vec![crate::DEFAULT_FREQUENCY]
}

fn default_sigma_k() -> f64 {
    3.0
}

fn default_snr_threshold_db() -> f64 {
    30.0
}

fn default_capture_delay_ms() -> u64 {
    500
}

/// Round-trip latency measurement settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    /// Number of consistent results needed for success
    pub rounds: usize,
    /// Consecutive listening timeouts before giving up
    pub failure_limit: u32,
    /// Largest period size tried when retrying after an xrun
    pub period_ceiling: u32,
    /// Detection threshold above the ambient level, in dB
    pub margin_db: f64,
    /// Length of the ambient, listening and waiting windows
    pub window_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            rounds: 5,
            failure_limit: 10,
            period_ceiling: 8192,
            margin_db: 16.0,
            window_ms: 1000,
        }
    }
}

/// User-facing session configuration
///
/// Every field has a default, so a partial JSON file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub playback_device: Option<String>,
    #[serde(default)]
    pub capture_device: Option<String>,
    #[serde(default = "default_format")]
    pub format: SampleFormat,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Test length in seconds, unless `frames` is set
    #[serde(default = "default_duration_secs")]
    pub duration_secs: f64,
    #[serde(default)]
    pub frames: Option<u64>,
    /// Target frequency per channel; a single value applies to all channels
    #[serde(default = "default_frequencies")]
    pub frequencies: Vec<f64>,
    /// Peak detection threshold in standard deviations above the mean
    #[serde(default = "default_sigma_k")]
    pub sigma_k: f64,
    /// Stop both roles after this many periods
    #[serde(default)]
    pub periods_total: Option<u64>,
    #[serde(default)]
    pub buffer_size: Option<u32>,
    #[serde(default)]
    pub period_size: Option<u32>,
    /// WAV file to play instead of the generated tone
    #[serde(default)]
    pub input_file: Option<PathBuf>,
    /// Debug copy of the generated playback signal
    #[serde(default)]
    pub saveplay: Option<PathBuf>,
    /// Where the capture is written; a temporary file when unset
    #[serde(default)]
    pub capture_file: Option<PathBuf>,
    /// Use the in-memory loopback driver instead of a sound card
    #[serde(default)]
    pub local: bool,
    /// Skip the analysis phase
    #[serde(default)]
    pub standalone: bool,
    #[serde(default)]
    pub round_trip_latency: bool,
    #[serde(default = "default_snr_threshold_db")]
    pub snr_threshold_db: f64,
    /// Delay between starting playback and starting capture
    #[serde(default = "default_capture_delay_ms")]
    pub capture_delay_ms: u64,
    #[serde(default)]
    pub latency: LatencyConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            playback_device: None,
            capture_device: None,
            format: default_format(),
            channels: default_channels(),
            sample_rate: default_sample_rate(),
            duration_secs: default_duration_secs(),
            frames: None,
            frequencies: default_frequencies(),
            sigma_k: default_sigma_k(),
            periods_total: None,
            buffer_size: None,
            period_size: None,
            input_file: None,
            saveplay: None,
            capture_file: None,
            local: false,
            standalone: false,
            round_trip_latency: false,
            snr_threshold_db: default_snr_threshold_db(),
            capture_delay_ms: default_capture_delay_ms(),
            latency: LatencyConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| BatError::file(path, e))?;
        let config = serde_json::from_str(&contents).map_err(|e| {
            BatError::Configuration(format!("{}: {e}", path.display()))
        })?;
        tracing::info!(path = %path.display(), "Loaded session config");
        Ok(config)
    }
}

/// Which roles a session runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunMode {
    /// Playback and capture at once, capture analyzed afterwards
    Loopback,
    /// Playback only
    PlaybackOnly,
    /// Capture only
    CaptureOnly,
}

/// Validated test session shared by reference with every component
#[derive(Debug, Clone)]
pub struct TestSession {
    config: SessionConfig,
    format: SampleFormat,
    channels: u16,
    sample_rate: u32,
    frames: u64,
    target_freqs: Vec<f64>,
    mode: RunMode,
}

impl TestSession {
    /// Validate a configuration and derive the runtime parameters
    pub fn new(config: SessionConfig) -> Result<Self> {
        let mode = match (
            config.local,
            config.playback_device.is_some(),
            config.capture_device.is_some(),
        ) {
            (true, _, _) | (false, true, true) => RunMode::Loopback,
            (false, true, false) => RunMode::PlaybackOnly,
            (false, false, true) => RunMode::CaptureOnly,
            (false, false, false) => {
                return Err(BatError::Configuration(
                    "no playback or capture device given".into(),
                ))
            }
        };
        if config.sample_rate == 0 {
            return Err(BatError::Configuration("sample rate must be positive".into()));
        }
        if !(config.sigma_k > 0.0) {
            return Err(BatError::Configuration(format!(
                "peak detection sigma must be positive: {}",
                config.sigma_k
            )));
        }
        let frames = match config.frames {
            Some(frames) => frames,
            None => (config.duration_secs * f64::from(config.sample_rate)).round() as u64,
        };
        if frames == 0 {
            return Err(BatError::Configuration("test duration is zero".into()));
        }

        let mut session = Self {
            format: config.format,
            channels: config.channels,
            sample_rate: config.sample_rate,
            frames,
            target_freqs: Vec::new(),
            mode,
            config,
        };
        session.update_targets()?;
        Ok(session)
    }

    /// Apply the `fmt ` values of a WAV file that is about to be played
    pub fn apply_wav_format(&mut self, channels: u16, sample_rate: u32, bits: u16) -> Result<()> {
        let format = SampleFormat::from_bits(bits).ok_or_else(|| {
            BatError::Configuration(format!("unsupported WAV bit depth: {bits}"))
        })?;
        self.format = format;
        self.channels = channels;
        self.sample_rate = sample_rate;
        self.update_targets()
    }

    fn update_targets(&mut self) -> Result<()> {
        if self.channels == 0 || self.channels > crate::MAX_CHANNELS {
            return Err(BatError::Configuration(format!(
                "unsupported channel count: {}",
                self.channels
            )));
        }
        let freqs = &self.config.frequencies;
        let targets = match freqs.len() {
            1 => vec![freqs[0]; usize::from(self.channels)],
            n if n == usize::from(self.channels) => freqs.clone(),
            n => {
                return Err(BatError::Configuration(format!(
                    "{n} frequencies given for {} channel(s)",
                    self.channels
                )))
            }
        };
        let nyquist = f64::from(self.sample_rate) / 2.0;
        for &freq in &targets {
            if !(freq > DC_THRESHOLD_HZ && freq < nyquist) {
                return Err(BatError::Configuration(format!(
                    "target frequency {freq} Hz outside ({DC_THRESHOLD_HZ}, {nyquist}) Hz"
                )));
            }
        }
        self.target_freqs = targets;
        Ok(())
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn format(&self) -> SampleFormat {
        self.format
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn sample_size(&self) -> usize {
        self.format.sample_size()
    }

    /// Bytes per interleaved frame, `sample_size * channels`
    pub fn frame_size(&self) -> usize {
        self.sample_size() * usize::from(self.channels)
    }

    /// Bytes in one period of `period_size` frames
    pub fn period_bytes(&self, period_size: usize) -> usize {
        period_size * self.frame_size()
    }

    /// Frames each role transfers before stopping
    pub fn frames(&self) -> u64 {
        self.frames
    }

    /// Frame limit for one role given its negotiated period size
    pub fn frame_limit(&self, period_size: usize) -> u64 {
        match self.config.periods_total {
            Some(periods) => periods * period_size as u64,
            None => self.frames,
        }
    }

    /// Target frequency for a channel
    pub fn target_frequency(&self, channel: usize) -> f64 {
        self.target_freqs[channel]
    }

    pub fn target_frequencies(&self) -> &[f64] {
        &self.target_freqs
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn sigma_k(&self) -> f64 {
        self.config.sigma_k
    }

    pub fn snr_threshold_db(&self) -> f64 {
        self.config.snr_threshold_db
    }

    pub fn is_local(&self) -> bool {
        self.config.local
    }

    pub fn playback_device(&self) -> &str {
        self.config.playback_device.as_deref().unwrap_or("default")
    }

    pub fn capture_device(&self) -> &str {
        self.config.capture_device.as_deref().unwrap_or("default")
    }
}
