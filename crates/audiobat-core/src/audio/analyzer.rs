//! FFT-based harmonic analysis of a captured channel
//!
//! The capture is reduced to a magnitude spectrum and scanned for runs of
//! bins standing out from the spectrum's own statistics (`mean + k·σ`).
//! Each run is one detected peak, classified against the channel's target
//! frequency:
//!
//! ```text
//! hz < DC_THRESHOLD_HZ                   -> Dc
//! |hz - target| > max(DELTA_HZ, DELTA_RATE·target) -> WrongPeak
//! otherwise                              -> Pass
//! ```
//!
//! The DC bin is left out of the scan. A capture with no peak but a mean
//! offset of at least [`DC_MIN_LEVEL`] reports that offset as a lone DC peak.

use crate::error::{BatError, Result};
use crate::session::{SampleFormat, TestSession};
use realfft::RealFftPlanner;
use serde::Serialize;
use std::f64::consts::FRAC_PI_2;
use std::io::Read;
use std::path::Path;

/// Peaks below this frequency count as DC
pub const DC_THRESHOLD_HZ: f64 = 7.01;

/// Smallest mean offset, in full scale, reported as a DC peak
pub const DC_MIN_LEVEL: f64 = 0.001;

/// Absolute frequency tolerance in Hz
pub const DELTA_HZ: f64 = 1.0;

/// Frequency tolerance relative to the target
pub const DELTA_RATE: f64 = 0.005;

/// Peak regions examined before the scan stops
pub const MAX_PEAKS: usize = 10;

/// Smallest FFT used, as a power of two
pub const FFT_MIN_EXP: u32 = 10;

/// Largest FFT used, as a power of two
pub const FFT_MAX_EXP: u32 = 20;

/// Captured samples de-interleaved per channel, normalized to [-1.0, 1.0)
#[derive(Debug, Clone)]
pub struct AnalysisBuffer {
    channels: Vec<Vec<f64>>,
    sample_rate: u32,
}

impl AnalysisBuffer {
    /// De-interleave raw PCM bytes
    pub fn from_interleaved(
        data: &[u8],
        format: SampleFormat,
        channels: u16,
        sample_rate: u32,
    ) -> Self {
        let sample_size = format.sample_size();
        let frame_size = sample_size * usize::from(channels);
        let frames = data.len() / frame_size;
        let mut out = vec![Vec::with_capacity(frames); usize::from(channels)];
        for frame in data.chunks_exact(frame_size) {
            for (channel, sample) in out.iter_mut().zip(frame.chunks_exact(sample_size)) {
                channel.push(format.decode(sample));
            }
        }
        Self {
            channels: out,
            sample_rate,
        }
    }

    /// Load the frames to analyze from a captured WAV file
    pub fn load(path: &Path, session: &TestSession) -> Result<Self> {
        let (file, info) = crate::audio::wav::open(path, session.is_local())?;
        let format = SampleFormat::from_bits(info.format.bits_per_sample).ok_or_else(|| {
            BatError::Format(format!(
                "unsupported bit depth {} in {}",
                info.format.bits_per_sample,
                path.display()
            ))
        })?;
        if info.format.channels != session.channels() {
            return Err(BatError::Format(format!(
                "{} has {} channel(s), session uses {}",
                path.display(),
                info.format.channels,
                session.channels()
            )));
        }
        let wanted = info.frames * u64::from(info.format.block_align);
        let mut data = Vec::with_capacity(wanted as usize);
        file.take(wanted)
            .read_to_end(&mut data)
            .map_err(|e| BatError::file(path, e))?;
        tracing::info!(
            path = %path.display(),
            frames = data.len() / usize::from(info.format.block_align),
            "Loaded capture for analysis"
        );
        Ok(Self::from_interleaved(
            &data,
            format,
            info.format.channels,
            info.format.sample_rate,
        ))
    }

    pub fn channel(&self, channel: usize) -> &[f64] {
        &self.channels[channel]
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Classification of one detected peak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PeakClass {
    Dc,
    WrongPeak,
    Pass,
}

/// One run of consecutive bins above the detection threshold
#[derive(Debug, Clone, Serialize)]
pub struct Peak {
    /// Bin with the largest magnitude in the run
    pub bin: usize,
    pub hz: f64,
    /// Peak bin magnitude relative to the spectrum mean, or to full scale
    /// for a DC offset
    pub magnitude_db: f64,
    /// Energy of the whole run relative to the spectrum mean
    pub total_db: f64,
    pub start_hz: f64,
    pub end_hz: f64,
    pub class: PeakClass,
}

/// Harmonic analysis result for one channel
#[derive(Debug, Clone, Serialize)]
pub struct HarmonicReport {
    pub channel: usize,
    pub target_hz: f64,
    pub fft_size: usize,
    /// Estimated peak amplitude as a percentage of full scale
    pub amplitude_percent: f64,
    pub peaks: Vec<Peak>,
}

impl HarmonicReport {
    /// Turn the detected peaks into a verdict
    pub fn check(&self) -> Result<()> {
        if self.peaks.is_empty() {
            return Err(BatError::NoPeakDetected);
        }
        if self.peaks.len() == 1 && self.peaks[0].class == PeakClass::Dc {
            return Err(BatError::OnlyDcDetected);
        }
        if self.peaks.iter().any(|p| p.class == PeakClass::WrongPeak) {
            return Err(BatError::BadPeakDetected);
        }
        Ok(())
    }
}

/// Classify a peak frequency against the target
pub fn classify_peak(hz: f64, target: f64) -> PeakClass {
    let tolerance = DELTA_HZ.max(DELTA_RATE * target);
    if hz < DC_THRESHOLD_HZ {
        PeakClass::Dc
    } else if hz < target - tolerance || hz > target + tolerance {
        PeakClass::WrongPeak
    } else {
        PeakClass::Pass
    }
}

/// Largest power of two not above `len`, limited to the FFT size range
pub fn fft_size(len: usize) -> Result<usize> {
    let min = 1usize << FFT_MIN_EXP;
    if len < min {
        return Err(BatError::Configuration(format!(
            "{len} frames too few to analyze, need at least {min}"
        )));
    }
    let floor = 1usize << (usize::BITS - 1 - len.leading_zeros());
    Ok(floor.min(1 << FFT_MAX_EXP))
}

/// Peak amplitude estimated from the mean absolute deviation, in percent
/// of full scale
pub fn amplitude_percent(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let deviation = samples.iter().map(|x| (x - mean).abs()).sum::<f64>() / n;
    deviation * FRAC_PI_2 * 100.0
}

/// Mean offset of `samples` as a DC peak, when it is large enough
pub fn dc_offset_peak(samples: &[f64]) -> Option<Peak> {
    if samples.is_empty() {
        return None;
    }
    let offset = samples.iter().sum::<f64>() / samples.len() as f64;
    if !(offset.abs() >= DC_MIN_LEVEL) {
        return None;
    }
    let level_db = 20.0 * offset.abs().log10();
    tracing::warn!("  Found DC offset of {:.4} ({:.1} dBFS)", offset, level_db);
    Some(Peak {
        bin: 0,
        hz: 0.0,
        magnitude_db: level_db,
        total_db: level_db,
        start_hz: 0.0,
        end_hz: 0.0,
        class: PeakClass::Dc,
    })
}

/// FFT spectrum analyzer with peak detection
pub struct HarmonicAnalyzer {
    planner: RealFftPlanner<f64>,
    sigma_k: f64,
    max_peaks: usize,
}

impl HarmonicAnalyzer {
    /// Create an analyzer flagging bins `sigma_k` deviations above the mean
    pub fn new(sigma_k: f64) -> Self {
        Self {
            planner: RealFftPlanner::new(),
            sigma_k,
            max_peaks: MAX_PEAKS,
        }
    }

    /// Magnitude of each positive-frequency bin, DC bin zeroed
    ///
    /// `samples.len()` must be the FFT size.
    pub fn spectrum(&mut self, samples: &[f64]) -> Result<Vec<f64>> {
        let n = samples.len();
        let fft = self.planner.plan_fft_forward(n);
        let mut input = samples.to_vec();
        let mut output = fft.make_output_vec();
        fft.process(&mut input, &mut output)
            .map_err(|e| BatError::Configuration(format!("FFT of {n} samples failed: {e}")))?;

        let mut magnitudes: Vec<f64> = output[..n / 2].iter().map(|c| c.norm()).collect();
        if let Some(dc) = magnitudes.first_mut() {
            *dc = 0.0;
        }
        Ok(magnitudes)
    }

    /// Scan a magnitude spectrum for peak regions
    pub fn find_peaks(&self, magnitudes: &[f64], bin_hz: f64, target: f64) -> Vec<Peak> {
        let n = magnitudes.len() as f64;
        let mean = magnitudes.iter().sum::<f64>() / n;
        let variance = magnitudes.iter().map(|m| (m - mean).powi(2)).sum::<f64>() / n;
        let threshold = mean + self.sigma_k * variance.sqrt();
        let db = |ratio: f64| 10.0 * (ratio / mean).log10();

        let mut peaks = Vec::new();
        let mut i = 0;
        while i < magnitudes.len() && peaks.len() < self.max_peaks {
            if magnitudes[i] <= threshold {
                i += 1;
                continue;
            }
            let start = i;
            let mut max_bin = i;
            let mut energy = 0.0;
            while i < magnitudes.len() && magnitudes[i] > threshold {
                energy += magnitudes[i];
                if magnitudes[i] > magnitudes[max_bin] {
                    max_bin = i;
                }
                i += 1;
            }
            let end = i - 1;

            let hz = max_bin as f64 * bin_hz;
            let peak = Peak {
                bin: max_bin,
                hz,
                magnitude_db: db(magnitudes[max_bin]),
                total_db: db(energy),
                start_hz: start as f64 * bin_hz,
                end_hz: end as f64 * bin_hz,
                class: classify_peak(hz, target),
            };
            tracing::info!(
                "Detected peak at {:.2} Hz of {:.2} dB",
                peak.hz,
                peak.magnitude_db
            );
            tracing::info!(
                "  Total {:.1} dB from {:.2} to {:.2} Hz",
                peak.total_db,
                peak.start_hz,
                peak.end_hz
            );
            match peak.class {
                PeakClass::Dc => {
                    tracing::warn!("  Found low peak {:.2} Hz, very close to DC", peak.hz)
                }
                PeakClass::WrongPeak => tracing::warn!(
                    "  Found wrong peak {:.2} Hz, expected {:.2} Hz",
                    peak.hz,
                    target
                ),
                PeakClass::Pass => tracing::info!("  PASS: Peak detected at target frequency"),
            }
            peaks.push(peak);
        }
        peaks
    }

    /// Analyze one channel against its target frequency
    ///
    /// Configuration errors (too few frames) and corrupt data are returned as
    /// errors; the peak verdict is left to [`HarmonicReport::check`].
    pub fn analyze(
        &mut self,
        channel: usize,
        samples: &[f64],
        sample_rate: u32,
        target: f64,
    ) -> Result<HarmonicReport> {
        let n = fft_size(samples.len())?;
        let samples = &samples[..n];

        let amplitude = amplitude_percent(samples);
        if !(amplitude >= 0.0) {
            return Err(BatError::Format(format!(
                "corrupt sample data on channel {channel}: amplitude {amplitude}"
            )));
        }
        tracing::info!(channel, fft_size = n, "Amplitude: {:.1}% of full scale", amplitude);
        if amplitude < 1.0 {
            tracing::warn!(channel, "Signal too weak!");
        } else if amplitude > 100.0 {
            tracing::warn!(channel, "Signal overflow!");
        }

        let magnitudes = self.spectrum(samples)?;
        let bin_hz = f64::from(sample_rate) / n as f64;
        let mut peaks = self.find_peaks(&magnitudes, bin_hz, target);
        if peaks.is_empty() {
            peaks.extend(dc_offset_peak(samples));
        }

        Ok(HarmonicReport {
            channel,
            target_hz: target,
            fft_size: n,
            amplitude_percent: amplitude,
            peaks,
        })
    }
}
