//! Phase-aligned signal-to-noise estimation
//!
//! The capture is cut into non-overlapping windows of two target periods.
//! The first period of a window is searched for a falling zero crossing,
//! located to a fraction of a sample by linear interpolation; the second
//! period is compared with a reference tone started at that crossing. After
//! scaling the capture to the reference RMS, whatever differs is noise:
//!
//! ```text
//! SNR_dB = 20·log10(rms(reference) / rms(aligned - reference))
//! ```

use crate::audio::signal::SineGenerator;
use crate::error::{BatError, Result};
use serde::Serialize;
use std::f64::consts::PI;

/// SNR estimate for one channel
#[derive(Debug, Clone, Serialize)]
pub struct NoiseReport {
    pub channel: usize,
    /// Windows examined
    pub windows: usize,
    /// Windows at or below the threshold, including those without a crossing
    pub noisy: usize,
    /// Mean SNR over the clean windows
    pub average_snr_db: f64,
    pub threshold_db: f64,
}

/// Per-channel SNR analyzer for one target frequency
#[derive(Debug, Clone)]
pub struct NoiseAnalyzer {
    /// One period of the falling tone, `-sin(ωj)`
    reference: Vec<f64>,
    /// Matching quadrature, `-cos(ωj)`
    quadrature: Vec<f64>,
    /// Samples per target period
    period: f64,
    /// Radians per sample
    omega: f64,
    threshold_db: f64,
}

impl NoiseAnalyzer {
    /// Build the reference tone for `frequency`
    ///
    /// # Arguments
    /// * `frequency` - Target frequency in Hz
    /// * `sample_rate` - Sample rate of the capture
    /// * `threshold_db` - Windows must exceed this SNR to count as clean
    pub fn new(frequency: f64, sample_rate: u32, threshold_db: f64) -> Result<Self> {
        let mut gen = SineGenerator::new(1.0, frequency, sample_rate)?;
        let period = f64::from(sample_rate) / frequency;
        let len = period.floor() as usize;
        if len < 2 {
            return Err(BatError::Configuration(format!(
                "{frequency} Hz leaves under two samples per period at {sample_rate} Hz"
            )));
        }
        let (reference, quadrature): (Vec<f64>, Vec<f64>) = (0..len)
            .map(|_| {
                let (sin, cos) = gen.next_with_quadrature();
                (-sin, -cos)
            })
            .unzip();

        Ok(Self {
            reference,
            quadrature,
            period,
            omega: 2.0 * PI * frequency / f64::from(sample_rate),
            threshold_db,
        })
    }

    /// Samples consumed by one window
    pub fn window_len(&self) -> usize {
        (2.0 * self.period).ceil() as usize
    }

    /// SNR of a single window in dB
    ///
    /// Fails with a configuration error when the first period holds no
    /// falling zero crossing.
    pub fn window_snr(&self, window: &[f64]) -> Result<f64> {
        let len = self.reference.len();
        // any i with i + 1 + len <= window.len() leaves room for the aligned period
        let search = (self.period.ceil() as usize).min(window.len().saturating_sub(len));
        let crossing = (0..search).find(|&i| window[i] > 0.0 && window[i + 1] <= 0.0);
        let Some(i) = crossing else {
            return Err(BatError::Configuration(
                "no zero crossing in acquisition period".into(),
            ));
        };
        let zero = i as f64 + window[i] / (window[i] - window[i + 1]);
        // first aligned sample sits this far after the crossing
        let shift = self.omega * ((i + 1) as f64 - zero);
        let (sin_shift, cos_shift) = shift.sin_cos();

        let expected: Vec<f64> = self
            .reference
            .iter()
            .zip(&self.quadrature)
            .map(|(&s, &c)| s * cos_shift + c * sin_shift)
            .collect();
        let expected_rms = rms(&expected);

        let aligned = &window[i + 1..i + 1 + len];
        let aligned_rms = rms(aligned);
        if aligned_rms == 0.0 {
            return Err(BatError::Configuration("silent measurement period".into()));
        }
        let gain = expected_rms / aligned_rms;

        let noise_power = aligned
            .iter()
            .zip(&expected)
            .map(|(&x, &e)| (x * gain - e).powi(2))
            .sum::<f64>()
            / len as f64;
        let noise_rms = noise_power.sqrt().max(expected_rms * f64::EPSILON);
        Ok(20.0 * (expected_rms / noise_rms).log10())
    }

    /// Estimate the SNR of a whole channel
    ///
    /// Returns [`BatError::ExcessiveNoise`] when no window is clean.
    pub fn analyze(&self, channel: usize, samples: &[f64]) -> Result<NoiseReport> {
        let window_len = self.window_len();
        let windows = samples.len() / window_len;
        if windows == 0 {
            return Err(BatError::Configuration(format!(
                "{} samples too few for one {window_len}-sample noise window",
                samples.len()
            )));
        }

        let mut noisy = 0;
        let mut clean_sum = 0.0;
        for (index, window) in samples.chunks_exact(window_len).enumerate() {
            match self.window_snr(window) {
                Ok(snr) if snr > self.threshold_db => clean_sum += snr,
                Ok(snr) => {
                    noisy += 1;
                    tracing::debug!(channel, index, snr, "Noisy window");
                }
                Err(e) => {
                    noisy += 1;
                    tracing::debug!(channel, index, error = %e, "Window skipped");
                }
            }
        }

        if noisy == windows {
            tracing::error!(channel, windows, "Noise above threshold in every window");
            return Err(BatError::ExcessiveNoise { noisy, windows });
        }
        if noisy > 0 {
            tracing::warn!(channel, noisy, windows, "Noise above threshold in some windows");
        }
        let average_snr_db = clean_sum / (windows - noisy) as f64;
        tracing::info!(
            channel,
            windows,
            "SNR: {:.2} dB (threshold {:.2} dB)",
            average_snr_db,
            self.threshold_db
        );
        Ok(NoiseReport {
            channel,
            windows,
            noisy,
            average_snr_db,
            threshold_db: self.threshold_db,
        })
    }
}

fn rms(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|x| x * x).sum::<f64>() / samples.len() as f64).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(freq: f64, rate: u32, len: usize, phase: f64) -> Vec<f64> {
        (0..len)
            .map(|n| 0.8 * (2.0 * PI * freq * n as f64 / f64::from(rate) + phase).sin())
            .collect()
    }

    /// Deterministic uniform noise in [-amplitude, amplitude]
    fn noise(len: usize, amplitude: f64) -> Vec<f64> {
        let mut seed: u32 = 0x1234_5678;
        (0..len)
            .map(|_| {
                seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
                (f64::from(seed) / f64::from(u32::MAX) * 2.0 - 1.0) * amplitude
            })
            .collect()
    }

    #[test]
    fn test_reference_tone_is_clean() {
        let analyzer = NoiseAnalyzer::new(997.0, 44100, 30.0).unwrap();
        let samples = tone(997.0, 44100, 44100, 0.0);
        let report = analyzer.analyze(0, &samples).unwrap();
        assert_eq!(report.noisy, 0);
        assert!(report.average_snr_db > 60.0, "SNR {}", report.average_snr_db);
    }

    #[test]
    fn test_phase_offset_does_not_matter() {
        let analyzer = NoiseAnalyzer::new(1000.0, 48000, 30.0).unwrap();
        for phase in [0.3, 1.7, 2.9, 4.4] {
            let samples = tone(1000.0, 48000, 4800, phase);
            let report = analyzer.analyze(0, &samples).unwrap();
            assert!(report.average_snr_db > 60.0, "phase {phase}: {}", report.average_snr_db);
        }
    }

    /// Tone as it comes back from an S16 capture
    fn quantized_tone(freq: f64, rate: u32, len: usize, magnitude: f64) -> Vec<f64> {
        (0..len)
            .map(|n| {
                let x = magnitude * (2.0 * PI * freq * n as f64 / f64::from(rate)).sin();
                (x * 32767.0).round() / 32767.0
            })
            .collect()
    }

    #[test]
    fn test_quantized_tone_is_clean() {
        let analyzer = NoiseAnalyzer::new(997.0, 44100, 30.0).unwrap();
        let samples = quantized_tone(997.0, 44100, 22050, 0.9);
        let report = analyzer.analyze(0, &samples).unwrap();
        assert_eq!(report.windows, 22050 / analyzer.window_len());
        assert_eq!(report.noisy, 0);
    }

    #[test]
    fn test_every_window_start_finds_a_crossing() {
        for (freq, rate) in [(997.0, 44100), (1000.0, 48000), (440.0, 22050)] {
            let analyzer = NoiseAnalyzer::new(freq, rate, 30.0).unwrap();
            let window_len = analyzer.window_len();
            let period = (f64::from(rate) / freq).ceil() as usize;
            let samples = quantized_tone(freq, rate, window_len + 2 * period, 0.9);
            for start in 0..=period {
                let window = &samples[start..start + window_len];
                let snr = analyzer.window_snr(window).unwrap_or_else(|e| {
                    panic!("{freq} Hz at {rate} Hz, start {start}: {e}")
                });
                assert!(snr > 60.0, "{freq} Hz at {rate} Hz, start {start}: {snr} dB");
            }
        }
    }

    #[test]
    fn test_gain_is_compensated() {
        let analyzer = NoiseAnalyzer::new(997.0, 44100, 30.0).unwrap();
        let quiet: Vec<f64> = tone(997.0, 44100, 8820, 0.5).iter().map(|x| x * 0.01).collect();
        assert!(analyzer.analyze(0, &quiet).unwrap().average_snr_db > 60.0);
    }

    #[test]
    fn test_strong_noise_fails() {
        let analyzer = NoiseAnalyzer::new(997.0, 44100, 30.0).unwrap();
        let samples: Vec<f64> = tone(997.0, 44100, 44100, 0.0)
            .iter()
            .zip(noise(44100, 0.5))
            .map(|(s, n)| s + n)
            .collect();
        let err = analyzer.analyze(0, &samples).unwrap_err();
        assert!(matches!(err, BatError::ExcessiveNoise { .. }));
        assert_eq!(err.exit_code(), 103);
    }

    #[test]
    fn test_moderate_noise_measures_snr() {
        let analyzer = NoiseAnalyzer::new(997.0, 44100, 10.0).unwrap();
        let samples: Vec<f64> = tone(997.0, 44100, 44100, 0.0)
            .iter()
            .zip(noise(44100, 0.01))
            .map(|(s, n)| s + n)
            .collect();
        let report = analyzer.analyze(0, &samples).unwrap();
        // 0.8 peak sine against ±0.01 uniform noise is about 33 dB
        assert!(report.average_snr_db > 25.0 && report.average_snr_db < 45.0);
    }

    #[test]
    fn test_window_without_crossing() {
        let analyzer = NoiseAnalyzer::new(997.0, 44100, 30.0).unwrap();
        let window = vec![0.5; analyzer.window_len()];
        assert!(analyzer.window_snr(&window).is_err());
    }

    #[test]
    fn test_too_short_capture() {
        let analyzer = NoiseAnalyzer::new(100.0, 44100, 30.0).unwrap();
        assert!(analyzer.analyze(0, &[0.0; 100]).is_err());
    }
}
