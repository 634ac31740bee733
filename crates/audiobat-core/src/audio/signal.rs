//! Sine test signal generation
//!
//! The oscillator advances a complex phasor by one fixed rotation per sample,
//! so producing a sample costs a single complex multiply and no
//! trigonometric call. One oscillator lives per channel for the whole
//! session; recreating it between buffers would restart the phase and put an
//! audible click in the test tone.

use crate::error::{BatError, Result};
use crate::session::{SampleFormat, TestSession};
use realfft::num_complex::Complex;
use std::f64::consts::PI;

/// Fraction of full scale used for the generated tone
pub const SINE_MAGNITUDE_MARGIN: f64 = 0.9;

/// Recursive complex-phasor sine oscillator
///
/// # Example
/// ```
/// use audiobat_core::audio::signal::SineGenerator;
///
/// let mut gen = SineGenerator::new(1.0, 1000.0, 48000).unwrap();
/// assert_eq!(gen.next_sample(), 0.0);
/// assert!(gen.next_sample() > 0.0);
/// ```
#[derive(Debug, Clone)]
pub struct SineGenerator {
    /// Rotation applied per sample, `e^(i·2πf/r)`
    phasor: Complex<f64>,
    /// Current oscillator state; its real part is the next output
    state: Complex<f64>,
    frequency: f64,
    sample_rate: u32,
    magnitude: f64,
}

impl SineGenerator {
    /// Create an oscillator whose first output sample is exactly 0.0
    ///
    /// # Arguments
    /// * `magnitude` - Peak value of the emitted sine
    /// * `frequency` - Tone frequency in Hz, must be below `sample_rate / 2`
    /// * `sample_rate` - Sample rate in Hz
    pub fn new(magnitude: f64, frequency: f64, sample_rate: u32) -> Result<Self> {
        let nyquist = f64::from(sample_rate) / 2.0;
        if !(frequency > 0.0) || frequency >= nyquist {
            return Err(BatError::Configuration(format!(
                "sine frequency {frequency} Hz must lie in (0, {nyquist}) Hz"
            )));
        }
        let omega = 2.0 * PI * frequency / f64::from(sample_rate);
        Ok(Self {
            phasor: Complex::from_polar(1.0, omega),
            // -90 degrees: real part is sin(0)
            state: Complex::new(0.0, -magnitude),
            frequency,
            sample_rate,
            magnitude,
        })
    }

    /// Emit the current sample and advance the oscillator
    #[inline]
    pub fn next_sample(&mut self) -> f64 {
        let sample = self.state.re;
        self.state *= self.phasor;
        sample
    }

    /// Emit the current sample with its quadrature (cosine) component
    #[inline]
    pub fn next_with_quadrature(&mut self) -> (f64, f64) {
        let pair = (self.state.re, -self.state.im);
        self.state *= self.phasor;
        pair
    }

    /// Fill a buffer with consecutive samples
    pub fn fill_buffer(&mut self, buffer: &mut [f64]) {
        for sample in buffer.iter_mut() {
            *sample = self.next_sample();
        }
    }

    pub fn frequency(&self) -> f64 {
        self.frequency
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn magnitude(&self) -> f64 {
        self.magnitude
    }

    /// Whether this oscillator already produces the requested tone
    fn matches(&self, frequency: f64, sample_rate: u32) -> bool {
        self.frequency == frequency && self.sample_rate == sample_rate
    }
}

/// Multi-channel tone synthesizer writing interleaved PCM bytes
///
/// Keeps one [`SineGenerator`] per channel across calls. A generator is
/// rebuilt only when its channel's frequency or the sample rate changes.
#[derive(Debug, Default)]
pub struct ChannelSynth {
    generators: Vec<Option<SineGenerator>>,
}

impl ChannelSynth {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `frames` interleaved frames of the session's test tone to `out`
    ///
    /// `out` must hold at least `frames * session.frame_size()` bytes.
    pub fn fill(&mut self, session: &TestSession, out: &mut [u8], frames: usize) -> Result<()> {
        let channels = usize::from(session.channels());
        let format = session.format();
        let magnitude = format.max_amplitude() * SINE_MAGNITUDE_MARGIN;
        self.generators.resize(channels, None);

        for (channel, slot) in self.generators.iter_mut().enumerate() {
            let frequency = session.target_frequency(channel);
            let stale = slot
                .as_ref()
                .map_or(true, |gen| !gen.matches(frequency, session.sample_rate()));
            if stale {
                tracing::debug!(channel, frequency, "Initializing sine generator");
                *slot = Some(SineGenerator::new(magnitude, frequency, session.sample_rate())?);
            }
        }

        let sample_size = format.sample_size();
        let frame_size = session.frame_size();
        for frame in out[..frames * frame_size].chunks_exact_mut(frame_size) {
            for (slot, sample) in self
                .generators
                .iter_mut()
                .zip(frame.chunks_exact_mut(sample_size))
            {
                if let Some(gen) = slot.as_mut() {
                    format.encode_raw(gen.next_sample().round() as i64, sample);
                }
            }
        }
        Ok(())
    }
}

/// Fill interleaved bytes with digital silence for `format`
pub fn fill_silence(format: SampleFormat, out: &mut [u8]) {
    if format.is_unsigned() {
        out.fill(format.dc_offset() as u8);
    } else {
        out.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionConfig;
    use approx::assert_relative_eq;

    #[test]
    fn test_first_sample_is_zero() {
        let mut gen = SineGenerator::new(0.5, 997.0, 44100).unwrap();
        assert_eq!(gen.next_sample(), 0.0);
    }

    #[test]
    fn test_matches_direct_sine() {
        let mut gen = SineGenerator::new(1.0, 1000.0, 48000).unwrap();
        for n in 0..4800 {
            let expected = (2.0 * PI * 1000.0 * n as f64 / 48000.0).sin();
            assert!((gen.next_sample() - expected).abs() < 1e-9, "sample {n}");
        }
    }

    #[test]
    fn test_amplitude_drift_after_million_samples() {
        let mut gen = SineGenerator::new(1.0, 997.0, 44100).unwrap();
        let mut buf = vec![0.0; 1_000_000];
        gen.fill_buffer(&mut buf);
        let tail_peak = buf[buf.len() - 4410..]
            .iter()
            .fold(0.0f64, |acc, x| acc.max(x.abs()));
        assert!((tail_peak - 1.0).abs() < 1e-3, "peak drifted to {tail_peak}");
    }

    #[test]
    fn test_rejects_frequency_at_nyquist() {
        assert!(SineGenerator::new(1.0, 22050.0, 44100).is_err());
        assert!(SineGenerator::new(1.0, 0.0, 44100).is_err());
        assert!(SineGenerator::new(1.0, 22049.0, 44100).is_ok());
    }

    #[test]
    fn test_synth_keeps_phase_across_buffers() {
        let session = TestSession::new(SessionConfig {
            local: true,
            ..SessionConfig::default()
        })
        .unwrap();
        let mut synth = ChannelSynth::new();
        let mut whole = vec![0u8; 512 * 2];
        synth.fill(&session, &mut whole, 512).unwrap();

        let mut split_synth = ChannelSynth::new();
        let mut split = vec![0u8; 512 * 2];
        split_synth.fill(&session, &mut split[..256 * 2], 256).unwrap();
        split_synth.fill(&session, &mut split[256 * 2..], 256).unwrap();
        assert_eq!(whole, split);
    }

    #[test]
    fn test_synth_scales_to_format() {
        let session = TestSession::new(SessionConfig {
            local: true,
            format: SampleFormat::U8,
            channels: 2,
            frequencies: vec![1000.0, 2000.0],
            ..SessionConfig::default()
        })
        .unwrap();
        let mut synth = ChannelSynth::new();
        let frames = 4410;
        let mut buf = vec![0u8; frames * 2];
        synth.fill(&session, &mut buf, frames).unwrap();

        // first frame is silence around the unsigned midpoint
        assert_eq!(&buf[..2], &[128, 128]);
        let peak = buf.iter().map(|&b| (i32::from(b) - 128).abs()).max().unwrap();
        assert_relative_eq!(f64::from(peak), 127.0 * SINE_MAGNITUDE_MARGIN, epsilon = 1.0);
    }

    #[test]
    fn test_silence_for_unsigned_format() {
        let mut buf = [0u8; 4];
        fill_silence(SampleFormat::U8, &mut buf);
        assert_eq!(buf, [128; 4]);
        fill_silence(SampleFormat::S16Le, &mut buf);
        assert_eq!(buf, [0; 4]);
    }
}
