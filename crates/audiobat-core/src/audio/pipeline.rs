//! Producer/Consumer frame pipeline
//!
//! A test runs two roles on their own threads. The Producer pulls frames
//! from a [`FrameSource`] and writes them to the playback device; the
//! Consumer reads the capture device and hands frames to a [`FrameSink`].
//!
//! Each role opens its device on the thread that uses it. In loopback mode
//! the Producer starts first and the Consumer follows after the configured
//! capture delay, so the tone is already flowing when capture begins. The
//! Producer always runs to its own completion; the Consumer is cancelled
//! once the Producer succeeds, or as soon as it fails.

use crate::audio::analyzer::{AnalysisBuffer, HarmonicAnalyzer, HarmonicReport};
use crate::audio::noise::{NoiseAnalyzer, NoiseReport};
use crate::audio::pcm::{Direction, PcmBackend, PcmSession};
use crate::audio::signal::ChannelSynth;
use crate::audio::wav::{self, WavFileWriter, WavFormat};
use crate::error::{BatError, Result};
use crate::session::{RunMode, TestSession};
use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Deferred cancellation flag, honored between capture reads
///
/// Cloning shares the flag, so one clone can live in a Ctrl+C handler.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Where the Producer gets its frames
pub trait FrameSource {
    /// Fill `out` with up to `frames` interleaved frames
    ///
    /// Returns the frames produced; 0 ends playback.
    fn fill(&mut self, out: &mut [u8], frames: usize) -> Result<usize>;

    /// Whether the source has nothing more to play
    ///
    /// Checked when a write stalls, so a stuck device cannot hold the
    /// Producer once the source is finished.
    fn is_done(&self) -> bool {
        false
    }

    /// Called after the device recovered from an underrun
    fn on_xrun(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called once after the last write
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Where the Consumer puts captured frames
pub trait FrameSink {
    /// Take `data`, which holds whole interleaved frames
    fn consume(&mut self, data: &[u8]) -> Result<ControlFlow<()>>;

    /// Called after the device recovered from an overrun
    fn on_xrun(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// Called once after the last read
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Generated test tone, optionally mirrored into a debug WAV file
pub struct SineSource<'a> {
    session: &'a TestSession,
    synth: ChannelSynth,
    saveplay: Option<WavFileWriter>,
}

impl<'a> SineSource<'a> {
    pub fn new(session: &'a TestSession) -> Result<Self> {
        let saveplay = session
            .config()
            .saveplay
            .as_deref()
            .map(|path| WavFileWriter::create(path, WavFormat::from_session(session)))
            .transpose()?;
        Ok(Self {
            session,
            synth: ChannelSynth::new(),
            saveplay,
        })
    }
}

impl FrameSource for SineSource<'_> {
    fn fill(&mut self, out: &mut [u8], frames: usize) -> Result<usize> {
        self.synth.fill(self.session, out, frames)?;
        if let Some(writer) = self.saveplay.as_mut() {
            writer.write_data(&out[..frames * self.session.frame_size()])?;
        }
        Ok(frames)
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.saveplay.take() {
            let path = writer.path().to_path_buf();
            let bytes = writer.finish()?;
            tracing::info!(path = %path.display(), bytes, "Saved playback signal");
        }
        Ok(())
    }
}

/// PCM data of a WAV file
pub struct FileSource {
    reader: BufReader<File>,
    path: PathBuf,
    remaining: u64,
    frame_size: usize,
}

impl FileSource {
    /// Open `path`, whose format must already be applied to the session
    pub fn open(path: &Path, session: &TestSession) -> Result<Self> {
        let (file, info) = wav::open(path, true)?;
        let frame_size = usize::from(info.format.block_align);
        if info.format.channels != session.channels()
            || info.format.sample_rate != session.sample_rate()
            || frame_size != session.frame_size()
        {
            return Err(BatError::Configuration(format!(
                "{} does not match the session format",
                path.display()
            )));
        }
        tracing::info!(path = %path.display(), frames = info.frames, "Playing WAV file");
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            remaining: info.frames * frame_size as u64,
            frame_size,
        })
    }
}

impl FrameSource for FileSource {
    fn fill(&mut self, out: &mut [u8], frames: usize) -> Result<usize> {
        let wanted = (frames * self.frame_size).min(self.remaining as usize);
        let mut filled = 0;
        while filled < wanted {
            let n = self
                .reader
                .read(&mut out[filled..wanted])
                .map_err(|e| BatError::file(&self.path, e))?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.remaining -= filled as u64;
        Ok(filled / self.frame_size)
    }

    fn is_done(&self) -> bool {
        self.remaining < self.frame_size as u64
    }
}

/// Capture written to a WAV file
pub struct WavSink {
    writer: Option<WavFileWriter>,
}

impl WavSink {
    pub fn create(path: &Path, session: &TestSession) -> Result<Self> {
        Ok(Self {
            writer: Some(WavFileWriter::create(path, WavFormat::from_session(session))?),
        })
    }
}

impl FrameSink for WavSink {
    fn consume(&mut self, data: &[u8]) -> Result<ControlFlow<()>> {
        if let Some(writer) = self.writer.as_mut() {
            writer.write_data(data)?;
        }
        Ok(ControlFlow::Continue(()))
    }

    fn finish(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }
}

/// Producer loop: write source frames until the source ends or `limit` frames
///
/// Returns the frames written.
pub fn run_producer(
    pcm: &mut PcmSession,
    source: &mut dyn FrameSource,
    limit: Option<u64>,
) -> Result<u64> {
    let period = pcm.period_size();
    let frame_size = pcm.frame_size();
    let mut written: u64 = 0;
    let mut pending = 0;

    loop {
        if pending == 0 {
            let want = match limit {
                Some(limit) => (limit.saturating_sub(written)).min(period as u64) as usize,
                None => period,
            };
            if want == 0 {
                break;
            }
            pending = source.fill(pcm.buffer_mut(), want)?;
            if pending == 0 {
                break;
            }
        }

        let xruns = pcm.xruns();
        let n = pcm.write(pending)?;
        written += n as u64;
        if pcm.xruns() != xruns && source.on_xrun().is_break() {
            break;
        }
        if n < pending {
            // keep the unwritten tail at the front for the next attempt
            pcm.buffer_mut()
                .copy_within(n * frame_size..pending * frame_size, 0);
            if source.is_done() {
                tracing::debug!(dropped = pending - n, "Playback source finished during stall");
                break;
            }
        }
        pending -= n;
    }

    source.finish()?;
    tracing::debug!(frames = written, "Producer finished");
    Ok(written)
}

/// Consumer loop: read frames into `sink` until cancelled, told to stop, or
/// `limit` frames
///
/// Cancellation is checked once per read iteration. Returns the frames read.
pub fn run_consumer(
    pcm: &mut PcmSession,
    sink: &mut dyn FrameSink,
    limit: Option<u64>,
    cancel: &CancelToken,
) -> Result<u64> {
    let period = pcm.period_size();
    let frame_size = pcm.frame_size();
    let mut captured: u64 = 0;

    loop {
        if cancel.is_cancelled() {
            tracing::debug!(frames = captured, "Capture cancelled");
            break;
        }
        let want = match limit {
            Some(limit) => (limit.saturating_sub(captured)).min(period as u64) as usize,
            None => period,
        };
        if want == 0 {
            break;
        }

        let xruns = pcm.xruns();
        let n = pcm.read(want)?;
        if pcm.xruns() != xruns && sink.on_xrun().is_break() {
            break;
        }
        if n == 0 {
            continue;
        }
        captured += n as u64;
        if sink.consume(&pcm.buffer()[..n * frame_size])?.is_break() {
            break;
        }
    }

    sink.finish()?;
    tracing::debug!(frames = captured, "Consumer finished");
    Ok(captured)
}

/// Frames moved by each role of a finished session
#[derive(Debug, Clone, Default)]
pub struct SessionOutcome {
    pub frames_played: u64,
    pub frames_captured: u64,
    /// Capture WAV file, when the session captured
    pub capture_path: Option<PathBuf>,
}

/// Play the session's source on its playback device
pub fn play(session: &TestSession, backend: &dyn PcmBackend) -> Result<u64> {
    let mut pcm = PcmSession::open(
        backend,
        session.playback_device(),
        Direction::Playback,
        session,
    )?;
    let limit = session.frame_limit(pcm.period_size());
    let played = match session.config().input_file.as_deref() {
        Some(path) => run_producer(&mut pcm, &mut FileSource::open(path, session)?, Some(limit)),
        None => run_producer(&mut pcm, &mut SineSource::new(session)?, Some(limit)),
    };
    let closed = pcm.close();
    let played = played?;
    closed?;
    tracing::info!(frames = played, "Playback done");
    Ok(played)
}

/// Capture from the session's capture device into a WAV file at `path`
pub fn capture(
    session: &TestSession,
    backend: &dyn PcmBackend,
    path: &Path,
    cancel: &CancelToken,
) -> Result<u64> {
    let mut pcm = PcmSession::open(
        backend,
        session.capture_device(),
        Direction::Capture,
        session,
    )?;
    let limit = session.frame_limit(pcm.period_size());
    let mut sink = WavSink::create(path, session)?;
    let captured = run_consumer(&mut pcm, &mut sink, Some(limit), cancel);
    let closed = pcm.close();
    let captured = captured?;
    closed?;
    tracing::info!(frames = captured, path = %path.display(), "Capture done");
    Ok(captured)
}

/// Capture file from the session, or a fresh `bat.*.wav` kept in the
/// temporary directory
pub fn capture_path(session: &TestSession) -> Result<PathBuf> {
    if let Some(path) = session.config().capture_file.clone() {
        return Ok(path);
    }
    let file = tempfile::Builder::new()
        .prefix("bat.")
        .suffix(".wav")
        .tempfile()?;
    let (_, path) = file.keep().map_err(|e| BatError::Io(e.error))?;
    Ok(path)
}

/// Run the roles of the session's mode
pub fn run_session(
    session: &TestSession,
    backend: &dyn PcmBackend,
    cancel: &CancelToken,
) -> Result<SessionOutcome> {
    match session.mode() {
        RunMode::PlaybackOnly => Ok(SessionOutcome {
            frames_played: play(session, backend)?,
            ..SessionOutcome::default()
        }),
        RunMode::CaptureOnly => {
            let path = capture_path(session)?;
            let frames_captured = capture(session, backend, &path, cancel)?;
            Ok(SessionOutcome {
                frames_captured,
                capture_path: Some(path),
                ..SessionOutcome::default()
            })
        }
        RunMode::Loopback => {
            let path = capture_path(session)?;
            let delay = Duration::from_millis(session.config().capture_delay_ms);
            let (played, captured) = thread::scope(|scope| {
                let producer = scope.spawn(|| play(session, backend));
                thread::sleep(delay);
                if producer.is_finished() {
                    let played = join_role(producer, "playback");
                    if let Err(e) = &played {
                        tracing::error!(error = %e, "Playback failed, capture not started");
                        return (played, Ok(0));
                    }
                    return (played, capture(session, backend, &path, cancel));
                }
                let consumer = scope.spawn(|| capture(session, backend, &path, cancel));

                let played = join_role(producer, "playback");
                if let Err(e) = &played {
                    tracing::error!(error = %e, "Playback failed, cancelling capture");
                }
                cancel.cancel();
                (played, join_role(consumer, "capture"))
            });
            Ok(SessionOutcome {
                frames_played: played?,
                frames_captured: captured?,
                capture_path: Some(path),
            })
        }
    }
}

fn join_role<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>, role: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| BatError::Device(format!("{role} thread panicked")))?
}

/// Per-channel analysis results of one capture
#[derive(Debug, Clone, Default)]
pub struct CaptureAnalysis {
    pub harmonic: Vec<HarmonicReport>,
    pub noise: Vec<NoiseReport>,
}

/// Run the harmonic and then the noise analysis on every captured channel
///
/// Reports are collected into `analysis` as they are produced; the first
/// failing check ends the analysis with its error.
pub fn analyze_capture(
    session: &TestSession,
    path: &Path,
    analysis: &mut CaptureAnalysis,
) -> Result<()> {
    let buffer = AnalysisBuffer::load(path, session)?;
    let mut harmonic = HarmonicAnalyzer::new(session.sigma_k());

    for channel in 0..buffer.channel_count() {
        let target = session.target_frequency(channel);
        let samples = buffer.channel(channel);

        let report = harmonic.analyze(channel, samples, buffer.sample_rate(), target)?;
        let verdict = report.check();
        analysis.harmonic.push(report);
        verdict?;

        let noise = NoiseAnalyzer::new(target, buffer.sample_rate(), session.snr_threshold_db())?;
        analysis.noise.push(noise.analyze(channel, samples)?);
        tracing::info!(channel, "Channel passed");
    }
    Ok(())
}
