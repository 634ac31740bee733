//! Round-trip latency measurement
//!
//! A measurement alternates between silence and tone and times how long the
//! tone takes to come back on the capture side:
//!
//! ```text
//! MeasureAmbient ──▶ PlayAndListen ──▶ Waiting ──▶ MeasureAmbient ...
//!                         │
//!                         └──▶ CompleteSuccess | CompleteFailure
//! ```
//!
//! Timing is done in capture frames, not wall-clock time. Each window
//! (ambient, listening, waiting) lasts `window_ms` worth of frames, and a
//! round trip is the number of frames between the start of listening and
//! the first sample above the detection threshold.
//!
//! # Threads
//!
//! The Consumer owns the [`LatencyMachine`] and is the only writer of the
//! state and round number in [`SharedLatency`]. The Producer only reads the
//! state to pick tone or silence and is the only writer of the playing
//! flag. Xruns are reported to the coordinating thread over a channel.

use crate::audio::pcm::{Direction, HwRequest, PcmBackend, PcmSession};
use crate::audio::pipeline::{run_consumer, run_producer, CancelToken, FrameSink, FrameSource};
use crate::audio::signal::{fill_silence, ChannelSynth};
use crate::error::{BatError, Result};
use crate::session::{LatencyConfig, RunMode, SampleFormat, TestSession};
use crossbeam_channel::{Receiver, Sender};
use serde::Serialize;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;

/// Lowest ambient level used to derive the threshold (digital silence)
pub const AMBIENT_FLOOR: f64 = 1e-5;

/// Largest accepted ratio between the slowest and fastest round
pub const CONSISTENCY_RATIO: f64 = 2.0;

/// Period size of the first attempt when none is configured
pub const LATENCY_START_PERIOD: u32 = 256;

/// Periods per buffer when no buffer size is configured
pub const LATENCY_PERIODS: u32 = 4;

/// Measurement state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum LatencyState {
    MeasureAmbient = 0,
    PlayAndListen = 1,
    Waiting = 2,
    CompleteSuccess = 3,
    CompleteFailure = 4,
}

impl LatencyState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::MeasureAmbient,
            1 => Self::PlayAndListen,
            2 => Self::Waiting,
            3 => Self::CompleteSuccess,
            _ => Self::CompleteFailure,
        }
    }

    pub fn is_complete(self) -> bool {
        matches!(self, Self::CompleteSuccess | Self::CompleteFailure)
    }
}

/// Measurement state visible to both roles
#[derive(Debug)]
pub struct SharedLatency {
    /// Written by the Consumer only
    state: AtomicU8,
    /// Written by the Consumer only; incremented on every listening window
    round: AtomicU32,
    /// Written by the Producer only
    playing: AtomicBool,
}

impl SharedLatency {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(LatencyState::MeasureAmbient as u8),
            round: AtomicU32::new(0),
            playing: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> LatencyState {
        LatencyState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn round(&self) -> u32 {
        self.round.load(Ordering::Acquire)
    }

    /// Whether the Producer is emitting the tone
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::Acquire)
    }
}

/// Capture-side latency state machine
///
/// # Example
/// ```
/// use audiobat_core::audio::latency::{LatencyMachine, LatencyState};
/// use audiobat_core::session::LatencyConfig;
///
/// let config = LatencyConfig { window_ms: 100, ..LatencyConfig::default() };
/// let mut machine = LatencyMachine::new(8000, &config);
///
/// // 100 ms of silence sets the threshold and starts listening
/// assert_eq!(machine.process(&[0.0; 800]), LatencyState::PlayAndListen);
///
/// // the tone returns 240 frames later
/// let mut capture = vec![0.0; 400];
/// capture[240..].fill(0.5);
/// machine.process(&capture);
/// assert_eq!(machine.results_ms(), &[30.0]);
/// ```
#[derive(Debug)]
pub struct LatencyMachine {
    shared: Arc<SharedLatency>,
    config: LatencyConfig,
    sample_rate: u32,
    /// Frames in each ambient, listening and waiting window
    window: u64,
    state: LatencyState,
    /// Capture frames processed so far
    input_frame: u64,
    /// Frames spent in the current state
    state_frames: u64,
    ambient_sum: f64,
    threshold: f64,
    /// Capture frame at which the current listening window began
    listen_start: u64,
    /// Previous buffer of the current listening window
    previous: Vec<f64>,
    results_ms: Vec<f64>,
    failures: u32,
    failure: Option<String>,
}

impl LatencyMachine {
    pub fn new(sample_rate: u32, config: &LatencyConfig) -> Self {
        let window = (u64::from(sample_rate) * config.window_ms / 1000).max(1);
        Self {
            shared: Arc::new(SharedLatency::new()),
            config: config.clone(),
            sample_rate,
            window,
            state: LatencyState::MeasureAmbient,
            input_frame: 0,
            state_frames: 0,
            ambient_sum: 0.0,
            threshold: 0.0,
            listen_start: 0,
            previous: Vec::new(),
            results_ms: Vec::new(),
            failures: 0,
            failure: None,
        }
    }

    /// Handle the Producer reads the state through
    pub fn shared(&self) -> Arc<SharedLatency> {
        Arc::clone(&self.shared)
    }

    pub fn state(&self) -> LatencyState {
        self.state
    }

    /// Linear detection threshold derived from the last ambient window
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Round-trip results collected so far
    pub fn results_ms(&self) -> &[f64] {
        &self.results_ms
    }

    /// Mean of the collected results
    pub fn mean_ms(&self) -> Option<f64> {
        if self.results_ms.is_empty() {
            return None;
        }
        Some(self.results_ms.iter().sum::<f64>() / self.results_ms.len() as f64)
    }

    /// Why the measurement failed, once it has
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// End the measurement early, e.g. when capture stops
    pub fn abort(&mut self, reason: &str) {
        if !self.state.is_complete() {
            self.fail(reason.to_string());
        }
    }

    /// Feed one buffer of mono capture samples
    pub fn process(&mut self, samples: &[f64]) -> LatencyState {
        let start = self.input_frame;
        self.input_frame += samples.len() as u64;
        self.state_frames += samples.len() as u64;

        match self.state {
            LatencyState::MeasureAmbient => {
                self.ambient_sum += samples.iter().map(|s| s.abs()).sum::<f64>();
                if self.state_frames >= self.window {
                    let ambient = (self.ambient_sum / self.state_frames as f64).max(AMBIENT_FLOOR);
                    let ambient_db = 20.0 * ambient.log10();
                    self.threshold = 10f64.powf((ambient_db + self.config.margin_db) / 20.0);
                    tracing::debug!(
                        ambient_db,
                        threshold = self.threshold,
                        "Ambient level measured"
                    );
                    self.enter(LatencyState::PlayAndListen);
                }
            }
            LatencyState::PlayAndListen => self.listen(samples, start),
            LatencyState::Waiting => {
                if self.state_frames >= self.window {
                    self.ambient_sum = 0.0;
                    self.enter(LatencyState::MeasureAmbient);
                }
            }
            LatencyState::CompleteSuccess | LatencyState::CompleteFailure => {}
        }
        self.state
    }

    fn listen(&mut self, samples: &[f64], start: u64) {
        let loudness = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|s| s.abs()).sum::<f64>() / samples.len() as f64
        };

        if loudness > self.threshold {
            let earlier = start - self.previous.len() as u64;
            let first = self
                .previous
                .iter()
                .chain(samples)
                .position(|s| s.abs() > self.threshold)
                .map_or(start, |i| earlier + i as u64);
            self.record(first - self.listen_start);
            return;
        }

        if self.input_frame - self.listen_start >= self.window {
            self.failures += 1;
            tracing::warn!(
                failures = self.failures,
                limit = self.config.failure_limit,
                "No signal detected while listening"
            );
            if self.failures >= self.config.failure_limit {
                self.fail(format!("no signal detected in {} attempts", self.failures));
            } else {
                self.enter(LatencyState::Waiting);
            }
            return;
        }

        self.previous.clear();
        self.previous.extend_from_slice(samples);
    }

    fn record(&mut self, frames: u64) {
        let ms = frames as f64 * 1000.0 / f64::from(self.sample_rate);
        self.results_ms.push(ms);
        self.failures = 0;
        tracing::info!(
            round = self.results_ms.len(),
            frames,
            "Round trip latency: {:.3} ms",
            ms
        );

        let max = self.results_ms.iter().copied().fold(f64::MIN, f64::max);
        let min = self.results_ms.iter().copied().fold(f64::MAX, f64::min);
        if max > min * CONSISTENCY_RATIO {
            self.fail(format!("inconsistent results, {min:.3} ms to {max:.3} ms"));
        } else if self.results_ms.len() >= self.config.rounds {
            let mean = self.mean_ms().unwrap_or_default();
            tracing::info!(
                rounds = self.results_ms.len(),
                "Final round trip latency: {:.3} ms",
                mean
            );
            self.enter(LatencyState::CompleteSuccess);
        } else {
            self.enter(LatencyState::Waiting);
        }
    }

    fn fail(&mut self, reason: String) {
        tracing::error!(reason = %reason, "Round trip latency measurement failed");
        self.failure = Some(reason);
        self.enter(LatencyState::CompleteFailure);
    }

    fn enter(&mut self, state: LatencyState) {
        if state == LatencyState::PlayAndListen {
            self.listen_start = self.input_frame;
            self.previous.clear();
            self.shared.round.fetch_add(1, Ordering::AcqRel);
        }
        self.state = state;
        self.state_frames = 0;
        self.shared.state.store(state as u8, Ordering::Release);
    }
}

/// Event a role reports to the coordinating thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptEvent {
    Xrun(Direction),
}

/// Producer side: silence, or the test tone while listening
struct LatencySource<'a> {
    session: &'a TestSession,
    shared: Arc<SharedLatency>,
    synth: ChannelSynth,
    events: Sender<AttemptEvent>,
}

impl FrameSource for LatencySource<'_> {
    fn fill(&mut self, out: &mut [u8], frames: usize) -> Result<usize> {
        let state = self.shared.state();
        if state.is_complete() {
            return Ok(0);
        }
        let playing = state == LatencyState::PlayAndListen;
        if playing != self.shared.is_playing() {
            self.shared.playing.store(playing, Ordering::Release);
            tracing::debug!(round = self.shared.round(), playing, "Tone switched");
        }
        if playing {
            self.synth.fill(self.session, out, frames)?;
        } else {
            fill_silence(self.session.format(), &mut out[..frames * self.session.frame_size()]);
        }
        Ok(frames)
    }

    fn is_done(&self) -> bool {
        self.shared.state().is_complete()
    }

    fn on_xrun(&mut self) -> ControlFlow<()> {
        let _ = self.events.send(AttemptEvent::Xrun(Direction::Playback));
        ControlFlow::Break(())
    }
}

/// Consumer side: first channel fed into the state machine
struct LatencySink<'a> {
    machine: LatencyMachine,
    format: SampleFormat,
    frame_size: usize,
    mono: Vec<f64>,
    events: Sender<AttemptEvent>,
    cancel: &'a CancelToken,
}

impl FrameSink for LatencySink<'_> {
    fn consume(&mut self, data: &[u8]) -> Result<ControlFlow<()>> {
        if self.cancel.is_cancelled() {
            self.machine.abort("cancelled");
            return Ok(ControlFlow::Break(()));
        }
        let sample_size = self.format.sample_size();
        self.mono.clear();
        self.mono.extend(
            data.chunks_exact(self.frame_size)
                .map(|frame| self.format.decode(&frame[..sample_size])),
        );
        if self.machine.process(&self.mono).is_complete() {
            return Ok(ControlFlow::Break(()));
        }
        Ok(ControlFlow::Continue(()))
    }

    fn on_xrun(&mut self) -> ControlFlow<()> {
        let _ = self.events.send(AttemptEvent::Xrun(Direction::Capture));
        ControlFlow::Break(())
    }
}

/// Result of a completed latency measurement
#[derive(Debug, Clone, Serialize)]
pub struct LatencyReport {
    pub results_ms: Vec<f64>,
    pub mean_ms: f64,
    pub threshold: f64,
    /// Period and buffer size of the successful attempt, in frames
    pub period_size: u32,
    pub buffer_size: u32,
    pub attempts: u32,
}

enum Attempt {
    Finished(LatencyMachine),
    Xrun(Direction),
}

/// Measure the round-trip latency of the session's devices
///
/// An xrun aborts the attempt; the next one doubles the period and buffer
/// size, up to the configured period ceiling.
pub fn run_round_trip(
    session: &TestSession,
    backend: &dyn PcmBackend,
    cancel: &CancelToken,
) -> Result<LatencyReport> {
    if session.mode() != RunMode::Loopback {
        return Err(BatError::Configuration(
            "round trip latency needs both a playback and a capture device".into(),
        ));
    }
    let ceiling = session.config().latency.period_ceiling;
    let mut request = HwRequest::from_session(session);
    let mut period = request.period_size.unwrap_or(LATENCY_START_PERIOD);
    let mut buffer = request.buffer_size.unwrap_or(period * LATENCY_PERIODS);
    let mut attempts = 0;

    loop {
        attempts += 1;
        request.period_size = Some(period);
        request.buffer_size = Some(buffer);
        tracing::info!(
            attempt = attempts,
            period_size = period,
            buffer_size = buffer,
            "Starting round trip latency test"
        );

        match attempt(session, backend, &request, cancel)? {
            Attempt::Finished(machine) => {
                if let Some(reason) = machine.failure() {
                    return Err(BatError::LatencyFailed(reason.to_string()));
                }
                return Ok(LatencyReport {
                    results_ms: machine.results_ms().to_vec(),
                    mean_ms: machine.mean_ms().unwrap_or_default(),
                    threshold: machine.threshold(),
                    period_size: period,
                    buffer_size: buffer,
                    attempts,
                });
            }
            Attempt::Xrun(direction) => {
                if period.saturating_mul(2) > ceiling {
                    return Err(BatError::LatencyFailed(format!(
                        "{direction} xrun at period size {period}, ceiling is {ceiling}"
                    )));
                }
                period *= 2;
                buffer *= 2;
                tracing::warn!(
                    %direction,
                    period_size = period,
                    buffer_size = buffer,
                    "Xrun, retrying with larger buffers"
                );
            }
        }
    }
}

fn attempt(
    session: &TestSession,
    backend: &dyn PcmBackend,
    request: &HwRequest,
    cancel: &CancelToken,
) -> Result<Attempt> {
    backend.restart()?;
    let machine = LatencyMachine::new(session.sample_rate(), &session.config().latency);
    let shared = machine.shared();
    let (events, inbox): (Sender<AttemptEvent>, Receiver<AttemptEvent>) =
        crossbeam_channel::unbounded();
    let producer_done = CancelToken::new();

    // No capture delay here: the Producer plays silence until the Consumer
    // has measured the ambient level and switches to PlayAndListen.
    let (played, captured) = thread::scope(|scope| {
        let producer_events = events.clone();
        let producer = scope.spawn(|| {
            let result = (|| {
                let mut pcm = PcmSession::open_with(
                    backend,
                    session.playback_device(),
                    Direction::Playback,
                    request,
                )?;
                let mut source = LatencySource {
                    session,
                    shared,
                    synth: ChannelSynth::new(),
                    events: producer_events,
                };
                let played = run_producer(&mut pcm, &mut source, None);
                pcm.close()?;
                played
            })();
            producer_done.cancel();
            result
        });

        let consumer_events = events.clone();
        let consumer = scope.spawn(|| {
            let mut sink = LatencySink {
                machine,
                format: session.format(),
                frame_size: session.frame_size(),
                mono: Vec::new(),
                events: consumer_events,
                cancel,
            };
            let result = (|| {
                let mut pcm = PcmSession::open_with(
                    backend,
                    session.capture_device(),
                    Direction::Capture,
                    request,
                )?;
                let captured = run_consumer(&mut pcm, &mut sink, None, &producer_done);
                pcm.close()?;
                captured
            })();
            // stops the Producer if capture ended first
            sink.machine.abort("capture stopped");
            result.map(|_| sink.machine)
        });

        (join(producer, "playback"), join(consumer, "capture"))
    });
    drop(events);

    if let Some(AttemptEvent::Xrun(direction)) = inbox.try_iter().next() {
        return Ok(Attempt::Xrun(direction));
    }
    played?;
    Ok(Attempt::Finished(captured?))
}

fn join<T>(handle: thread::ScopedJoinHandle<'_, Result<T>>, role: &str) -> Result<T> {
    handle
        .join()
        .map_err(|_| BatError::Device(format!("{role} thread panicked")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const RATE: u32 = 8000;
    const BUFFER: usize = 160;

    fn config(rounds: usize, failure_limit: u32) -> LatencyConfig {
        LatencyConfig {
            rounds,
            failure_limit,
            window_ms: 100,
            ..LatencyConfig::default()
        }
    }

    fn feed(machine: &mut LatencyMachine, samples: &[f64]) {
        for chunk in samples.chunks(BUFFER) {
            machine.process(chunk);
        }
    }

    /// One full round: ambient, tone back after `offset` frames, waiting
    fn round(machine: &mut LatencyMachine, offset: usize) {
        feed(machine, &[0.0; 800]);
        assert_eq!(machine.state(), LatencyState::PlayAndListen);

        let mut capture = vec![0.0; offset];
        capture.extend(std::iter::repeat(0.5).take(800));
        for chunk in capture.chunks(BUFFER) {
            if machine.process(chunk) != LatencyState::PlayAndListen {
                break;
            }
        }
        if machine.state() == LatencyState::Waiting {
            feed(machine, &[0.0; 800]);
            assert_eq!(machine.state(), LatencyState::MeasureAmbient);
        }
    }

    #[test]
    fn test_source_is_silent_until_listening() {
        let session = TestSession::new(crate::session::SessionConfig {
            local: true,
            sample_rate: RATE,
            ..crate::session::SessionConfig::default()
        })
        .unwrap();
        let mut machine = LatencyMachine::new(RATE, &config(5, 10));
        let mut source = LatencySource {
            session: &session,
            shared: machine.shared(),
            synth: ChannelSynth::new(),
            events: crossbeam_channel::unbounded().0,
        };
        let mut out = vec![0xAAu8; BUFFER * session.frame_size()];

        assert_eq!(source.fill(&mut out, BUFFER).unwrap(), BUFFER);
        assert!(out.iter().all(|&b| b == 0));
        assert!(!source.shared.is_playing());

        feed(&mut machine, &[0.0; 800]);
        assert_eq!(machine.state(), LatencyState::PlayAndListen);
        source.fill(&mut out, BUFFER).unwrap();
        assert!(out.iter().any(|&b| b != 0));
        assert!(source.shared.is_playing());
    }

    #[test]
    fn test_threshold_from_ambient() {
        let mut machine = LatencyMachine::new(RATE, &config(5, 10));
        feed(&mut machine, &[0.01; 800]);
        assert_relative_eq!(machine.threshold(), 0.01 * 10f64.powf(16.0 / 20.0), epsilon = 1e-9);
    }

    #[test]
    fn test_silence_threshold_is_floored() {
        let mut machine = LatencyMachine::new(RATE, &config(5, 10));
        feed(&mut machine, &[0.0; 800]);
        assert!(machine.threshold() > 0.0);
    }

    #[test]
    fn test_known_offset_within_one_buffer() {
        let mut machine = LatencyMachine::new(RATE, &config(5, 10));
        round(&mut machine, 437);
        let truth_ms = 437.0 * 1000.0 / f64::from(RATE);
        let buffer_ms = BUFFER as f64 * 1000.0 / f64::from(RATE);
        assert_eq!(machine.results_ms().len(), 1);
        assert!((machine.results_ms()[0] - truth_ms).abs() < buffer_ms);
    }

    #[test]
    fn test_five_consistent_rounds_succeed() {
        let mut machine = LatencyMachine::new(RATE, &config(5, 10));
        for offset in [400, 410, 420, 405, 415] {
            round(&mut machine, offset);
        }
        assert_eq!(machine.state(), LatencyState::CompleteSuccess);
        assert_relative_eq!(machine.mean_ms().unwrap(), 410.0 / 8.0, epsilon = 1e-9);
        assert_eq!(machine.shared().state(), LatencyState::CompleteSuccess);
    }

    #[test]
    fn test_inconsistent_round_fails() {
        let mut machine = LatencyMachine::new(RATE, &config(5, 10));
        round(&mut machine, 200);
        round(&mut machine, 450);
        assert_eq!(machine.state(), LatencyState::CompleteFailure);
        assert!(machine.failure().unwrap().contains("inconsistent"));
    }

    #[test]
    fn test_repeated_timeouts_fail() {
        let mut machine = LatencyMachine::new(RATE, &config(5, 3));
        for _ in 0..20 {
            feed(&mut machine, &[0.0; 800]);
        }
        assert_eq!(machine.state(), LatencyState::CompleteFailure);
        assert_eq!(machine.results_ms().len(), 0);
    }

    #[test]
    fn test_timeout_goes_through_waiting() {
        let mut machine = LatencyMachine::new(RATE, &config(5, 3));
        feed(&mut machine, &[0.0; 800]);
        feed(&mut machine, &[0.0; 800]);
        assert_eq!(machine.state(), LatencyState::Waiting);
        assert_eq!(machine.shared().round(), 1);
    }

    #[test]
    fn test_abort_only_before_completion() {
        let mut machine = LatencyMachine::new(RATE, &config(1, 3));
        round(&mut machine, 100);
        assert_eq!(machine.state(), LatencyState::CompleteSuccess);
        machine.abort("capture stopped");
        assert_eq!(machine.state(), LatencyState::CompleteSuccess);
        assert!(machine.failure().is_none());
    }

    #[test]
    fn test_state_round_trips_through_u8() {
        for state in [
            LatencyState::MeasureAmbient,
            LatencyState::PlayAndListen,
            LatencyState::Waiting,
            LatencyState::CompleteSuccess,
            LatencyState::CompleteFailure,
        ] {
            assert_eq!(LatencyState::from_u8(state as u8), state);
        }
    }
}
