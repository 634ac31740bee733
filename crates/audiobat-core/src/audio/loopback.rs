//! In-memory loopback driver
//!
//! A lightweight fixed-config [`PcmBackend`]: whatever the playback side
//! writes comes back, byte for byte, on the capture side through a lock-free
//! ring buffer. The ring starts with a configurable stretch of silence, which
//! plays the role of the round-trip delay of a real cable loopback.
//!
//! Both ends may be opened once at a time; closing an end hands it back so a
//! later attempt (the latency retry loop) can open it again.

use crate::audio::pcm::{Direction, HwParams, HwRequest, PcmBackend, PcmDevice, PcmIoError};
use crate::audio::signal::fill_silence;
use crate::error::{BatError, Result};
use crate::session::SampleFormat;
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Period size granted when the request leaves it open
pub const LOOPBACK_PERIOD_SIZE: usize = 1024;

/// Periods per buffer granted when the request leaves it open
pub const LOOPBACK_PERIODS: usize = 4;

/// Poll interval while waiting on the ring
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Loopback driver settings
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Frames the ring can hold
    pub ring_frames: usize,
    /// Frames of silence queued before the first playback frame
    pub delay_frames: usize,
    /// Fail the first write of every stream whose period is below this size
    pub xrun_below_period: Option<usize>,
    /// Number of writes to fail with an underrun
    pub injected_underruns: u32,
    /// Pace both ends at the sample rate, like a sound card; otherwise they
    /// run as fast as the ring allows
    pub realtime: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            ring_frames: LOOPBACK_PERIOD_SIZE * LOOPBACK_PERIODS * 2,
            delay_frames: 0,
            xrun_below_period: None,
            injected_underruns: 0,
            realtime: false,
        }
    }
}

/// State shared by the two ends
struct Shared {
    playback_end: Mutex<Option<HeapProd<u8>>>,
    capture_end: Mutex<Option<HeapCons<u8>>>,
    /// Bytes queued in the ring
    fill: AtomicUsize,
    capacity: usize,
    format: SampleFormat,
    channels: u16,
    sample_rate: u32,
    xrun_below_period: Option<usize>,
    injected_underruns: AtomicU32,
    realtime: bool,
}

impl Shared {
    fn frame_size(&self) -> usize {
        self.format.sample_size() * usize::from(self.channels)
    }
}

/// In-memory loopback [`PcmBackend`]
pub struct LoopbackBackend {
    shared: Arc<Shared>,
    /// Delay prefill, queued again on restart
    silence: Vec<u8>,
}

impl LoopbackBackend {
    /// Create a loopback for one stream format
    pub fn new(
        format: SampleFormat,
        channels: u16,
        sample_rate: u32,
        config: LoopbackConfig,
    ) -> Self {
        let frame_size = format.sample_size() * usize::from(channels);
        let capacity = (config.ring_frames + config.delay_frames) * frame_size;
        let (mut prod, cons) = HeapRb::<u8>::new(capacity.max(1)).split();

        let mut silence = vec![0u8; config.delay_frames * frame_size];
        fill_silence(format, &mut silence);
        let queued = prod.push_slice(&silence);

        Self {
            shared: Arc::new(Shared {
                playback_end: Mutex::new(Some(prod)),
                capture_end: Mutex::new(Some(cons)),
                fill: AtomicUsize::new(queued),
                capacity,
                format,
                channels,
                sample_rate,
                xrun_below_period: config.xrun_below_period,
                injected_underruns: AtomicU32::new(config.injected_underruns),
                realtime: config.realtime,
            }),
            silence,
        }
    }

    /// Create a loopback matching a test session
    pub fn for_session(session: &crate::session::TestSession, config: LoopbackConfig) -> Self {
        Self::new(session.format(), session.channels(), session.sample_rate(), config)
    }

    /// Bytes currently queued between the two ends
    pub fn queued_bytes(&self) -> usize {
        self.shared.fill.load(Ordering::Acquire)
    }
}

impl PcmBackend for LoopbackBackend {
    fn name(&self) -> &str {
        "loopback"
    }

    fn restart(&self) -> Result<()> {
        let busy = || BatError::Device("loopback restarted while a stream is open".into());
        let mut playback = self.shared.playback_end.lock().map_err(|_| busy())?;
        let mut capture = self.shared.capture_end.lock().map_err(|_| busy())?;
        let (Some(prod), Some(cons)) = (playback.as_mut(), capture.as_mut()) else {
            return Err(busy());
        };

        let mut scratch = [0u8; 4096];
        while cons.pop_slice(&mut scratch) > 0 {}
        let queued = prod.push_slice(&self.silence);
        self.shared.fill.store(queued, Ordering::Release);
        tracing::debug!(queued, "Loopback ring restarted");
        Ok(())
    }

    fn open(&self, device: &str, direction: Direction) -> Result<Box<dyn PcmDevice>> {
        let end = match direction {
            Direction::Playback => self
                .shared
                .playback_end
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .map(End::Playback),
            Direction::Capture => self
                .shared
                .capture_end
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .map(End::Capture),
        };
        let end = end.ok_or_else(|| {
            BatError::Device(format!("loopback {direction} end of {device} is busy"))
        })?;
        tracing::debug!(device, %direction, "Opened loopback end");
        Ok(Box::new(LoopbackDevice {
            shared: Arc::clone(&self.shared),
            end: Some(end),
            period_size: 0,
            buffer_size: 0,
            pending_xrun: false,
            clock: None,
        }))
    }
}

enum End {
    Playback(HeapProd<u8>),
    Capture(HeapCons<u8>),
}

struct LoopbackDevice {
    shared: Arc<Shared>,
    end: Option<End>,
    period_size: usize,
    buffer_size: usize,
    pending_xrun: bool,
    /// Start of the realtime stream and frames transferred since
    clock: Option<(Instant, u64)>,
}

impl LoopbackDevice {
    /// Frames the playback side may write now
    fn writable(&self) -> usize {
        let vacant = (self.shared.capacity - self.shared.fill.load(Ordering::Acquire))
            / self.shared.frame_size();
        if !self.shared.realtime {
            return vacant;
        }
        let Some((started, written)) = self.clock else {
            return vacant.min(self.buffer_size);
        };
        let queued = written.saturating_sub(self.elapsed_frames(started)) as usize;
        vacant.min(self.buffer_size.saturating_sub(queued))
    }

    /// Frames the capture side may read now
    fn readable(&self) -> usize {
        let available = self.shared.fill.load(Ordering::Acquire) / self.shared.frame_size();
        match self.clock {
            Some((started, read)) if self.shared.realtime => {
                available.min(self.elapsed_frames(started).saturating_sub(read) as usize)
            }
            _ => available,
        }
    }

    fn elapsed_frames(&self, started: Instant) -> u64 {
        (started.elapsed().as_secs_f64() * f64::from(self.shared.sample_rate)) as u64
    }

    /// Whether a transfer of at least one frame could proceed now
    fn ready(&self) -> bool {
        match self.end {
            Some(End::Playback(_)) => self.writable() > 0,
            Some(End::Capture(_)) => self.readable() > 0,
            None => false,
        }
    }
}

impl PcmDevice for LoopbackDevice {
    fn negotiate(&mut self, request: &HwRequest) -> Result<HwParams> {
        let shared = &self.shared;
        if request.format != shared.format || request.channels != shared.channels {
            return Err(BatError::Device(format!(
                "loopback is fixed to {} x{}, asked for {} x{}",
                shared.format, shared.channels, request.format, request.channels
            )));
        }
        let period_size = request
            .period_size
            .map_or(LOOPBACK_PERIOD_SIZE, |p| p as usize);
        let buffer_size = request
            .buffer_size
            .map_or(period_size * LOOPBACK_PERIODS, |b| b as usize);
        self.period_size = period_size;
        self.buffer_size = buffer_size;
        self.pending_xrun = shared
            .xrun_below_period
            .is_some_and(|limit| period_size < limit);

        Ok(HwParams {
            sample_rate: shared.sample_rate,
            period_size,
            buffer_size,
            frame_bits: shared.frame_size() * 8,
        })
    }

    fn write_interleaved(
        &mut self,
        data: &[u8],
        frames: usize,
    ) -> std::result::Result<usize, PcmIoError> {
        if self.pending_xrun {
            self.pending_xrun = false;
            return Err(PcmIoError::Xrun);
        }
        let injected = self
            .shared
            .injected_underruns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(PcmIoError::Xrun);
        }

        let frame_size = self.shared.frame_size();
        let fit = frames.min(self.writable());
        let Some(End::Playback(prod)) = self.end.as_mut() else {
            return Err(PcmIoError::Fatal("not a playback stream".into()));
        };
        if fit == 0 {
            return Err(PcmIoError::WouldBlock);
        }
        let pushed = prod.push_slice(&data[..fit * frame_size]);
        self.shared.fill.fetch_add(pushed, Ordering::AcqRel);
        let pushed_frames = pushed / frame_size;
        if self.shared.realtime {
            let (_, written) = self.clock.get_or_insert_with(|| (Instant::now(), 0));
            *written += pushed_frames as u64;
        }
        Ok(pushed_frames)
    }

    fn read_interleaved(
        &mut self,
        data: &mut [u8],
        frames: usize,
    ) -> std::result::Result<usize, PcmIoError> {
        if self.shared.realtime && self.clock.is_none() {
            self.clock = Some((Instant::now(), 0));
        }
        let frame_size = self.shared.frame_size();
        let take = frames.min(self.readable());
        let Some(End::Capture(cons)) = self.end.as_mut() else {
            return Err(PcmIoError::Fatal("not a capture stream".into()));
        };
        if take == 0 {
            return Err(PcmIoError::WouldBlock);
        }
        let popped = cons.pop_slice(&mut data[..take * frame_size]);
        self.shared.fill.fetch_sub(popped, Ordering::AcqRel);
        let popped_frames = popped / frame_size;
        if let Some((_, read)) = self.clock.as_mut() {
            *read += popped_frames as u64;
        }
        Ok(popped_frames)
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while !self.ready() {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        true
    }

    fn prepare(&mut self) -> Result<()> {
        self.clock = None;
        tracing::debug!(period_size = self.period_size, "Loopback stream re-primed");
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        // Wait for the capture side to empty the ring, giving up once it stops
        // making progress for a full wait period.
        let mut last = self.shared.fill.load(Ordering::Acquire);
        let mut stalled_since = Instant::now();
        while last > 0 {
            std::thread::sleep(POLL_INTERVAL);
            let fill = self.shared.fill.load(Ordering::Acquire);
            if fill < last {
                stalled_since = Instant::now();
            } else if stalled_since.elapsed() >= crate::audio::pcm::DEFAULT_WAIT_TIMEOUT {
                tracing::debug!(queued = fill, "Loopback drain stopped, capture side idle");
                break;
            }
            last = fill;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        match self.end.take() {
            Some(End::Playback(prod)) => {
                if let Ok(mut slot) = self.shared.playback_end.lock() {
                    *slot = Some(prod);
                }
            }
            Some(End::Capture(cons)) => {
                if let Ok(mut slot) = self.shared.capture_end.lock() {
                    *slot = Some(cons);
                }
            }
            None => {}
        }
    }
}
