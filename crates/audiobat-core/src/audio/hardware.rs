//! Sound card driver over cpal
//!
//! cpal delivers audio through callbacks, while the tester drives devices
//! with blocking-style read/write loops. Each direction bridges the two with
//! a lock-free ring of `f32` samples: the callback drains (playback) or fills
//! (capture) the ring, and the PCM session converts between the ring and the
//! session's interleaved byte format.
//!
//! An empty ring in the playback callback is an underrun, a full ring in the
//! capture callback is an overrun. Both are flagged and reported by the next
//! transfer as [`PcmIoError::Xrun`].

use crate::audio::pcm::{Direction, HwParams, HwRequest, PcmBackend, PcmDevice, PcmIoError};
use crate::error::{BatError, Result};
use crate::session::SampleFormat;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BufferSize, Device, SampleRate, Stream, StreamConfig};
use ringbuf::traits::{Consumer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Period size requested when the session leaves it open
pub const HW_PERIOD_SIZE: u32 = 1024;

/// Periods per buffer when the session leaves the buffer size open
pub const HW_PERIODS: u32 = 4;

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Driver for the host's sound cards
#[derive(Debug, Default)]
pub struct CpalBackend;

impl CpalBackend {
    pub fn new() -> Self {
        Self
    }

    /// Names of the devices available for a direction
    pub fn device_names(direction: Direction) -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = match direction {
            Direction::Playback => host.output_devices(),
            Direction::Capture => host.input_devices(),
        }
        .map_err(|e| BatError::Device(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

fn find_device(name: &str, direction: Direction) -> Result<Device> {
    let host = cpal::default_host();
    if name == "default" {
        let device = match direction {
            Direction::Playback => host.default_output_device(),
            Direction::Capture => host.default_input_device(),
        };
        return device.ok_or_else(|| BatError::Device(format!("no default {direction} device")));
    }
    let mut devices = match direction {
        Direction::Playback => host.output_devices(),
        Direction::Capture => host.input_devices(),
    }
    .map_err(|e| BatError::Device(e.to_string()))?;
    devices
        .find(|d| d.name().is_ok_and(|n| n == name))
        .ok_or_else(|| BatError::Device(format!("{direction} device {name} not found")))
}

impl PcmBackend for CpalBackend {
    fn name(&self) -> &str {
        "cpal"
    }

    fn open(&self, device: &str, direction: Direction) -> Result<Box<dyn PcmDevice>> {
        let device = find_device(device, direction)?;
        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            %direction,
            "Opened sound card"
        );
        Ok(Box::new(CpalDevice {
            device,
            direction,
            format: SampleFormat::S16Le,
            channels: 1,
            sample_rate: 0,
            stream: None,
            running: false,
            prod: None,
            cons: None,
            link: Arc::new(Link::default()),
            capacity: 0,
            period_samples: 0,
            scratch: Vec::new(),
        }))
    }
}

/// State shared between the PCM session and the stream callback
#[derive(Debug, Default)]
struct Link {
    /// Samples queued in the ring
    fill: AtomicUsize,
    xrun: AtomicBool,
    failed: AtomicBool,
    /// Set while playback drains, when an empty ring is expected
    draining: AtomicBool,
}

struct CpalDevice {
    device: Device,
    direction: Direction,
    format: SampleFormat,
    channels: usize,
    sample_rate: u32,
    stream: Option<Stream>,
    running: bool,
    /// Writer end of the playback ring
    prod: Option<HeapProd<f32>>,
    /// Reader end of the capture ring
    cons: Option<HeapCons<f32>>,
    link: Arc<Link>,
    /// Ring size in samples
    capacity: usize,
    period_samples: usize,
    scratch: Vec<f32>,
}

impl CpalDevice {
    fn start(&mut self) -> Result<()> {
        if self.running {
            return Ok(());
        }
        if let Some(stream) = &self.stream {
            stream
                .play()
                .map_err(|e| BatError::Device(format!("{} start: {e}", self.direction)))?;
            self.running = true;
            tracing::debug!(direction = %self.direction, "Stream started");
        }
        Ok(())
    }

    fn check(&self) -> std::result::Result<(), PcmIoError> {
        if self.link.failed.load(Ordering::Acquire) {
            return Err(PcmIoError::Fatal("stream error reported by driver".into()));
        }
        if self.link.xrun.swap(false, Ordering::AcqRel) {
            return Err(PcmIoError::Xrun);
        }
        Ok(())
    }

    fn ready(&self) -> bool {
        let fill = self.link.fill.load(Ordering::Acquire);
        match self.direction {
            Direction::Playback => self.capacity - fill >= self.channels,
            Direction::Capture => fill >= self.channels,
        }
    }
}

impl PcmDevice for CpalDevice {
    fn negotiate(&mut self, request: &HwRequest) -> Result<HwParams> {
        let period = request.period_size.unwrap_or(HW_PERIOD_SIZE);
        let buffer = request.buffer_size.unwrap_or(period * HW_PERIODS);
        let config = StreamConfig {
            channels: request.channels,
            sample_rate: SampleRate(request.sample_rate),
            buffer_size: BufferSize::Fixed(period),
        };
        self.format = request.format;
        self.channels = usize::from(request.channels);
        self.sample_rate = request.sample_rate;
        self.capacity = buffer as usize * self.channels;
        self.period_samples = period as usize * self.channels;

        let (prod, cons) = HeapRb::<f32>::new(self.capacity).split();
        let link = Arc::clone(&self.link);
        let err_link = Arc::clone(&self.link);
        let direction = self.direction;
        let on_error = move |err: cpal::StreamError| {
            tracing::error!(%direction, "Stream error: {}", err);
            err_link.failed.store(true, Ordering::Release);
        };

        let stream = match self.direction {
            Direction::Playback => {
                let mut cons = cons;
                self.prod = Some(prod);
                self.device.build_output_stream(
                    &config,
                    move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                        let popped = cons.pop_slice(data);
                        link.fill.fetch_sub(popped, Ordering::AcqRel);
                        data[popped..].fill(0.0);
                        if popped < data.len() && !link.draining.load(Ordering::Acquire) {
                            link.xrun.store(true, Ordering::Release);
                        }
                    },
                    on_error,
                    None,
                )
            }
            Direction::Capture => {
                let mut prod = prod;
                self.cons = Some(cons);
                self.device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        let pushed = prod.push_slice(data);
                        link.fill.fetch_add(pushed, Ordering::AcqRel);
                        if pushed < data.len() {
                            link.xrun.store(true, Ordering::Release);
                        }
                    },
                    on_error,
                    None,
                )
            }
        }
        .map_err(|e| BatError::Device(format!("{direction} stream: {e}")))?;
        self.stream = Some(stream);

        Ok(HwParams {
            sample_rate: request.sample_rate,
            period_size: period as usize,
            buffer_size: buffer as usize,
            frame_bits: request.format.sample_size() * self.channels * 8,
        })
    }

    fn write_interleaved(
        &mut self,
        data: &[u8],
        frames: usize,
    ) -> std::result::Result<usize, PcmIoError> {
        self.check()?;
        let vacant = self.capacity - self.link.fill.load(Ordering::Acquire);
        let fit = frames.min(vacant / self.channels);
        if fit == 0 {
            self.start().map_err(|e| PcmIoError::Fatal(e.to_string()))?;
            return Err(PcmIoError::WouldBlock);
        }

        let sample_size = self.format.sample_size();
        let format = self.format;
        self.scratch.clear();
        self.scratch.extend(
            data[..fit * self.channels * sample_size]
                .chunks_exact(sample_size)
                .map(|s| format.decode(s) as f32),
        );
        let Some(prod) = self.prod.as_mut() else {
            return Err(PcmIoError::Fatal("not a playback stream".into()));
        };
        let pushed = prod.push_slice(&self.scratch);
        self.link.fill.fetch_add(pushed, Ordering::AcqRel);

        // start once a full period is queued so the first callback has data
        if self.link.fill.load(Ordering::Acquire) >= self.period_samples {
            self.start().map_err(|e| PcmIoError::Fatal(e.to_string()))?;
        }
        Ok(pushed / self.channels)
    }

    fn read_interleaved(
        &mut self,
        data: &mut [u8],
        frames: usize,
    ) -> std::result::Result<usize, PcmIoError> {
        self.start().map_err(|e| PcmIoError::Fatal(e.to_string()))?;
        self.check()?;
        let available = self.link.fill.load(Ordering::Acquire) / self.channels;
        let take = frames.min(available);
        if take == 0 {
            return Err(PcmIoError::WouldBlock);
        }

        self.scratch.resize(take * self.channels, 0.0);
        let Some(cons) = self.cons.as_mut() else {
            return Err(PcmIoError::Fatal("not a capture stream".into()));
        };
        let popped = cons.pop_slice(&mut self.scratch);
        self.link.fill.fetch_sub(popped, Ordering::AcqRel);

        let sample_size = self.format.sample_size();
        for (sample, out) in self.scratch[..popped]
            .iter()
            .zip(data.chunks_exact_mut(sample_size))
        {
            self.format.encode(f64::from(*sample), out);
        }
        Ok(popped / self.channels)
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        if self.direction == Direction::Playback && self.start().is_err() {
            return false;
        }
        let deadline = Instant::now() + timeout;
        while !self.ready() {
            if Instant::now() >= deadline || self.link.failed.load(Ordering::Acquire) {
                return false;
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        true
    }

    fn prepare(&mut self) -> Result<()> {
        self.link.xrun.store(false, Ordering::Release);
        Ok(())
    }

    fn drain(&mut self) -> Result<()> {
        self.link.draining.store(true, Ordering::Release);
        self.start()?;
        let frames = self.link.fill.load(Ordering::Acquire) / self.channels.max(1);
        let deadline = Instant::now()
            + Duration::from_secs_f64(frames as f64 / f64::from(self.sample_rate.max(1)) * 2.0)
            + crate::audio::pcm::DEFAULT_WAIT_TIMEOUT;
        while self.link.fill.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(POLL_INTERVAL);
        }
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(stream) = &self.stream {
            if self.running {
                stream
                    .pause()
                    .map_err(|e| BatError::Device(format!("{} stop: {e}", self.direction)))?;
                self.running = false;
            }
        }
        Ok(())
    }
}
