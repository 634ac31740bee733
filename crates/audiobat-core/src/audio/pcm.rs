//! PCM device contract and blocking transfer loops
//!
//! A driver implements [`PcmBackend`] (open a named device) and [`PcmDevice`]
//! (negotiate, non-blocking interleaved transfer, wait, re-prime, drain,
//! stop). [`PcmSession`] layers the blocking read/write loops on top and is
//! where transient conditions are absorbed:
//!
//! - would-block or short transfer: wait on the device, then retry
//! - underrun/overrun: log, count the xrun, re-prime the stream, retry
//! - anything else: fatal [`BatError::Device`]

use crate::error::{BatError, Result};
use crate::session::{SampleFormat, TestSession};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// How long a transfer waits on the device before giving control back
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Largest relative difference accepted between requested and negotiated rate
pub const RATE_TOLERANCE: f64 = 0.05;

/// Stream direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Playback => f.write_str("playback"),
            Self::Capture => f.write_str("capture"),
        }
    }
}

/// Hardware parameters asked for by the tester
#[derive(Debug, Clone, PartialEq)]
pub struct HwRequest {
    pub format: SampleFormat,
    pub channels: u16,
    pub sample_rate: u32,
    /// Buffer size in frames, driver default when `None`
    pub buffer_size: Option<u32>,
    /// Period size in frames, driver default when `None`
    pub period_size: Option<u32>,
}

impl HwRequest {
    /// Request matching a session's format and size options
    pub fn from_session(session: &TestSession) -> Self {
        Self {
            format: session.format(),
            channels: session.channels(),
            sample_rate: session.sample_rate(),
            buffer_size: session.config().buffer_size,
            period_size: session.config().period_size,
        }
    }
}

/// Hardware parameters the driver actually granted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwParams {
    pub sample_rate: u32,
    /// Period size in frames
    pub period_size: usize,
    /// Buffer size in frames
    pub buffer_size: usize,
    /// Bits per interleaved frame
    pub frame_bits: usize,
}

/// Non-fatal and fatal outcomes of a single device transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PcmIoError {
    /// Device not ready, try again after [`PcmDevice::wait`]
    #[error("device busy")]
    WouldBlock,
    /// Underrun (playback) or overrun (capture)
    #[error("xrun")]
    Xrun,
    #[error("{0}")]
    Fatal(String),
}

/// One opened direction of a PCM device
///
/// Transfers never block: they move what fits now and report
/// [`PcmIoError::WouldBlock`] or a short count otherwise.
pub trait PcmDevice {
    /// Apply hardware parameters and report what was granted
    fn negotiate(&mut self, request: &HwRequest) -> Result<HwParams>;

    /// Queue up to `frames` interleaved frames from `data`, returns frames taken
    fn write_interleaved(
        &mut self,
        data: &[u8],
        frames: usize,
    ) -> std::result::Result<usize, PcmIoError>;

    /// Fetch up to `frames` interleaved frames into `data`, returns frames read
    fn read_interleaved(
        &mut self,
        data: &mut [u8],
        frames: usize,
    ) -> std::result::Result<usize, PcmIoError>;

    /// Block until the device can transfer again; `false` on timeout
    fn wait(&mut self, timeout: Duration) -> bool;

    /// Re-prime the stream after an xrun
    fn prepare(&mut self) -> Result<()>;

    /// Play out everything queued (playback)
    fn drain(&mut self) -> Result<()>;

    /// Stop the stream, dropping anything pending
    fn stop(&mut self) -> Result<()>;
}

/// A PCM driver able to open named devices
pub trait PcmBackend: Send + Sync {
    /// Driver name for diagnostics
    fn name(&self) -> &str;

    /// Open a device for one direction
    fn open(&self, device: &str, direction: Direction) -> Result<Box<dyn PcmDevice>>;

    /// Return to the freshly created state before a new attempt
    ///
    /// Called with every device closed. Drivers that reset on open need
    /// nothing here.
    fn restart(&self) -> Result<()> {
        Ok(())
    }
}

/// Negotiated per-direction stream with its period buffer
///
/// Created inside the worker thread that uses it and closed by that thread.
pub struct PcmSession {
    device: Box<dyn PcmDevice>,
    direction: Direction,
    name: String,
    params: HwParams,
    frame_size: usize,
    buffer: Vec<u8>,
    xruns: u32,
    wait_timeout: Duration,
}

impl PcmSession {
    /// Open and negotiate a device with the session's parameters
    pub fn open(
        backend: &dyn PcmBackend,
        name: &str,
        direction: Direction,
        session: &TestSession,
    ) -> Result<Self> {
        Self::open_with(backend, name, direction, &HwRequest::from_session(session))
    }

    /// Open and negotiate a device with explicit parameters
    pub fn open_with(
        backend: &dyn PcmBackend,
        name: &str,
        direction: Direction,
        request: &HwRequest,
    ) -> Result<Self> {
        let mut device = backend.open(name, direction).map_err(|e| match e {
            BatError::Device(msg) => BatError::Device(format!("{direction} open {name}: {msg}")),
            other => other,
        })?;
        let params = device.negotiate(request)?;

        let frame_size = request.format.sample_size() * usize::from(request.channels);
        check_params(request, &params, frame_size)?;

        tracing::info!(
            device = name,
            backend = backend.name(),
            %direction,
            format = %request.format,
            channels = request.channels,
            rate = params.sample_rate,
            period_size = params.period_size,
            buffer_size = params.buffer_size,
            "PCM stream negotiated"
        );

        Ok(Self {
            device,
            direction,
            name: name.to_string(),
            params,
            frame_size,
            buffer: vec![0; params.period_size * frame_size],
            xruns: 0,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        })
    }

    /// Override the bounded device wait
    pub fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = timeout;
    }

    pub fn params(&self) -> HwParams {
        self.params
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Negotiated period size in frames
    pub fn period_size(&self) -> usize {
        self.params.period_size
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Bytes in one period, `period_size * frame_size`
    pub fn period_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Number of xruns recovered so far
    pub fn xruns(&self) -> u32 {
        self.xruns
    }

    /// The period buffer transfers use
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Write the first `frames` frames of the period buffer
    ///
    /// Retries until every frame is queued. If a device wait times out the
    /// frames written so far are returned, which may be fewer than asked.
    pub fn write(&mut self, frames: usize) -> Result<usize> {
        let frames = frames.min(self.params.period_size);
        let mut done = 0;
        while done < frames {
            let start = done * self.frame_size;
            let end = frames * self.frame_size;
            let ready = match self
                .device
                .write_interleaved(&self.buffer[start..end], frames - done)
            {
                Ok(n) => {
                    done += n;
                    false
                }
                Err(PcmIoError::WouldBlock) => false,
                Err(PcmIoError::Xrun) => {
                    self.recover_xrun("underrun")?;
                    true
                }
                Err(PcmIoError::Fatal(msg)) => {
                    return Err(BatError::Device(format!("write to {}: {msg}", self.name)))
                }
            };
            if !ready && done < frames && !self.device.wait(self.wait_timeout) {
                tracing::debug!(device = %self.name, done, frames, "playback wait timed out");
                break;
            }
        }
        Ok(done)
    }

    /// Read up to `frames` frames into the period buffer
    ///
    /// Same retry rules as [`Self::write`]; returns the frames read.
    pub fn read(&mut self, frames: usize) -> Result<usize> {
        let frames = frames.min(self.params.period_size);
        let mut done = 0;
        while done < frames {
            let start = done * self.frame_size;
            let end = frames * self.frame_size;
            let ready = match self
                .device
                .read_interleaved(&mut self.buffer[start..end], frames - done)
            {
                Ok(n) => {
                    done += n;
                    false
                }
                Err(PcmIoError::WouldBlock) => false,
                Err(PcmIoError::Xrun) => {
                    self.recover_xrun("overrun")?;
                    true
                }
                Err(PcmIoError::Fatal(msg)) => {
                    return Err(BatError::Device(format!("read from {}: {msg}", self.name)))
                }
            };
            if !ready && done < frames && !self.device.wait(self.wait_timeout) {
                tracing::debug!(device = %self.name, done, frames, "capture wait timed out");
                break;
            }
        }
        Ok(done)
    }

    fn recover_xrun(&mut self, kind: &str) -> Result<()> {
        self.xruns += 1;
        tracing::warn!(device = %self.name, xruns = self.xruns, "{kind}, re-priming stream");
        self.device.prepare()
    }

    /// Drain (playback) or stop (capture), then release the device
    pub fn close(mut self) -> Result<()> {
        let result = match self.direction {
            Direction::Playback => self.device.drain(),
            Direction::Capture => self.device.stop(),
        };
        tracing::debug!(
            device = %self.name,
            direction = %self.direction,
            xruns = self.xruns,
            "PCM stream closed"
        );
        result
    }
}

fn check_params(request: &HwRequest, params: &HwParams, frame_size: usize) -> Result<()> {
    let requested = f64::from(request.sample_rate);
    let granted = f64::from(params.sample_rate);
    if (granted - requested).abs() > requested * RATE_TOLERANCE {
        return Err(BatError::Configuration(format!(
            "sample rate {} Hz not available, device offers {} Hz",
            request.sample_rate, params.sample_rate
        )));
    }
    if params.period_size == 0 {
        return Err(BatError::Configuration("device granted a zero period size".into()));
    }
    if params.period_size == params.buffer_size {
        return Err(BatError::Configuration(format!(
            "can't use period equal to buffer size ({} frames)",
            params.buffer_size
        )));
    }
    if params.frame_bits != frame_size * 8 {
        return Err(BatError::Device(format!(
            "device frame is {} bits, expected {}",
            params.frame_bits,
            frame_size * 8
        )));
    }
    Ok(())
}
