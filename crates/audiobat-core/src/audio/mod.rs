//! Audio processing module
//!
//! This module contains all audio-related functionality including:
//! - Sine test signal generation ([`signal`])
//! - PCM device contract and xrun recovery ([`pcm`])
//! - In-memory loopback driver ([`loopback`])
//! - Sound card driver over cpal ([`hardware`], feature `hardware`)
//! - RIFF/WAVE container codec ([`wav`])
//! - Producer/Consumer frame pipeline ([`pipeline`])
//! - FFT peak detection ([`analyzer`])
//! - Phase-aligned SNR estimation ([`noise`])
//! - Round-trip latency measurement ([`latency`])

pub mod analyzer;
#[cfg(feature = "hardware")]
pub mod hardware;
pub mod latency;
pub mod loopback;
pub mod noise;
pub mod pcm;
pub mod pipeline;
pub mod signal;
pub mod wav;
