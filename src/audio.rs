//! PulseAudio capture and playback
//!
//! Thin adapters over PulseAudio's simple API. Both directions use 16-bit
//! little-endian mono PCM at the pipeline sample rate. Each side must be
//! opened on the thread that uses it.

use crate::events::AudioFrame;
use crate::media_in::{FrameSource, FrameSourceError};
use crate::playback::{AudioSink, SinkError};
use libpulse_binding::error::PAErr;
use libpulse_binding::sample::{Format, Spec};
use libpulse_binding::stream::Direction;
use libpulse_simple_binding::Simple;
use std::time::Duration;
use tracing::info;

const APP_NAME: &str = "pollylive";

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("Invalid sample spec: {rate} Hz mono")]
    InvalidSpec { rate: u32 },

    #[error("PulseAudio error: {0}")]
    Pulse(#[from] PAErr),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Readable text for a PulseAudio error code.
///
/// `PAErr::to_string` is an inherent method returning `Option<String>`, so
/// go through our own `Display`.
fn describe(e: PAErr) -> String {
    AudioError::from(e).to_string()
}

fn spec(sample_rate: u32) -> Result<Spec> {
    let spec = Spec {
        format: Format::S16le,
        channels: 1,
        rate: sample_rate,
    };
    if !spec.is_valid() {
        return Err(AudioError::InvalidSpec { rate: sample_rate });
    }
    Ok(spec)
}

/// Microphone capture through the default (or a named) PulseAudio source.
pub struct PulseFrameSource {
    simple: Simple,
    bytes: Vec<u8>,
    sequence: u64,
}

impl PulseFrameSource {
    pub fn new(device: Option<&str>, sample_rate: u32, frame_length: usize) -> Result<Self> {
        let spec = spec(sample_rate)?;
        let simple = Simple::new(
            None, // default server
            APP_NAME,
            Direction::Record,
            device,
            "command capture",
            &spec,
            None, // default channel map
            None, // default buffering
        )?;

        info!(
            "Capturing from {} at {} Hz, {} samples per frame",
            device.unwrap_or("default source"),
            sample_rate,
            frame_length
        );

        Ok(Self {
            simple,
            bytes: vec![0u8; frame_length * 2],
            sequence: 0,
        })
    }
}

impl FrameSource for PulseFrameSource {
    /// The simple API has no read timeout; this blocks for one frame period.
    fn pull_frame(&mut self, _timeout: Duration) -> std::result::Result<AudioFrame, FrameSourceError> {
        self.simple
            .read(&mut self.bytes)
            .map_err(|e| FrameSourceError::Fault(describe(e)))?;

        let samples = self
            .bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        let frame = AudioFrame::new(self.sequence, samples);
        self.sequence += 1;
        Ok(frame)
    }
}

/// Speaker output through the default (or a named) PulseAudio sink.
pub struct PulseSink {
    simple: Simple,
}

impl PulseSink {
    pub fn new(device: Option<&str>, sample_rate: u32) -> Result<Self> {
        let spec = spec(sample_rate)?;
        let simple = Simple::new(
            None,
            APP_NAME,
            Direction::Playback,
            device,
            "response playback",
            &spec,
            None,
            None,
        )?;
        info!("Playing through {}", device.unwrap_or("default sink"));
        Ok(Self { simple })
    }
}

impl AudioSink for PulseSink {
    fn emit(&mut self, bytes: &[u8]) -> std::result::Result<(), SinkError> {
        self.simple
            .write(bytes)
            .map_err(|e| SinkError::Device(describe(e)))
    }

    fn finish(&mut self) -> std::result::Result<(), SinkError> {
        self.simple
            .drain()
            .map_err(|e| SinkError::Device(describe(e)))
    }
}
