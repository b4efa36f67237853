//! Audio input
//!
//! A [`FrameSource`] yields fixed-size PCM frames at a fixed rate. The capture
//! thread pulls from it, writes every frame into the pre-roll buffer and hands
//! a copy to the trigger thread.

pub mod capture;
pub mod wav;

pub use capture::run_capture_loop;
pub use wav::WavFrameSource;

use crate::events::AudioFrame;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum FrameSourceError {
    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Frame source fault: {0}")]
    Fault(String),

    /// Finite sources (files) only
    #[error("Frame source exhausted")]
    Exhausted,
}

pub type Result<T> = std::result::Result<T, FrameSourceError>;

/// Blocking pull interface over a capture device or file.
pub trait FrameSource {
    /// Wait up to `timeout` for the next frame.
    fn pull_frame(&mut self, timeout: Duration) -> Result<AudioFrame>;
}

/// Opens the source on the capture thread.
pub type FrameSourceFactory = Box<dyn FnOnce() -> Result<Box<dyn FrameSource>> + Send + 'static>;
