//! Frames from a WAV file
//!
//! Used for replaying recorded commands through the pipeline. The file must
//! already be 16-bit mono at the pipeline sample rate; nothing is resampled.

use super::{FrameSource, FrameSourceError, Result};
use crate::events::AudioFrame;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::info;

pub struct WavFrameSource<R: Read = BufReader<File>> {
    reader: hound::WavReader<R>,
    frame_length: usize,
    /// Sleep between frames to mimic a live microphone
    frame_period: Option<Duration>,
    next_due: Option<Instant>,
    sequence: u64,
    done: bool,
}

impl WavFrameSource<BufReader<File>> {
    pub fn open(path: &Path, sample_rate: u32, frame_length: usize, realtime: bool) -> Result<Self> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| FrameSourceError::Fault(format!("{}: {}", path.display(), e)))?;
        info!(
            "Replaying {} ({} samples)",
            path.display(),
            reader.duration()
        );
        Self::from_reader(reader, sample_rate, frame_length, realtime)
    }
}

impl<R: Read> WavFrameSource<R> {
    pub fn from_reader(
        reader: hound::WavReader<R>,
        sample_rate: u32,
        frame_length: usize,
        realtime: bool,
    ) -> Result<Self> {
        let spec = reader.spec();
        if spec.channels != 1
            || spec.bits_per_sample != 16
            || spec.sample_format != hound::SampleFormat::Int
        {
            return Err(FrameSourceError::Fault(format!(
                "expected 16-bit mono PCM, got {} channel(s) of {}-bit {:?}",
                spec.channels, spec.bits_per_sample, spec.sample_format
            )));
        }
        if spec.sample_rate != sample_rate {
            return Err(FrameSourceError::Fault(format!(
                "file is {} Hz, pipeline runs at {} Hz",
                spec.sample_rate, sample_rate
            )));
        }

        let frame_period = realtime.then(|| {
            Duration::from_micros(frame_length as u64 * 1_000_000 / sample_rate as u64)
        });

        Ok(Self {
            reader,
            frame_length,
            frame_period,
            next_due: None,
            sequence: 0,
            done: false,
        })
    }
}

impl<R: Read> FrameSource for WavFrameSource<R> {
    fn pull_frame(&mut self, _timeout: Duration) -> Result<AudioFrame> {
        if self.done {
            return Err(FrameSourceError::Exhausted);
        }

        if let Some(period) = self.frame_period {
            let now = Instant::now();
            let due = self.next_due.unwrap_or(now);
            if due > now {
                std::thread::sleep(due - now);
            }
            self.next_due = Some(due + period);
        }

        let mut samples = Vec::with_capacity(self.frame_length);
        for sample in self.reader.samples::<i16>().take(self.frame_length) {
            samples.push(sample.map_err(|e| FrameSourceError::Fault(e.to_string()))?);
        }

        if samples.is_empty() {
            self.done = true;
            return Err(FrameSourceError::Exhausted);
        }
        if samples.len() < self.frame_length {
            // Short tail: pad the last frame with silence
            samples.resize(self.frame_length, 0);
            self.done = true;
        }

        let frame = AudioFrame::new(self.sequence, samples);
        self.sequence += 1;
        Ok(frame)
    }
}
