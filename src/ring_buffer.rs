//! Lock-free pre-roll buffer
//!
//! Holds the last `capacity` frames written by the capture thread so that an
//! episode can replay the audio that preceded the trigger. One writer, one
//! reader, no locks: samples live in an arena of atomics and a single cursor
//! counts the frames written so far.

use crate::events::AudioFrame;
use std::sync::atomic::{AtomicI16, AtomicU64, Ordering};

pub struct PrerollBuffer {
    arena: Box<[AtomicI16]>,
    frame_len: usize,
    capacity: usize,
    /// Total frames ever written; the next slot is `cursor % capacity`
    cursor: AtomicU64,
}

impl PrerollBuffer {
    pub fn new(capacity: usize, frame_len: usize) -> Self {
        let arena = (0..capacity * frame_len)
            .map(|_| AtomicI16::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            arena,
            frame_len,
            capacity,
            cursor: AtomicU64::new(0),
        }
    }

    /// Total frames written since creation.
    pub fn written(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    /// Store one frame, overwriting the oldest slot once full.
    ///
    /// Must only be called from the capture thread. Frames of the wrong
    /// length are truncated or zero-padded into the slot.
    pub fn write(&self, frame: &AudioFrame) {
        if self.capacity == 0 {
            return;
        }

        let index = self.cursor.load(Ordering::Relaxed);
        let start = (index % self.capacity as u64) as usize * self.frame_len;
        let slot = &self.arena[start..start + self.frame_len];

        for (i, cell) in slot.iter().enumerate() {
            let sample = frame.samples.get(i).copied().unwrap_or(0);
            cell.store(sample, Ordering::Relaxed);
        }

        self.cursor.store(index + 1, Ordering::Release);
    }

    /// Current cursor and capacity. Nothing is copied.
    pub fn snapshot(&self) -> (u64, usize) {
        (self.cursor.load(Ordering::Acquire), self.capacity)
    }

    /// Frames ending at `base`, oldest first.
    ///
    /// Yields `min(capacity, base)` frames. Each frame's sequence is its
    /// write index. If the writer laps the reader mid-drain, the frame at the
    /// wrap boundary may be torn.
    pub fn drain_oldest_to_newest(&self, base: u64) -> Drain<'_> {
        let count = base.min(self.capacity as u64);
        Drain {
            buffer: self,
            next: base - count,
            end: base,
        }
    }

    fn read_slot(&self, index: u64) -> AudioFrame {
        let start = (index % self.capacity as u64) as usize * self.frame_len;
        let samples = self.arena[start..start + self.frame_len]
            .iter()
            .map(|cell| cell.load(Ordering::Relaxed))
            .collect();
        AudioFrame::new(index, samples)
    }
}

/// Single-pass iterator returned by [`PrerollBuffer::drain_oldest_to_newest`].
pub struct Drain<'a> {
    buffer: &'a PrerollBuffer,
    next: u64,
    end: u64,
}

impl Iterator for Drain<'_> {
    type Item = AudioFrame;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next >= self.end {
            return None;
        }
        let frame = self.buffer.read_slot(self.next);
        self.next += 1;
        Some(frame)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.end - self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Drain<'_> {}
