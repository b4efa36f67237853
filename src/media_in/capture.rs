//! Capture thread

use super::{FrameSourceError, FrameSourceFactory};
use crate::events::AudioFrame;
use crate::pipeline::PipelineStats;
use crate::ring_buffer::PrerollBuffer;
use crate::session::{Actor, SessionStateMachine};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Pull frames until stopped, the source ends, or the trigger side goes away.
///
/// Never blocks on anything but the source: the pre-roll write is atomics
/// only and the trigger handoff drops the frame when the queue is full.
/// Frames are renumbered so that a frame's sequence equals its pre-roll
/// write index.
pub fn run_capture_loop(
    make_source: FrameSourceFactory,
    pull_timeout: Duration,
    preroll: Arc<PrerollBuffer>,
    frames_tx: mpsc::Sender<AudioFrame>,
    session: SessionStateMachine,
    stats: Arc<PipelineStats>,
    running: Arc<AtomicBool>,
) {
    let mut source = match make_source() {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open frame source: {}", e);
            session.fail(Actor::External, "frame source unavailable");
            return;
        }
    };
    info!("Capture thread started");

    let mut sequence = 0u64;
    while running.load(Ordering::Relaxed) {
        let mut frame = match source.pull_frame(pull_timeout) {
            Ok(frame) => frame,
            Err(FrameSourceError::Timeout) => {
                debug!("No frame within {:?}", pull_timeout);
                continue;
            }
            Err(FrameSourceError::Fault(e)) => {
                warn!("Frame source fault, skipping tick: {}", e);
                std::thread::sleep(pull_timeout);
                continue;
            }
            Err(FrameSourceError::Exhausted) => {
                info!("Frame source exhausted after {} frames", sequence);
                break;
            }
        };

        frame.sequence = sequence;
        sequence += 1;
        preroll.write(&frame);
        stats.frames_captured.fetch_add(1, Ordering::Relaxed);

        match frames_tx.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => {
                stats.dropped_trigger.fetch_add(1, Ordering::Relaxed);
                debug!("Trigger queue full, dropped frame {}", frame.sequence);
            }
            Err(TrySendError::Closed(_)) => {
                info!("Trigger queue closed, capture thread exiting");
                break;
            }
        }
    }

    info!("Capture thread stopped");
}
