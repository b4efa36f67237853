//! Trigger detection
//!
//! The trigger thread owns a [`TriggerClassifier`] and looks at every captured
//! frame while the session is `Idle`. In any other state the frame is handed
//! on to the streaming engine untouched. A match performs the one transition
//! this thread is allowed to make: `Idle -> Triggered`.

use crate::events::AudioFrame;
use crate::pipeline::PipelineStats;
use crate::session::{Actor, SessionState, SessionStateMachine};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Consecutive classifier faults tolerated before the session is failed
pub const MAX_CONSECUTIVE_FAULTS: u32 = 3;

/// WebRTC VAD analysis window
const VAD_WINDOW_MS: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier initialisation failed: {0}")]
    Init(String),

    #[error("Classifier wants {required}-sample frames, pipeline produces {configured}")]
    FrameLength { required: usize, configured: usize },

    #[error("Classifier fault: {0}")]
    Fault(String),
}

pub type Result<T> = std::result::Result<T, ClassifierError>;

/// Outcome of classifying one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    NoMatch,
    /// Index of the matched keyword (or profile) inside the classifier
    Match(usize),
}

/// Capability interface for a trigger model.
///
/// Construction is the init step and `Drop` is the destroy step. Instances
/// are created on the trigger thread and never leave it.
pub trait TriggerClassifier {
    /// Frame length the model requires, if it has one.
    fn frame_length(&self) -> Option<usize>;

    fn classify(&mut self, samples: &[i16]) -> Result<Classification>;

    /// Forget any state carried between frames.
    fn reset(&mut self);

    /// Detection happens elsewhere and needs the idle audio forwarded.
    fn streams_while_idle(&self) -> bool {
        false
    }
}

/// Builds the classifier on the thread that will use it.
pub type ClassifierFactory =
    Box<dyn FnOnce() -> Result<Box<dyn TriggerClassifier>> + Send + 'static>;

/// Runs a classifier against frames and fires the session transition.
pub struct TriggerEngine {
    classifier: Box<dyn TriggerClassifier>,
    session: SessionStateMachine,
    consecutive_faults: u32,
}

impl TriggerEngine {
    pub fn new(classifier: Box<dyn TriggerClassifier>, session: SessionStateMachine) -> Self {
        Self {
            classifier,
            session,
            consecutive_faults: 0,
        }
    }

    /// Classify one frame. Returns true when this frame started an episode.
    ///
    /// Does nothing unless the session is `Idle`.
    pub fn process(&mut self, frame: &AudioFrame) -> bool {
        if self.session.get() != SessionState::Idle {
            return false;
        }

        match self.classifier.classify(&frame.samples) {
            Ok(Classification::NoMatch) => {
                self.consecutive_faults = 0;
                false
            }
            Ok(Classification::Match(index)) => {
                self.consecutive_faults = 0;
                match self
                    .session
                    .compare_and_set(SessionState::Idle, SessionState::Triggered, Actor::Trigger)
                {
                    Ok(()) => {
                        info!("Trigger {} fired on frame {}", index, frame.sequence);
                        self.classifier.reset();
                        true
                    }
                    Err(e) => {
                        debug!("Trigger match ignored: {}", e);
                        false
                    }
                }
            }
            Err(e) => {
                self.consecutive_faults += 1;
                warn!(
                    "Classifier error on frame {} ({} in a row): {}",
                    frame.sequence, self.consecutive_faults, e
                );
                if self.consecutive_faults >= MAX_CONSECUTIVE_FAULTS {
                    self.session
                        .fail(Actor::Trigger, "classifier failed repeatedly");
                }
                false
            }
        }
    }
}

/// Body of the trigger thread.
///
/// Blocks on `frames_rx` until the capture side goes away. Frames that arrive
/// while the session is not `Idle` are forwarded to `outbound_tx` without
/// blocking; a full queue drops the frame.
pub fn run_trigger_loop(
    make_classifier: ClassifierFactory,
    frame_length: usize,
    session: SessionStateMachine,
    mut frames_rx: mpsc::Receiver<AudioFrame>,
    outbound_tx: mpsc::Sender<AudioFrame>,
    stats: Arc<PipelineStats>,
) {
    let classifier = match make_classifier() {
        Ok(classifier) => classifier,
        Err(e) => {
            error!("Failed to create trigger classifier: {}", e);
            session.fail(Actor::Trigger, "classifier initialisation failed");
            return;
        }
    };

    if let Some(required) = classifier.frame_length() {
        if required != frame_length {
            let e = ClassifierError::FrameLength {
                required,
                configured: frame_length,
            };
            error!("{}", e);
            session.fail(Actor::Trigger, "classifier frame length mismatch");
            return;
        }
    }

    let stream_idle = classifier.streams_while_idle();
    let mut engine = TriggerEngine::new(classifier, session.clone());
    info!("Trigger thread started (idle streaming: {})", stream_idle);

    while let Some(frame) = frames_rx.blocking_recv() {
        if session.get() == SessionState::Idle {
            engine.process(&frame);
            if !stream_idle {
                continue;
            }
        }

        match outbound_tx.try_send(frame) {
            Ok(()) => {
                stats.frames_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            Err(TrySendError::Full(frame)) => {
                stats.dropped_outbound.fetch_add(1, Ordering::Relaxed);
                debug!("Outbound queue full, dropped frame {}", frame.sequence);
            }
            Err(TrySendError::Closed(_)) => {
                info!("Outbound queue closed, trigger thread exiting");
                break;
            }
        }
    }

    info!("Trigger thread stopped");
}

/// Local trigger built on WebRTC voice activity detection.
///
/// Fires once a continuous run of voiced 10 ms windows reaches the required
/// length. Higher sensitivity means a less aggressive VAD and a shorter run.
pub struct VadTrigger {
    vad: Vad,
    sample_rate: u32,
    sensitivity: f32,
    window: usize,
    required_windows: usize,
    voiced_windows: usize,
    /// Samples left over from the previous frame
    pending: Vec<i16>,
}

impl VadTrigger {
    pub fn new(sample_rate: u32, sensitivity: f32) -> Result<Self> {
        let vad = Self::build_vad(sample_rate, sensitivity)?;
        let window = sample_rate as usize * VAD_WINDOW_MS / 1000;
        let run_ms = 600.0 - 400.0 * sensitivity.clamp(0.0, 1.0);
        let required_windows = ((run_ms as usize) / VAD_WINDOW_MS).max(1);

        debug!(
            "VAD trigger: {} Hz, sensitivity {:.2}, {} voiced windows required",
            sample_rate, sensitivity, required_windows
        );

        Ok(Self {
            vad,
            sample_rate,
            sensitivity,
            window,
            required_windows,
            voiced_windows: 0,
            pending: Vec::with_capacity(window * 2),
        })
    }

    pub fn required_windows(&self) -> usize {
        self.required_windows
    }

    fn build_vad(sample_rate: u32, sensitivity: f32) -> Result<Vad> {
        let rate = match sample_rate {
            8_000 => SampleRate::Rate8kHz,
            16_000 => SampleRate::Rate16kHz,
            32_000 => SampleRate::Rate32kHz,
            48_000 => SampleRate::Rate48kHz,
            other => {
                return Err(ClassifierError::Init(format!(
                    "WebRTC VAD does not support {} Hz",
                    other
                )))
            }
        };
        let mode = if sensitivity >= 0.75 {
            VadMode::Quality
        } else if sensitivity >= 0.5 {
            VadMode::LowBitrate
        } else if sensitivity >= 0.25 {
            VadMode::Aggressive
        } else {
            VadMode::VeryAggressive
        };
        Ok(Vad::new_with_rate_and_mode(rate, mode))
    }
}

impl TriggerClassifier for VadTrigger {
    fn frame_length(&self) -> Option<usize> {
        None
    }

    fn classify(&mut self, samples: &[i16]) -> Result<Classification> {
        self.pending.extend_from_slice(samples);

        let mut consumed = 0;
        let mut fired = false;
        let mut fault = None;
        for chunk in self.pending.chunks_exact(self.window) {
            consumed += self.window;
            match self.vad.is_voice_segment(chunk) {
                Ok(true) => self.voiced_windows += 1,
                Ok(false) => self.voiced_windows = 0,
                Err(()) => {
                    fault = Some(ClassifierError::Fault(format!(
                        "VAD rejected a {}-sample window",
                        chunk.len()
                    )));
                    break;
                }
            }
            if self.voiced_windows >= self.required_windows {
                fired = true;
            }
        }
        self.pending.drain(..consumed);

        if let Some(e) = fault {
            self.voiced_windows = 0;
            return Err(e);
        }
        if fired {
            self.voiced_windows = 0;
            Ok(Classification::Match(0))
        } else {
            Ok(Classification::NoMatch)
        }
    }

    fn reset(&mut self) {
        self.voiced_windows = 0;
        self.pending.clear();
        // Fresh detector; the old one carries adaptive noise estimates
        if let Ok(vad) = Self::build_vad(self.sample_rate, self.sensitivity) {
            self.vad = vad;
        }
    }
}

/// Placeholder classifier for the server-side trigger profile.
///
/// Never matches locally. The server announces the trigger with
/// `wake_word_detected` and the engine calls [`RemoteTrigger::fire`].
#[derive(Debug, Default)]
pub struct RemoteTrigger;

impl RemoteTrigger {
    /// Start an episode on behalf of the remote detector.
    pub fn fire(session: &SessionStateMachine) -> bool {
        match session.compare_and_set(SessionState::Idle, SessionState::Triggered, Actor::Trigger) {
            Ok(()) => {
                info!("Remote trigger fired");
                true
            }
            Err(e) => {
                debug!("Remote trigger ignored: {}", e);
                false
            }
        }
    }
}

impl TriggerClassifier for RemoteTrigger {
    fn frame_length(&self) -> Option<usize> {
        None
    }

    fn classify(&mut self, _samples: &[i16]) -> Result<Classification> {
        Ok(Classification::NoMatch)
    }

    fn reset(&mut self) {}

    fn streams_while_idle(&self) -> bool {
        true
    }
}
