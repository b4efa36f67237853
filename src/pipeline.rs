//! Task wiring
//!
//! ```text
//! FrameSource -> [capture thread] -> PrerollBuffer
//!                       | try_send (trigger queue)
//!                 [trigger thread] -- classifies while Idle
//!                       | try_send (outbound queue)
//!              [streaming engine task] <-> Connection / TransportEvents
//!                       | completed responses, status cues
//!                 [playback thread] -> AudioSink(s)
//! ```
//!
//! Capture, trigger and playback run on OS threads because their
//! collaborators block. The engine is a tokio task.

use crate::audio::PulseSink;
use crate::config::{Config, ConfigError, TriggerMode};
use crate::engine::{Connection, StreamingEngine};
use crate::events::{EpisodeControl, PlaybackEvent, TransportEvent};
use crate::media_in::{self, FrameSourceFactory};
use crate::playback::{self, AudioSink, PlaybackRequest, SinkError, SinkFactory, WavFileSink};
use crate::ring_buffer::PrerollBuffer;
use crate::session::SessionStateMachine;
use crate::trigger::{self, ClassifierFactory, RemoteTrigger, TriggerClassifier, VadTrigger};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn {name} thread: {source}")]
    Spawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// One response plus a wake cue and an error cue.
const PLAYBACK_QUEUE: usize = 4;

/// Counters shared by every stage.
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub frames_captured: AtomicU64,
    /// Dropped at the capture -> trigger handoff
    pub dropped_trigger: AtomicU64,
    pub frames_forwarded: AtomicU64,
    /// Dropped at the trigger -> engine handoff
    pub dropped_outbound: AtomicU64,
    pub frames_sent: AtomicU64,
    pub send_failures: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub response_overflow_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_captured: u64,
    pub dropped_trigger: u64,
    pub frames_forwarded: u64,
    pub dropped_outbound: u64,
    pub frames_sent: u64,
    pub send_failures: u64,
    pub protocol_errors: u64,
    pub response_overflow_bytes: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            dropped_trigger: self.dropped_trigger.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            dropped_outbound: self.dropped_outbound.load(Ordering::Relaxed),
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            response_overflow_bytes: self.response_overflow_bytes.load(Ordering::Relaxed),
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "captured={} dropped@trigger={} forwarded={} dropped@outbound={} sent={} send_failures={} protocol_errors={} overflow_bytes={}",
            self.frames_captured,
            self.dropped_trigger,
            self.frames_forwarded,
            self.dropped_outbound,
            self.frames_sent,
            self.send_failures,
            self.protocol_errors,
            self.response_overflow_bytes
        )
    }
}

/// Device-specific collaborators, each built on its own thread.
pub struct PipelineParts {
    pub source: FrameSourceFactory,
    pub classifier: ClassifierFactory,
    pub sinks: SinkFactory,
}

/// Classifier for the configured trigger profile.
pub fn classifier_factory(config: &Config) -> ClassifierFactory {
    match config.trigger_mode {
        TriggerMode::Local => {
            let sample_rate = config.sample_rate;
            let sensitivity = config.trigger_sensitivity;
            Box::new(move || {
                VadTrigger::new(sample_rate, sensitivity)
                    .map(|vad| Box::new(vad) as Box<dyn TriggerClassifier>)
            })
        }
        TriggerMode::Remote => Box::new(|| Ok(Box::new(RemoteTrigger) as Box<dyn TriggerClassifier>)),
    }
}

/// PulseAudio output (if `speaker`) plus a WAV recorder when configured.
pub fn sink_factory(config: &Config, speaker: bool) -> SinkFactory {
    let sample_rate = config.sample_rate;
    let record_dir = config.record_responses_dir.clone();
    Box::new(move || -> std::result::Result<Vec<Box<dyn AudioSink>>, SinkError> {
        let mut sinks: Vec<Box<dyn AudioSink>> = Vec::new();
        if speaker {
            let sink = PulseSink::new(None, sample_rate)
                .map_err(|e| SinkError::Device(e.to_string()))?;
            sinks.push(Box::new(sink));
        }
        if let Some(dir) = record_dir {
            sinks.push(Box::new(WavFileSink::new(&dir, sample_rate)?));
        }
        Ok(sinks)
    })
}

/// Running pipeline.
pub struct PipelineHandle {
    session: SessionStateMachine,
    stats: Arc<PipelineStats>,
    control_tx: mpsc::Sender<EpisodeControl>,
    running: Arc<AtomicBool>,
    shutdown_tx: watch::Sender<bool>,
    engine: JoinHandle<()>,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn session(&self) -> &SessionStateMachine {
        &self.session
    }

    pub fn stats(&self) -> &Arc<PipelineStats> {
        &self.stats
    }

    /// Channel for stopping the current episode early.
    pub fn control(&self) -> mpsc::Sender<EpisodeControl> {
        self.control_tx.clone()
    }

    /// Receiver that flips to `true` when the pipeline stops.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every task and wait for them.
    pub async fn stop(self) {
        info!("Stopping pipeline");
        self.running.store(false, Ordering::Relaxed);
        let _ = self.shutdown_tx.send(true);

        if let Err(e) = self.engine.await {
            warn!("Streaming engine task failed: {}", e);
        }

        let threads = self.threads;
        let joined = tokio::task::spawn_blocking(move || {
            for thread in threads {
                let name = thread.thread().name().unwrap_or("worker").to_string();
                if thread.join().is_err() {
                    warn!("{} thread panicked", name);
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Failed to join pipeline threads");
        }
        info!("Pipeline stopped: {}", self.stats.snapshot());
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Start all tasks. Must be called inside a tokio runtime.
    ///
    /// `conn` and `inbound_rx` are the two halves of the transport; the
    /// caller owns the transport task itself.
    pub fn spawn<C>(
        config: Config,
        conn: C,
        inbound_rx: mpsc::Receiver<TransportEvent>,
        parts: PipelineParts,
    ) -> Result<PipelineHandle>
    where
        C: Connection + Send + 'static,
    {
        config.validate()?;

        let session = SessionStateMachine::new();
        let stats = Arc::new(PipelineStats::default());
        let preroll = Arc::new(PrerollBuffer::new(config.preroll_frames(), config.frame_length));
        let running = Arc::new(AtomicBool::new(true));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (frames_tx, frames_rx) = mpsc::channel(config.trigger_queue_frames);
        let (outbound_tx, outbound_rx) = mpsc::channel(config.outbound_queue_frames);
        let (playback_tx, playback_rx) = mpsc::channel::<PlaybackRequest>(PLAYBACK_QUEUE);
        let (playback_events_tx, playback_events_rx) = mpsc::channel::<PlaybackEvent>(1);
        let (control_tx, control_rx) = mpsc::channel(4);

        info!(
            "Starting pipeline: {} Hz, {}-sample frames, {} pre-roll frames, {} live frames max, {:?} trigger",
            config.sample_rate,
            config.frame_length,
            config.preroll_frames(),
            config.max_command_frames(),
            config.trigger_mode
        );

        let mut threads = Vec::new();

        let PipelineParts {
            source,
            classifier,
            sinks,
        } = parts;

        threads.push(spawn_thread("playback", {
            let sample_rate = config.sample_rate;
            let chunk_bytes = config.playback_chunk_bytes;
            move || {
                playback::run_playback_loop(sinks, sample_rate, chunk_bytes, playback_rx, playback_events_tx)
            }
        })?);

        threads.push(spawn_thread("trigger", {
            let frame_length = config.frame_length;
            let session = session.clone();
            let stats = stats.clone();
            move || {
                trigger::run_trigger_loop(classifier, frame_length, session, frames_rx, outbound_tx, stats)
            }
        })?);

        threads.push(spawn_thread("capture", {
            let timeout = config.frame_stall_timeout();
            let preroll = preroll.clone();
            let session = session.clone();
            let stats = stats.clone();
            let running = running.clone();
            move || {
                media_in::run_capture_loop(source, timeout, preroll, frames_tx, session, stats, running)
            }
        })?);

        let engine = StreamingEngine::new(
            &config,
            conn,
            session.clone(),
            preroll,
            stats.clone(),
            playback_tx,
        );
        let engine = tokio::spawn(engine.run(
            inbound_rx,
            outbound_rx,
            playback_events_rx,
            control_rx,
            shutdown_rx,
        ));

        Ok(PipelineHandle {
            session,
            stats,
            control_tx,
            running,
            shutdown_tx,
            engine,
            threads,
        })
    }
}

fn spawn_thread<F>(name: &'static str, body: F) -> Result<std::thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(|source| PipelineError::Spawn { name, source })
}
