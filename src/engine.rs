//! Streaming protocol engine
//!
//! Owns the device side of the conversation with the server. It runs as one
//! tokio task and reacts to five inputs:
//!
//! - transport events (link up/down, inbound fragments and binary audio)
//! - session changes (a trigger moved the session to `Triggered`)
//! - live frames forwarded by the trigger thread
//! - playback completion
//! - episode control (external stop)
//!
//! An episode is always `WakeDetected`, the pre-roll oldest to newest, live
//! frames up to the cap, then `CommandEnd`. Inbound audio accumulates until
//! the final chunk and is then handed to the playback thread.
//!
//! In the remote trigger profile the server does the detection, so live
//! frames are streamed while `Idle` too and the pre-roll is never replayed.
//! Streaming pauses while a response is awaited or played.

use crate::config::{AudioEncoding, Config, TriggerMode};
use crate::events::{AudioFrame, EpisodeControl, PlaybackEvent, TransportEvent};
use crate::pipeline::PipelineStats;
use crate::playback::{PlaybackError, PlaybackRequest, ResponseAudioBuffer, StatusCue};
use crate::protocol::{self, OutgoingEvent, ProtocolMessage, WireMessage};
use crate::reassembly::{ReassemblyError, Reassembler};
use crate::ring_buffer::PrerollBuffer;
use crate::session::{Actor, SessionState, SessionStateMachine};
use crate::trigger::RemoteTrigger;
use std::sync::atomic::Ordering;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Outbound queue full")]
    QueueFull,

    #[error("Connection closed")]
    Closed,
}

/// Outbound half of the link to the server.
pub trait Connection {
    /// Queue one message. Never blocks; a failed send is not retried.
    fn send(&self, message: WireMessage) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

#[derive(Debug)]
struct Episode {
    id: u64,
    /// Pre-roll snapshot cursor; live frames before it were already sent
    base: u64,
    preroll_sent: usize,
    live_sent: usize,
    started: Instant,
}

pub struct StreamingEngine<C: Connection> {
    conn: C,
    session: SessionStateMachine,
    preroll: Arc<PrerollBuffer>,
    stats: Arc<PipelineStats>,
    playback_tx: mpsc::Sender<PlaybackRequest>,
    frames_rx: Option<mpsc::Receiver<AudioFrame>>,
    /// Live frames that arrived while the pre-roll was being paced out
    held: VecDeque<AudioFrame>,

    device_id: String,
    encoding: AudioEncoding,
    remote_trigger: bool,
    status_cues: bool,
    max_live_frames: usize,
    preroll_pacing: Duration,
    stall_timeout: Duration,
    keepalive_interval: Duration,
    response_warn_after: Duration,

    reassembler: Reassembler,
    response: ResponseAudioBuffer,
    started: Instant,
    episode: Option<Episode>,
    episodes: u64,
    /// A `response` event arrived; audio should follow
    playback_pending: bool,
    awaiting_since: Option<Instant>,
    response_warned: bool,
    /// Link dropped since the last `connected` ack
    resync_pending: bool,
}

impl<C: Connection> StreamingEngine<C> {
    pub fn new(
        config: &Config,
        conn: C,
        session: SessionStateMachine,
        preroll: Arc<PrerollBuffer>,
        stats: Arc<PipelineStats>,
        playback_tx: mpsc::Sender<PlaybackRequest>,
    ) -> Self {
        Self {
            conn,
            session,
            preroll,
            stats,
            playback_tx,
            frames_rx: None,
            held: VecDeque::new(),
            device_id: config.device_id.clone(),
            encoding: config.audio_encoding,
            remote_trigger: config.trigger_mode == TriggerMode::Remote,
            status_cues: config.status_cues,
            max_live_frames: config.max_command_frames(),
            preroll_pacing: config.preroll_pacing(),
            stall_timeout: config.frame_stall_timeout(),
            keepalive_interval: config.keepalive_interval(),
            response_warn_after: config.response_warn_after(),
            reassembler: Reassembler::new(config.reassembly_capacity),
            response: ResponseAudioBuffer::new(config.response_audio_capacity),
            started: Instant::now(),
            episode: None,
            episodes: 0,
            playback_pending: false,
            awaiting_since: None,
            response_warned: false,
            resync_pending: false,
        }
    }

    /// Response bytes collected so far in this episode.
    pub fn response_audio(&self) -> &ResponseAudioBuffer {
        &self.response
    }

    pub fn in_episode(&self) -> bool {
        self.episode.is_some()
    }

    pub fn playback_pending(&self) -> bool {
        self.playback_pending
    }

    pub fn reassembly_is_empty(&self) -> bool {
        self.reassembler.is_empty()
    }

    /// Main loop. Returns when shutdown is signalled or the transport goes away.
    pub async fn run(
        mut self,
        mut inbound_rx: mpsc::Receiver<TransportEvent>,
        frames_rx: mpsc::Receiver<AudioFrame>,
        mut playback_rx: mpsc::Receiver<PlaybackEvent>,
        mut control_rx: mpsc::Receiver<EpisodeControl>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut session_rx = self.session.subscribe();
        let mut keepalive = tokio::time::interval_at(
            tokio::time::Instant::now() + self.keepalive_interval,
            self.keepalive_interval,
        );
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.frames_rx = Some(frames_rx);

        info!("Streaming engine started");

        let mut frames_open = true;
        let mut playback_open = true;
        let mut control_open = true;
        loop {
            let in_episode = self.episode.is_some();
            let stall = self.stall_timeout;

            tokio::select! {
                event = inbound_rx.recv() => match event {
                    Some(event) => self.handle_transport_event(event),
                    None => {
                        info!("Transport closed");
                        break;
                    }
                },

                changed = session_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *session_rx.borrow_and_update();
                    self.on_session_change(state).await;
                }

                frame = next_frame(&mut self.frames_rx), if frames_open => match frame {
                    Some(frame) => self.on_live_frame(frame),
                    None => {
                        // Finite sources end; a pending response is still served
                        info!("Frame queue closed");
                        frames_open = false;
                        self.finish_episode();
                    }
                },

                _ = tokio::time::sleep(stall), if in_episode => {
                    debug!("No live frame for {:?}", stall);
                }

                _ = keepalive.tick() => self.on_keepalive_tick(),

                event = playback_rx.recv(), if playback_open => match event {
                    Some(event) => self.on_playback_finished(event),
                    None => {
                        warn!("Playback thread gone");
                        playback_open = false;
                    }
                },

                control = control_rx.recv(), if control_open => match control {
                    Some(control) => self.on_control(control),
                    None => control_open = false,
                },

                _ = shutdown.changed() => {
                    info!("Streaming engine shutting down");
                    break;
                }
            }
        }

        if self.episode.is_some() {
            self.finish_episode();
        }
        info!("Streaming engine stopped after {} episode(s)", self.episodes);
    }

    /// React to a session change observed on the watch channel.
    pub async fn on_session_change(&mut self, state: SessionState) {
        match state {
            SessionState::Triggered if self.episode.is_none() => {
                self.play_cue(StatusCue::Wake);
                self.begin_episode().await;
            }
            SessionState::Triggered => {}
            _ if self.episode.is_some() => {
                warn!("Session left triggered mid-episode ({})", state);
                self.finish_episode();
            }
            _ => {}
        }
        if state == SessionState::Error {
            self.play_cue(StatusCue::Error);
        }
    }

    fn play_cue(&self, cue: StatusCue) {
        if !self.status_cues {
            return;
        }
        if let Err(e) = self.playback_tx.try_send(PlaybackRequest::Cue(cue)) {
            debug!("Skipped {:?} cue: {}", cue, e);
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected => {
                info!("Transport connected, registering as {}", self.device_id);
                let connect = OutgoingEvent::Connect {
                    device_id: self.device_id.clone(),
                };
                self.send_event(&connect);
            }
            TransportEvent::Disconnected => {
                warn!("Transport disconnected in state {}", self.session.get());
                self.reassembler.clear();
                self.response.reset();
                self.playback_pending = false;
                self.awaiting_since = None;
                self.response_warned = false;
                if let Some(episode) = self.episode.take() {
                    warn!(
                        "Episode {} abandoned after {} live frame(s)",
                        episode.id, episode.live_sent
                    );
                }
                self.resync_pending = true;
            }
            TransportEvent::Fragment(fragment) => match self.reassembler.push(fragment) {
                Ok(Some(message)) => self.handle_text(&message),
                Ok(None) => {}
                Err(e @ ReassemblyError::Abandoned { .. }) => {
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("{}", e);
                }
                Err(e) => {
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Discarded inbound message: {}", e);
                }
            },
            TransportEvent::Binary(bytes) => {
                self.handle_message(protocol::decode_binary(bytes));
            }
        }
    }

    fn handle_text(&mut self, bytes: &[u8]) {
        match protocol::decode_text(bytes) {
            Ok(Some(message)) => self.handle_message(message),
            Ok(None) => {}
            Err(e) => {
                self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Dropped malformed message: {}", e);
            }
        }
    }

    fn handle_message(&mut self, message: ProtocolMessage) {
        match message {
            ProtocolMessage::Connected { message } => {
                info!(
                    "Server acknowledged connection: {}",
                    message.as_deref().unwrap_or("")
                );
                self.on_server_connected();
            }

            ProtocolMessage::WakeAck => debug!("Server acknowledged wake"),

            ProtocolMessage::WakeWordDetected => {
                if self.remote_trigger {
                    RemoteTrigger::fire(&self.session);
                } else {
                    debug!("Ignoring server wake_word_detected in local trigger profile");
                }
            }

            ProtocolMessage::Response {
                text,
                transcription,
                intent,
            } => {
                if let Some(transcription) = transcription {
                    info!("Heard: {}", transcription);
                }
                if let Some(text) = text {
                    info!("Response: {}", text);
                }
                if let Some(intent) = intent {
                    debug!("Intent: {}", intent);
                }
                self.playback_pending = true;
            }

            ProtocolMessage::AudioChunk { payload, is_final } => {
                self.on_audio_chunk(&payload, is_final);
            }

            ProtocolMessage::Pong => debug!("Pong"),

            ProtocolMessage::Error { message } => {
                let message = message.unwrap_or_default();
                warn!("Server error: {}", message);
                if self.session.get() == SessionState::AwaitingResponse {
                    // No audio will follow
                    self.response.reset();
                    self.end_response(SessionState::Idle);
                }
            }
        }
    }

    fn on_server_connected(&mut self) {
        let resync = std::mem::take(&mut self.resync_pending);

        match self.session.get() {
            SessionState::Connecting => {
                self.transition(SessionState::Connecting, SessionState::Idle);
            }
            SessionState::Triggered if resync && self.episode.is_none() => {
                info!("Closing episode abandoned by the disconnect");
                if self.transition(SessionState::Triggered, SessionState::AwaitingResponse) {
                    self.transition(SessionState::AwaitingResponse, SessionState::Idle);
                }
            }
            SessionState::AwaitingResponse if resync && self.response.is_empty() => {
                info!("Giving up on the response lost with the disconnect");
                self.end_response(SessionState::Idle);
            }
            _ => {}
        }
    }

    fn on_audio_chunk(&mut self, payload: &[u8], is_final: bool) {
        if self.session.get() != SessionState::AwaitingResponse {
            debug!(
                "Discarding {} byte(s) of response audio in state {}",
                payload.len(),
                self.session.get()
            );
            return;
        }

        if let Err(PlaybackError::Overflow { dropped }) = self.response.append(payload) {
            self.stats
                .response_overflow_bytes
                .fetch_add(dropped as u64, Ordering::Relaxed);
            warn!("Response audio buffer full, dropped {} byte(s)", dropped);
        }

        if !is_final {
            return;
        }

        if self.response.is_empty() {
            info!("Response carried no audio");
            self.end_response(SessionState::Idle);
            return;
        }

        let audio = self.response.take_complete();
        let len = audio.len();
        if !self.end_response(SessionState::Playback) {
            return;
        }
        match self.playback_tx.try_send(PlaybackRequest::Response(audio)) {
            Ok(()) => info!("Handed {} byte(s) of response audio to playback", len),
            Err(e) => {
                error!("Playback unavailable, dropping response: {}", e);
                self.transition(SessionState::Playback, SessionState::Idle);
            }
        }
    }

    /// Leave `AwaitingResponse` for `next`.
    fn end_response(&mut self, next: SessionState) -> bool {
        self.awaiting_since = None;
        self.response_warned = false;
        self.playback_pending = false;
        self.transition(SessionState::AwaitingResponse, next)
    }

    /// Start an episode for a session that just became `Triggered`.
    pub async fn begin_episode(&mut self) {
        if self.episode.is_some() || self.session.get() != SessionState::Triggered {
            return;
        }

        self.episodes += 1;
        let id = self.episodes;

        if !self.conn.is_connected() {
            warn!("Episode {} triggered while offline, closing it", id);
            if self.transition(SessionState::Triggered, SessionState::AwaitingResponse) {
                self.transition(SessionState::AwaitingResponse, SessionState::Idle);
            }
            return;
        }

        // Remote detection: the server already has the history
        let base = if self.remote_trigger {
            0
        } else {
            self.preroll.snapshot().0
        };
        self.response.reset();
        self.playback_pending = false;
        self.episode = Some(Episode {
            id,
            base,
            preroll_sent: 0,
            live_sent: 0,
            started: Instant::now(),
        });

        let timestamp = self.started.elapsed().as_millis() as u64;
        info!("Episode {} started at {} ms", id, timestamp);
        self.send_event(&OutgoingEvent::WakeDetected { timestamp });

        let preroll = self.preroll.clone();
        let history = if self.remote_trigger {
            None
        } else {
            Some(preroll.drain_oldest_to_newest(base))
        }
        .into_iter()
        .flatten();
        let mut sent = 0;
        for frame in history {
            if self.session.get() != SessionState::Triggered {
                break;
            }
            if self.send_audio(&frame) {
                sent += 1;
            }
            if !self.preroll_pacing.is_zero() {
                tokio::time::sleep(self.preroll_pacing).await;
            }
            self.hold_arrived_frames();
        }

        match self.episode.as_mut() {
            Some(episode) => {
                episode.preroll_sent = sent;
                debug!("Episode {}: {} pre-roll frame(s) sent", id, sent);
            }
            // Link dropped during the pre-roll
            None => {
                self.held.clear();
                return;
            }
        }

        if self.session.get() != SessionState::Triggered {
            self.held.clear();
            self.finish_episode();
            return;
        }

        if !self.held.is_empty() {
            debug!("Episode {}: releasing {} held live frame(s)", id, self.held.len());
        }
        while let Some(frame) = self.held.pop_front() {
            self.on_live_frame(frame);
        }
    }

    /// Move queued live frames into `held` so the queue keeps room while the
    /// pre-roll is paced out.
    fn hold_arrived_frames(&mut self) {
        let Some(rx) = self.frames_rx.as_mut() else {
            return;
        };
        while let Ok(frame) = rx.try_recv() {
            self.held.push_back(frame);
        }
    }

    /// A frame forwarded by the trigger thread.
    pub fn on_live_frame(&mut self, frame: AudioFrame) {
        let Some(episode) = self.episode.as_ref() else {
            self.stream_idle_frame(&frame);
            return;
        };
        if frame.sequence < episode.base {
            // Already part of the pre-roll
            return;
        }
        if self.session.get() != SessionState::Triggered {
            self.finish_episode();
            return;
        }

        self.send_audio(&frame);

        let reached_cap = match self.episode.as_mut() {
            Some(episode) => {
                episode.live_sent += 1;
                episode.live_sent >= self.max_live_frames
            }
            None => false,
        };
        if reached_cap {
            debug!("Live frame cap of {} reached", self.max_live_frames);
            self.finish_episode();
        }
    }

    /// Remote profile: the server listens for the wake word in the idle stream.
    fn stream_idle_frame(&mut self, frame: &AudioFrame) {
        if self.remote_trigger
            && self.session.get() == SessionState::Idle
            && self.conn.is_connected()
        {
            self.send_audio(frame);
        }
    }

    /// Send `CommandEnd` and move to `AwaitingResponse`.
    pub fn finish_episode(&mut self) {
        let Some(episode) = self.episode.take() else {
            return;
        };

        self.send_event(&OutgoingEvent::CommandEnd);
        info!(
            "Episode {} sent {} pre-roll + {} live frame(s) in {:?}",
            episode.id,
            episode.preroll_sent,
            episode.live_sent,
            episode.started.elapsed()
        );

        if self.transition(SessionState::Triggered, SessionState::AwaitingResponse) {
            self.awaiting_since = Some(Instant::now());
            self.response_warned = false;
        }
    }

    pub fn on_control(&mut self, control: EpisodeControl) {
        match control {
            EpisodeControl::Stop => {
                if self.episode.is_some() {
                    info!("Episode stopped externally");
                    self.finish_episode();
                } else {
                    debug!("Stop requested with no episode running");
                }
            }
        }
    }

    pub fn on_keepalive_tick(&mut self) {
        if self.conn.is_connected() {
            self.send_event(&OutgoingEvent::Ping);
        }

        if let Some(since) = self.awaiting_since {
            let waited = since.elapsed();
            if waited > self.response_warn_after && !self.response_warned {
                warn!(
                    "Still waiting for a response after {:?} (response announced: {})",
                    waited, self.playback_pending
                );
                self.response_warned = true;
            }
        }
    }

    pub fn on_playback_finished(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Finished { bytes_played } => {
                debug!("Playback finished after {} byte(s)", bytes_played);
                self.response.reset();
                self.transition(SessionState::Playback, SessionState::Idle);
            }
        }
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        match self.session.compare_and_set(from, to, Actor::Engine) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}", e);
                false
            }
        }
    }

    fn send_audio(&mut self, frame: &AudioFrame) -> bool {
        let sent = self.send_event(&OutgoingEvent::AudioFrame(frame.to_le_bytes()));
        if sent {
            self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        }
        sent
    }

    fn send_event(&mut self, event: &OutgoingEvent) -> bool {
        let message = match event.encode(self.encoding) {
            Ok(message) => message,
            Err(e) => {
                error!("Failed to encode {}: {}", event.name(), e);
                return false;
            }
        };

        match self.conn.send(message) {
            Ok(()) => true,
            Err(e) => {
                self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                debug!("Dropped {}: {}", event.name(), e);
                false
            }
        }
    }
}

async fn next_frame(rx: &mut Option<mpsc::Receiver<AudioFrame>>) -> Option<AudioFrame> {
    match rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Fragment;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct MockConnection {
        sent: Arc<Mutex<Vec<WireMessage>>>,
        connected: Arc<AtomicBool>,
    }

    impl MockConnection {
        fn connected() -> Self {
            let conn = Self::default();
            conn.connected.store(true, Ordering::SeqCst);
            conn
        }

        fn events(&self) -> Vec<String> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .map(|m| match m {
                    WireMessage::Text(s) => {
                        let v: serde_json::Value = serde_json::from_str(s).unwrap();
                        v["event"].as_str().unwrap().to_string()
                    }
                    WireMessage::Binary(_) => "binary".to_string(),
                })
                .collect()
        }

        fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    impl Connection for MockConnection {
        fn send(&self, message: WireMessage) -> Result<(), TransportError> {
            if !self.connected.load(Ordering::SeqCst) {
                return Err(TransportError::NotConnected);
            }
            self.sent.lock().unwrap().push(message);
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
    }

    struct Harness {
        engine: StreamingEngine<MockConnection>,
        conn: MockConnection,
        session: SessionStateMachine,
        preroll: Arc<PrerollBuffer>,
        stats: Arc<PipelineStats>,
        playback_rx: mpsc::Receiver<PlaybackRequest>,
        config: Config,
    }

    fn test_config() -> Config {
        Config {
            frame_length: 160,
            preroll_secs: 1,
            max_command_secs: 2,
            preroll_pacing_ms: 0,
            status_cues: false,
            ..Config::default()
        }
    }

    fn harness(config: Config) -> Harness {
        let conn = MockConnection::connected();
        let session = SessionStateMachine::new();
        let preroll = Arc::new(PrerollBuffer::new(config.preroll_frames(), config.frame_length));
        let stats = Arc::new(PipelineStats::default());
        let (playback_tx, playback_rx) = mpsc::channel(4);
        let engine = StreamingEngine::new(
            &config,
            conn.clone(),
            session.clone(),
            preroll.clone(),
            stats.clone(),
            playback_tx,
        );
        Harness {
            engine,
            conn,
            session,
            preroll,
            stats,
            playback_rx,
            config,
        }
    }

    fn text(json: &str) -> TransportEvent {
        TransportEvent::Fragment(Fragment::whole(json.as_bytes().to_vec()))
    }

    fn frame(sequence: u64, len: usize) -> AudioFrame {
        AudioFrame::new(sequence, vec![sequence as i16; len])
    }

    impl Harness {
        fn go_idle(&mut self) {
            self.engine.handle_transport_event(TransportEvent::Connected);
            self.engine
                .handle_transport_event(text(r#"{"event":"connected","message":"hi"}"#));
            assert_eq!(self.session.get(), SessionState::Idle);
            self.conn.clear();
        }

        fn trigger(&self) {
            self.session
                .compare_and_set(SessionState::Idle, SessionState::Triggered, Actor::Trigger)
                .unwrap();
        }

        fn go_triggered(&mut self) {
            self.go_idle();
            self.trigger();
        }
    }

    #[tokio::test]
    async fn test_connect_handshake() {
        let mut h = harness(test_config());
        h.engine.handle_transport_event(TransportEvent::Connected);
        assert_eq!(h.conn.events(), vec!["connect"]);
        assert_eq!(h.session.get(), SessionState::Connecting);

        h.engine
            .handle_transport_event(text(r#"{"event":"connected","message":"Connected to Polly"}"#));
        assert_eq!(h.session.get(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_full_episode() {
        let mut h = harness(test_config());
        h.go_idle();

        let preroll_frames = h.config.preroll_frames();
        let max_live = h.config.max_command_frames();
        assert_eq!(preroll_frames, 100);
        assert_eq!(max_live, 200);

        // More history than the pre-roll holds
        for sequence in 0..150 {
            h.preroll.write(&frame(sequence, 160));
        }

        h.trigger();
        h.engine.on_session_change(SessionState::Triggered).await;
        assert!(h.engine.in_episode());

        // Stale frames from before the snapshot are skipped
        for sequence in 140..150 {
            h.engine.on_live_frame(frame(sequence, 160));
        }
        for sequence in 150..(150 + max_live as u64 + 20) {
            h.engine.on_live_frame(frame(sequence, 160));
        }

        assert!(!h.engine.in_episode());
        assert_eq!(h.session.get(), SessionState::AwaitingResponse);

        let sent = h.conn.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1 + preroll_frames + max_live + 1);

        let event = |m: &WireMessage| -> serde_json::Value {
            match m {
                WireMessage::Text(s) => serde_json::from_str(s).unwrap(),
                WireMessage::Binary(_) => panic!("expected text"),
            }
        };
        assert_eq!(event(&sent[0])["event"], "wake_word_detected");
        assert_eq!(event(sent.last().unwrap())["event"], "command_end");

        // Audio in capture order: pre-roll 50..150 then live 150..350
        let firsts: Vec<i16> = sent[1..sent.len() - 1]
            .iter()
            .map(|m| {
                let data = event(m)["data"].as_str().unwrap().to_string();
                let pcm = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, data)
                    .unwrap();
                assert_eq!(pcm.len(), 320);
                i16::from_le_bytes([pcm[0], pcm[1]])
            })
            .collect();
        let expected: Vec<i16> = (50..350).map(|s| s as i16).collect();
        assert_eq!(firsts, expected);
        assert_eq!(
            h.stats.frames_sent.load(Ordering::Relaxed),
            (preroll_frames + max_live) as u64
        );

        // Frames outside an episode are discarded
        h.conn.clear();
        h.engine.on_live_frame(frame(400, 160));
        assert!(h.conn.events().is_empty());
    }

    #[tokio::test]
    async fn test_binary_audio_encoding() {
        let mut config = test_config();
        config.audio_encoding = AudioEncoding::Binary;
        let mut h = harness(config);
        h.go_idle();
        h.preroll.write(&frame(0, 160));

        h.trigger();
        h.engine.begin_episode().await;
        h.engine.on_control(EpisodeControl::Stop);

        assert_eq!(h.conn.events(), vec!["wake_word_detected", "binary", "command_end"]);
        assert_eq!(h.session.get(), SessionState::AwaitingResponse);
    }

    #[tokio::test]
    async fn test_response_audio_then_playback() {
        let mut h = harness(test_config());
        h.go_triggered();
        h.engine.begin_episode().await;
        h.engine.on_control(EpisodeControl::Stop);
        assert_eq!(h.session.get(), SessionState::AwaitingResponse);

        h.engine.handle_transport_event(text(
            r#"{"event":"response","text":"ok","audio":null,"intent":null,"transcription":"hi"}"#,
        ));
        assert!(h.engine.playback_pending());

        // "AAA" then "BBB"
        h.engine
            .handle_transport_event(text(r#"{"event":"audio_chunk","audio":"QUFB","final":false}"#));
        assert_eq!(h.engine.response_audio().as_slice(), b"AAA");
        h.engine
            .handle_transport_event(text(r#"{"event":"audio_chunk","audio":"QkJC","final":true}"#));

        assert_eq!(h.session.get(), SessionState::Playback);
        assert_eq!(
            h.playback_rx.try_recv().unwrap(),
            PlaybackRequest::Response(b"AAABBB".to_vec())
        );
        assert!(h.engine.response_audio().is_empty());

        h.engine
            .on_playback_finished(PlaybackEvent::Finished { bytes_played: 6 });
        assert_eq!(h.session.get(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_binary_chunks_then_empty_final() {
        let mut h = harness(test_config());
        h.go_triggered();
        h.engine.begin_episode().await;
        h.engine.finish_episode();

        h.engine
            .handle_transport_event(TransportEvent::Binary(vec![1, 2, 3, 4]));
        h.engine
            .handle_transport_event(text(r#"{"event":"audio_chunk","audio":"","final":true}"#));

        assert_eq!(h.session.get(), SessionState::Playback);
        assert_eq!(
            h.playback_rx.try_recv().unwrap(),
            PlaybackRequest::Response(vec![1, 2, 3, 4])
        );
    }

    #[tokio::test]
    async fn test_no_audio_response_returns_to_idle() {
        let mut h = harness(test_config());
        h.go_triggered();
        h.engine.begin_episode().await;
        h.engine.finish_episode();

        h.engine
            .handle_transport_event(text(r#"{"event":"audio_chunk","audio":"","final":true}"#));
        assert_eq!(h.session.get(), SessionState::Idle);
        assert!(h.playback_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_server_error_while_awaiting() {
        let mut h = harness(test_config());
        h.go_triggered();
        h.engine.begin_episode().await;
        h.engine.finish_episode();

        h.engine
            .handle_transport_event(text(r#"{"event":"audio_chunk","audio":"QUFB","final":false}"#));
        h.engine
            .handle_transport_event(text(r#"{"event":"error","message":"tts failed"}"#));
        assert_eq!(h.session.get(), SessionState::Idle);
        assert!(h.engine.response_audio().is_empty());
    }

    #[tokio::test]
    async fn test_response_overflow_is_counted() {
        let mut config = test_config();
        config.response_audio_capacity = 4;
        let mut h = harness(config);
        h.go_triggered();
        h.engine.begin_episode().await;
        h.engine.finish_episode();

        h.engine
            .handle_transport_event(TransportEvent::Binary(vec![0; 10]));
        assert_eq!(h.engine.response_audio().len(), 4);
        assert_eq!(h.stats.response_overflow_bytes.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn test_fragmented_and_malformed_messages() {
        let mut h = harness(test_config());
        h.engine.handle_transport_event(TransportEvent::Connected);

        let message = br#"{"event":"connected","message":"split"}"#.to_vec();
        let total_len = message.len();
        h.engine.handle_transport_event(TransportEvent::Fragment(Fragment {
            offset: 0,
            total_len,
            payload: message[..10].to_vec(),
        }));
        assert!(!h.engine.reassembly_is_empty());
        assert_eq!(h.session.get(), SessionState::Connecting);

        // Gap: discarded, never decoded
        h.engine.handle_transport_event(TransportEvent::Fragment(Fragment {
            offset: 20,
            total_len,
            payload: message[20..].to_vec(),
        }));
        assert!(h.engine.reassembly_is_empty());
        assert_eq!(h.session.get(), SessionState::Connecting);
        assert_eq!(h.stats.protocol_errors.load(Ordering::Relaxed), 1);

        h.engine.handle_transport_event(text("not json"));
        h.engine.handle_transport_event(text(r#"{"event":"ota_begin"}"#));
        assert_eq!(h.stats.protocol_errors.load(Ordering::Relaxed), 2);
        assert_eq!(h.session.get(), SessionState::Connecting);

        for (offset, range) in [(0, 0..10), (10, 10..total_len)] {
            h.engine.handle_transport_event(TransportEvent::Fragment(Fragment {
                offset,
                total_len,
                payload: message[range].to_vec(),
            }));
        }
        assert_eq!(h.session.get(), SessionState::Idle);
        assert!(h.engine.reassembly_is_empty());
    }

    #[tokio::test]
    async fn test_disconnect_mid_episode_recovers_on_reconnect() {
        let mut h = harness(test_config());
        h.go_idle();
        h.trigger();
        h.engine.begin_episode().await;
        h.engine.on_live_frame(frame(0, 160));

        h.conn.connected.store(false, Ordering::SeqCst);
        h.engine.handle_transport_event(TransportEvent::Disconnected);
        assert!(!h.engine.in_episode());
        assert!(h.engine.reassembly_is_empty());
        // No forced state change
        assert_eq!(h.session.get(), SessionState::Triggered);

        // Keepalive is skipped while offline
        let failures = h.stats.send_failures.load(Ordering::Relaxed);
        h.engine.on_keepalive_tick();
        assert_eq!(h.stats.send_failures.load(Ordering::Relaxed), failures);

        h.conn.connected.store(true, Ordering::SeqCst);
        h.engine.handle_transport_event(TransportEvent::Connected);
        h.engine
            .handle_transport_event(text(r#"{"event":"connected"}"#));
        assert_eq!(h.session.get(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_disconnect_while_awaiting_response() {
        let mut h = harness(test_config());
        h.go_triggered();
        h.engine.begin_episode().await;
        h.engine.finish_episode();
        h.engine
            .handle_transport_event(TransportEvent::Binary(vec![1, 2]));

        h.engine.handle_transport_event(TransportEvent::Disconnected);
        assert!(h.engine.response_audio().is_empty());
        assert_eq!(h.session.get(), SessionState::AwaitingResponse);

        h.engine.handle_transport_event(TransportEvent::Connected);
        h.engine
            .handle_transport_event(text(r#"{"event":"connected"}"#));
        assert_eq!(h.session.get(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_offline_trigger_is_closed() {
        let mut h = harness(test_config());
        h.go_idle();
        h.conn.connected.store(false, Ordering::SeqCst);

        h.trigger();
        h.engine.begin_episode().await;
        assert!(!h.engine.in_episode());
        assert_eq!(h.session.get(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_remote_trigger_profile() {
        let mut config = test_config();
        config.trigger_mode = TriggerMode::Remote;
        let mut h = harness(config);
        h.go_idle();

        h.engine
            .handle_transport_event(text(r#"{"event":"wake_word_detected"}"#));
        assert_eq!(h.session.get(), SessionState::Triggered);

        // Local profile ignores it
        let mut local = harness(test_config());
        local.go_idle();
        local
            .engine
            .handle_transport_event(text(r#"{"event":"wake_word_detected"}"#));
        assert_eq!(local.session.get(), SessionState::Idle);
    }

    #[tokio::test]
    async fn test_forced_error_ends_episode() {
        let mut h = harness(test_config());
        h.go_idle();
        h.trigger();
        h.engine.begin_episode().await;

        h.session.fail(Actor::Trigger, "test");
        h.engine.on_session_change(SessionState::Error).await;
        assert!(!h.engine.in_episode());
        assert_eq!(h.session.get(), SessionState::Error);
        assert_eq!(h.conn.events().last().map(String::as_str), Some("command_end"));
    }

    #[tokio::test]
    async fn test_keepalive_ping() {
        let mut h = harness(test_config());
        h.go_idle();
        h.engine.on_keepalive_tick();
        assert_eq!(h.conn.events(), vec!["ping"]);
    }

    #[tokio::test]
    async fn test_run_loop_drives_episode() {
        let config = Config {
            max_command_secs: 1,
            ..test_config()
        };
        let h = harness(config);
        let max_live = h.config.max_command_frames() as u64;
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (frames_tx, frames_rx) = mpsc::channel(16);
        let (_playback_tx, playback_rx) = mpsc::channel(1);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = h.session.clone();
        let conn = h.conn.clone();
        let task = tokio::spawn(h.engine.run(inbound_rx, frames_rx, playback_rx, control_rx, shutdown_rx));

        inbound_tx.send(TransportEvent::Connected).await.unwrap();
        inbound_tx.send(text(r#"{"event":"connected"}"#)).await.unwrap();
        while session.get() != SessionState::Idle {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        session
            .compare_and_set(SessionState::Idle, SessionState::Triggered, Actor::Trigger)
            .unwrap();
        while !conn.events().iter().any(|e| e == "wake_word_detected") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        for sequence in 0..max_live {
            frames_tx.send(frame(sequence, 160)).await.unwrap();
        }
        while session.get() != SessionState::AwaitingResponse {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let events = conn.events();
        assert_eq!(events.first().map(String::as_str), Some("connect"));
        assert_eq!(events[1], "wake_word_detected");
        assert_eq!(events.last().map(String::as_str), Some("command_end"));
        assert_eq!(events.iter().filter(|e| *e == "audio_stream").count() as u64, max_live);
    }

    #[tokio::test]
    async fn test_status_cues() {
        let config = Config {
            status_cues: true,
            ..test_config()
        };
        let mut h = harness(config);
        h.go_idle();

        h.trigger();
        h.engine.on_session_change(SessionState::Triggered).await;
        assert_eq!(
            h.playback_rx.try_recv().unwrap(),
            PlaybackRequest::Cue(StatusCue::Wake)
        );
        assert!(h.playback_rx.try_recv().is_err());

        h.session.fail(Actor::External, "device unplugged");
        h.engine.on_session_change(SessionState::Error).await;
        assert_eq!(
            h.playback_rx.try_recv().unwrap(),
            PlaybackRequest::Cue(StatusCue::Error)
        );

        // Disabled: silent
        let mut quiet = harness(test_config());
        quiet.go_idle();
        quiet.trigger();
        quiet.engine.on_session_change(SessionState::Triggered).await;
        assert!(quiet.playback_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_remote_profile_streams_between_episodes() {
        let config = Config {
            trigger_mode: TriggerMode::Remote,
            ..test_config()
        };
        let mut h = harness(config);
        h.go_idle();
        for sequence in 0..20 {
            h.preroll.write(&frame(sequence, 160));
        }

        // Idle frames go straight out for the server's detector
        for sequence in 20..25 {
            h.engine.on_live_frame(frame(sequence, 160));
        }
        assert_eq!(h.conn.events(), vec!["audio_stream"; 5]);
        h.conn.clear();

        h.engine
            .handle_transport_event(text(r#"{"event":"wake_word_detected"}"#));
        assert_eq!(h.session.get(), SessionState::Triggered);
        h.engine.on_session_change(SessionState::Triggered).await;
        // No pre-roll replay
        assert_eq!(h.conn.events(), vec!["wake_word_detected"]);

        h.engine.on_live_frame(frame(25, 160));
        h.engine.on_control(EpisodeControl::Stop);
        assert_eq!(
            h.conn.events(),
            vec!["wake_word_detected", "audio_stream", "command_end"]
        );
        h.conn.clear();

        // Paused while the reply is pending and playing
        h.engine.on_live_frame(frame(26, 160));
        h.engine
            .handle_transport_event(TransportEvent::Binary(vec![1, 2]));
        h.engine
            .handle_transport_event(text(r#"{"event":"audio_chunk","audio":"","final":true}"#));
        assert_eq!(h.session.get(), SessionState::Playback);
        h.engine.on_live_frame(frame(27, 160));
        assert!(h.conn.events().is_empty());

        h.engine
            .on_playback_finished(PlaybackEvent::Finished { bytes_played: 2 });
        h.engine.on_live_frame(frame(28, 160));
        assert_eq!(h.conn.events(), vec!["audio_stream"]);

        // Nothing goes out while offline
        h.conn.clear();
        h.conn.connected.store(false, Ordering::SeqCst);
        h.engine.on_live_frame(frame(29, 160));
        assert_eq!(h.stats.send_failures.load(Ordering::Relaxed), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_live_frames_kept_during_paced_preroll() {
        let config = Config {
            max_command_secs: 1,
            ..Config::default()
        };
        assert!(!config.preroll_pacing().is_zero());
        let h = harness(config);
        let preroll_frames = h.config.preroll_frames() as u64;
        let max_live = h.config.max_command_frames() as u64;
        let frame_length = h.config.frame_length;
        let frame_duration = h.config.frame_duration();
        // The paced pre-roll outlasts the queue at capture pace
        assert!(
            h.config.preroll_pacing() * preroll_frames as u32
                > frame_duration * h.config.outbound_queue_frames as u32
        );

        for sequence in 0..preroll_frames {
            h.preroll.write(&frame(sequence, frame_length));
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let (frames_tx, frames_rx) = mpsc::channel(h.config.outbound_queue_frames);
        let (_playback_tx, playback_rx) = mpsc::channel(1);
        let (_control_tx, control_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let session = h.session.clone();
        let conn = h.conn.clone();
        let task = tokio::spawn(h.engine.run(inbound_rx, frames_rx, playback_rx, control_rx, shutdown_rx));

        inbound_tx.send(TransportEvent::Connected).await.unwrap();
        inbound_tx.send(text(r#"{"event":"connected"}"#)).await.unwrap();
        while session.get() != SessionState::Idle {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        session
            .compare_and_set(SessionState::Idle, SessionState::Triggered, Actor::Trigger)
            .unwrap();
        while !conn.events().iter().any(|e| e == "wake_word_detected") {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // Live frames at capture pace, never waiting for room
        let mut dropped = 0;
        for sequence in preroll_frames..preroll_frames + max_live {
            if frames_tx.try_send(frame(sequence, frame_length)).is_err() {
                dropped += 1;
            }
            tokio::time::sleep(frame_duration).await;
        }
        assert_eq!(dropped, 0);

        while session.get() != SessionState::AwaitingResponse {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let events = conn.events();
        assert_eq!(events.last().map(String::as_str), Some("command_end"));
        assert_eq!(
            events.iter().filter(|e| *e == "audio_stream").count() as u64,
            preroll_frames + max_live
        );
    }
}
