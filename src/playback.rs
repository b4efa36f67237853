//! Response playback
//!
//! Response audio arrives in chunks while the session is `AwaitingResponse`
//! and accumulates in a fixed-capacity [`ResponseAudioBuffer`]. The final
//! chunk hands the whole response to the playback thread, which feeds it to an
//! [`AudioSink`] in bounded pieces and reports back when done.

use crate::events::PlaybackEvent;
use chrono::Local;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Size of the canonical PCM WAV header
pub const WAV_HEADER_LEN: usize = 44;

/// Peak level of generated cue tones
const CUE_AMPLITUDE: f32 = 8000.0;
/// Fade in/out length of each cue tone, in samples
const CUE_RAMP_SAMPLES: usize = 200;

#[derive(Debug, thiserror::Error)]
pub enum PlaybackError {
    #[error("Response buffer overflow: {dropped} bytes dropped")]
    Overflow { dropped: usize },
}

pub type Result<T> = std::result::Result<T, PlaybackError>;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("Audio device error: {0}")]
    Device(String),
}

/// Append-only store for one response, bounded by `capacity`.
#[derive(Debug)]
pub struct ResponseAudioBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl ResponseAudioBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append bytes. Whatever does not fit is dropped and reported.
    pub fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let room = self.capacity - self.data.len();
        if bytes.len() <= room {
            self.data.extend_from_slice(bytes);
            return Ok(());
        }

        self.data.extend_from_slice(&bytes[..room]);
        Err(PlaybackError::Overflow {
            dropped: bytes.len() - room,
        })
    }

    /// Hand over the accumulated response and start empty.
    pub fn take_complete(&mut self) -> Vec<u8> {
        std::mem::replace(&mut self.data, Vec::with_capacity(self.capacity))
    }

    pub fn reset(&mut self) {
        self.data.clear();
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

/// Short generated tones that tell the user what the device is doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCue {
    /// Rising two-tone chirp: a trigger started an episode
    Wake,
    /// Long low tone: the pipeline failed
    Error,
}

impl StatusCue {
    /// 16-bit little-endian mono PCM for this cue.
    pub fn render(self, sample_rate: u32) -> Vec<u8> {
        let mut pcm = Vec::new();
        match self {
            StatusCue::Wake => {
                push_tone(&mut pcm, sample_rate, 800.0, 80);
                push_silence(&mut pcm, sample_rate, 30);
                push_tone(&mut pcm, sample_rate, 1200.0, 80);
            }
            StatusCue::Error => push_tone(&mut pcm, sample_rate, 200.0, 300),
        }
        pcm
    }
}

fn samples_for(sample_rate: u32, duration_ms: u32) -> usize {
    (sample_rate as u64 * duration_ms as u64 / 1000) as usize
}

fn push_tone(pcm: &mut Vec<u8>, sample_rate: u32, freq_hz: f32, duration_ms: u32) {
    let total = samples_for(sample_rate, duration_ms);
    let ramp = CUE_RAMP_SAMPLES.min(total / 2).max(1);
    for i in 0..total {
        let t = i as f32 / sample_rate as f32;
        let edge = i.min(total - 1 - i);
        let envelope = (edge as f32 / ramp as f32).min(1.0);
        let sample = (std::f32::consts::TAU * freq_hz * t).sin() * CUE_AMPLITUDE * envelope;
        pcm.extend_from_slice(&(sample as i16).to_le_bytes());
    }
}

fn push_silence(pcm: &mut Vec<u8>, sample_rate: u32, duration_ms: u32) {
    pcm.resize(pcm.len() + samples_for(sample_rate, duration_ms) * 2, 0);
}

/// Work for the playback thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackRequest {
    /// A complete server response; answered with [`PlaybackEvent::Finished`]
    Response(Vec<u8>),
    /// A status tone; no completion event
    Cue(StatusCue),
}

/// Skip a canonical 44-byte PCM WAV header if one is present.
///
/// Only `RIFF....WAVE` with `fmt ` at 12 and `data` at 36 is recognised;
/// anything else is taken to be raw samples.
pub fn strip_wav_header(bytes: &[u8]) -> &[u8] {
    if bytes.len() > WAV_HEADER_LEN
        && &bytes[0..4] == b"RIFF"
        && &bytes[8..12] == b"WAVE"
        && &bytes[12..16] == b"fmt "
        && &bytes[36..40] == b"data"
    {
        &bytes[WAV_HEADER_LEN..]
    } else {
        bytes
    }
}

/// Something that turns response bytes into sound (or a file).
pub trait AudioSink {
    /// Blocking write of 16-bit little-endian PCM.
    fn emit(&mut self, bytes: &[u8]) -> std::result::Result<(), SinkError>;

    /// The response is over; flush whatever is buffered.
    fn finish(&mut self) -> std::result::Result<(), SinkError>;

    /// Whether status cues are played through this sink.
    fn wants_cues(&self) -> bool {
        true
    }
}

/// Builds the sinks on the playback thread.
pub type SinkFactory =
    Box<dyn FnOnce() -> std::result::Result<Vec<Box<dyn AudioSink>>, SinkError> + Send + 'static>;

/// Records each response to its own timestamped WAV file.
pub struct WavFileSink {
    dir: PathBuf,
    spec: hound::WavSpec,
    writer: Option<hound::WavWriter<BufWriter<File>>>,
    path: Option<PathBuf>,
    /// Odd byte left over from the previous `emit`
    carry: Option<u8>,
}

impl WavFileSink {
    pub fn new(dir: &Path, sample_rate: u32) -> std::result::Result<Self, SinkError> {
        std::fs::create_dir_all(dir)?;
        info!("Recording responses to {:?}", dir);
        Ok(Self {
            dir: dir.to_path_buf(),
            spec: hound::WavSpec {
                channels: 1,
                sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            },
            writer: None,
            path: None,
            carry: None,
        })
    }

    /// Path of the file most recently started.
    pub fn last_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn writer(&mut self) -> std::result::Result<&mut hound::WavWriter<BufWriter<File>>, SinkError> {
        if self.writer.is_none() {
            let path = self.dir.join(format!(
                "response_{}.wav",
                Local::now().format("%Y%m%d_%H%M%S%.3f")
            ));
            debug!("Starting response recording {:?}", path);
            self.writer = Some(hound::WavWriter::create(&path, self.spec)?);
            self.path = Some(path);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| SinkError::Device("WAV writer unavailable".to_string()))
    }
}

impl AudioSink for WavFileSink {
    fn emit(&mut self, bytes: &[u8]) -> std::result::Result<(), SinkError> {
        let mut joined = Vec::with_capacity(bytes.len() + 1);
        joined.extend(self.carry.take());
        joined.extend_from_slice(bytes);

        let whole = joined.len() & !1;
        if whole < joined.len() {
            self.carry = Some(joined[whole]);
        }

        let writer = self.writer()?;
        for pair in joined[..whole].chunks_exact(2) {
            writer.write_sample(i16::from_le_bytes([pair[0], pair[1]]))?;
        }
        Ok(())
    }

    fn wants_cues(&self) -> bool {
        false
    }

    fn finish(&mut self) -> std::result::Result<(), SinkError> {
        self.carry = None;
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
            if let Some(path) = &self.path {
                info!("Saved response audio to {:?}", path);
            }
        }
        Ok(())
    }
}

/// Body of the playback thread.
///
/// Plays each completed response, then sends [`PlaybackEvent::Finished`] so
/// the engine can leave `Playback`. Cues are played as they come and are not
/// reported. A sink fault ends that response early.
pub fn run_playback_loop(
    make_sinks: SinkFactory,
    sample_rate: u32,
    chunk_bytes: usize,
    mut requests_rx: mpsc::Receiver<PlaybackRequest>,
    events_tx: mpsc::Sender<PlaybackEvent>,
) {
    let mut sinks = match make_sinks() {
        Ok(sinks) => sinks,
        Err(e) => {
            // Keep draining so the engine still leaves Playback
            error!("Failed to open audio sinks: {}", e);
            Vec::new()
        }
    };
    info!("Playback thread started with {} sink(s)", sinks.len());

    while let Some(request) = requests_rx.blocking_recv() {
        let response = match request {
            PlaybackRequest::Cue(cue) => {
                debug!("Playing {:?} cue", cue);
                play(&mut sinks, &cue.render(sample_rate), chunk_bytes, true);
                continue;
            }
            PlaybackRequest::Response(response) => response,
        };

        let mut pcm = strip_wav_header(&response);
        if pcm.len() < response.len() {
            debug!("Stripped WAV header from response");
        }
        if pcm.len() % 2 != 0 {
            debug!("Dropping trailing half sample");
            pcm = &pcm[..pcm.len() - 1];
        }
        info!("Playing {} bytes of response audio", pcm.len());

        let bytes_played = play(&mut sinks, pcm, chunk_bytes, false);

        if events_tx
            .blocking_send(PlaybackEvent::Finished { bytes_played })
            .is_err()
        {
            break;
        }
    }

    info!("Playback thread stopped");
}

fn play(sinks: &mut [Box<dyn AudioSink>], pcm: &[u8], chunk_bytes: usize, cue: bool) -> usize {
    let mut played = 0;
    let mut healthy: Vec<bool> = sinks.iter().map(|sink| !cue || sink.wants_cues()).collect();
    let included = healthy.clone();
    // Whole samples only
    let chunk_bytes = (chunk_bytes & !1).max(2);

    for chunk in pcm.chunks(chunk_bytes) {
        for (sink, ok) in sinks.iter_mut().zip(healthy.iter_mut()) {
            if !*ok {
                continue;
            }
            if let Err(e) = sink.emit(chunk) {
                warn!("Audio sink fault after {} bytes: {}", played, e);
                *ok = false;
            }
        }
        if !healthy.iter().any(|ok| *ok) && !sinks.is_empty() {
            break;
        }
        played += chunk.len();
    }

    for (sink, _) in sinks.iter_mut().zip(&included).filter(|(_, used)| **used) {
        if let Err(e) = sink.finish() {
            warn!("Audio sink failed to finish: {}", e);
        }
    }
    played
}
