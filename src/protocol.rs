//! Wire protocol
//!
//! Text messages are JSON objects tagged by an `event` field. Audio goes out
//! either as base64 inside `audio_stream` text messages or as raw
//! little-endian PCM in binary messages, depending on the deployment profile.
//! Inbound binary messages are always raw response audio.

use crate::config::AudioEncoding;
use base64::engine::general_purpose;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid base64 audio: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// One message as it crosses the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// Device -> server events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingEvent {
    Connect { device_id: String },
    /// Milliseconds since the pipeline started
    WakeDetected { timestamp: u64 },
    /// Little-endian 16-bit PCM for one frame
    AudioFrame(Vec<u8>),
    CommandEnd,
    Ping,
}

impl OutgoingEvent {
    pub fn name(&self) -> &'static str {
        match self {
            OutgoingEvent::Connect { .. } => "connect",
            OutgoingEvent::WakeDetected { .. } => "wake_word_detected",
            OutgoingEvent::AudioFrame(_) => "audio_stream",
            OutgoingEvent::CommandEnd => "command_end",
            OutgoingEvent::Ping => "ping",
        }
    }

    /// Encode into exactly one wire message.
    pub fn encode(&self, encoding: AudioEncoding) -> Result<WireMessage> {
        let json = match self {
            OutgoingEvent::AudioFrame(pcm) if encoding == AudioEncoding::Binary => {
                return Ok(WireMessage::Binary(pcm.clone()));
            }
            OutgoingEvent::AudioFrame(pcm) => OutgoingJson::AudioStream {
                data: general_purpose::STANDARD.encode(pcm),
            },
            OutgoingEvent::Connect { device_id } => OutgoingJson::Connect { device_id },
            OutgoingEvent::WakeDetected { timestamp } => OutgoingJson::WakeWordDetected {
                timestamp: *timestamp,
            },
            OutgoingEvent::CommandEnd => OutgoingJson::CommandEnd,
            OutgoingEvent::Ping => OutgoingJson::Ping,
        };
        Ok(WireMessage::Text(serde_json::to_string(&json)?))
    }
}

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum OutgoingJson<'a> {
    Connect { device_id: &'a str },
    WakeWordDetected { timestamp: u64 },
    AudioStream { data: String },
    CommandEnd,
    Ping,
}

/// Server -> device messages, after decoding
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Connected {
        message: Option<String>,
    },
    WakeAck,
    /// Server-side trigger detection fired
    WakeWordDetected,
    Response {
        text: Option<String>,
        transcription: Option<String>,
        intent: Option<serde_json::Value>,
    },
    AudioChunk {
        payload: Vec<u8>,
        is_final: bool,
    },
    Pong,
    Error {
        message: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum InboundJson {
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
    WakeAck {},
    WakeWordDetected {},
    Response {
        #[serde(default)]
        text: Option<String>,
        #[serde(default)]
        transcription: Option<String>,
        #[serde(default)]
        intent: Option<serde_json::Value>,
    },
    AudioChunk {
        #[serde(default)]
        audio: Option<String>,
        #[serde(rename = "final", default)]
        is_final: bool,
    },
    Pong {},
    Error {
        #[serde(default)]
        message: Option<String>,
    },
    #[serde(other)]
    Unknown,
}

/// Decode a complete text message.
///
/// Unknown `event` values yield `Ok(None)`. A missing `event` field or a
/// malformed body is an error.
pub fn decode_text(bytes: &[u8]) -> Result<Option<ProtocolMessage>> {
    let message = match serde_json::from_slice::<InboundJson>(bytes)? {
        InboundJson::Connected { message } => ProtocolMessage::Connected { message },
        InboundJson::WakeAck {} => ProtocolMessage::WakeAck,
        InboundJson::WakeWordDetected {} => ProtocolMessage::WakeWordDetected,
        InboundJson::Response {
            text,
            transcription,
            intent,
        } => ProtocolMessage::Response {
            text,
            transcription,
            intent,
        },
        InboundJson::AudioChunk { audio, is_final } => {
            let payload = match audio {
                Some(data) if !data.is_empty() => general_purpose::STANDARD.decode(data)?,
                _ => Vec::new(),
            };
            ProtocolMessage::AudioChunk { payload, is_final }
        }
        InboundJson::Pong {} => ProtocolMessage::Pong,
        InboundJson::Error { message } => ProtocolMessage::Error { message },
        InboundJson::Unknown => {
            debug!("Ignoring message with unknown event");
            return Ok(None);
        }
    };
    Ok(Some(message))
}

/// Decode a binary message: raw response audio, never final.
pub fn decode_binary(bytes: Vec<u8>) -> ProtocolMessage {
    ProtocolMessage::AudioChunk {
        payload: bytes,
        is_final: false,
    }
}
