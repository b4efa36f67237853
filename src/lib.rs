//! PollyLive - on-device voice assistant pipeline
//!
//! Captures microphone audio continuously, detects a trigger, streams a
//! few seconds of pre-roll plus the spoken command to a WebSocket server
//! and plays back the synthesized reply.

#![forbid(unsafe_code)]

pub mod audio;
pub mod config;
pub mod engine;
pub mod events;
pub mod media_in;
pub mod pipeline;
pub mod playback;
pub mod protocol;
pub mod reassembly;
pub mod ring_buffer;
pub mod session;
pub mod trigger;
pub mod ws_client;

pub use config::Config;
pub use pipeline::{Pipeline, PipelineHandle, PipelineParts, PipelineStats};
pub use session::{SessionState, SessionStateMachine};
