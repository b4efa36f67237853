//! Pipeline configuration
//!
//! Everything is fixed at startup. Values come from `Config::default()`, an
//! optional TOML file, and a couple of environment overrides for the fields
//! that differ per device.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Environment variable naming the TOML config file
pub const CONFIG_PATH_ENV: &str = "POLLY_CONFIG";
/// Environment override for `server_url`
pub const SERVER_URL_ENV: &str = "POLLY_SERVER_URL";
/// Environment override for `device_id`
pub const DEVICE_ID_ENV: &str = "POLLY_DEVICE_ID";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Where the trigger comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// On-device classifier decides
    Local,
    /// Server runs detection and sends `wake_word_detected`
    Remote,
}

/// How outbound audio frames are framed on the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioEncoding {
    /// `{"event":"audio_stream","data":"<base64>"}` text messages
    Base64,
    /// Raw little-endian PCM in binary messages
    Binary,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sample_rate: u32,
    /// Samples per frame (one protocol tick)
    pub frame_length: usize,
    pub preroll_secs: u32,
    pub max_command_secs: u32,
    /// 0.0 (least eager) to 1.0 (most eager)
    pub trigger_sensitivity: f32,
    pub trigger_mode: TriggerMode,
    pub audio_encoding: AudioEncoding,
    pub device_id: String,
    pub server_url: String,
    pub reconnect_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub trigger_queue_frames: usize,
    pub outbound_queue_frames: usize,
    pub response_audio_capacity: usize,
    pub reassembly_capacity: usize,
    pub preroll_pacing_ms: u64,
    pub frame_stall_timeout_ms: u64,
    pub response_warn_after_ms: u64,
    pub playback_chunk_bytes: usize,
    /// Play a chirp on trigger and a low tone on failure
    pub status_cues: bool,
    /// Also write every response to a WAV file in this directory
    pub record_responses_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            frame_length: 512,
            preroll_secs: 5,
            max_command_secs: 5,
            trigger_sensitivity: 0.5,
            trigger_mode: TriggerMode::Local,
            audio_encoding: AudioEncoding::Base64,
            device_id: "polly001".to_string(),
            server_url: "ws://192.168.1.100:8000/api/audio/stream".to_string(),
            reconnect_interval_ms: 5_000,
            keepalive_interval_ms: 30_000,
            trigger_queue_frames: 16,
            outbound_queue_frames: 16,
            response_audio_capacity: 16_000 * 2 * 10, // 10 s of 16-bit mono
            reassembly_capacity: 32 * 1024,
            preroll_pacing_ms: 5,
            frame_stall_timeout_ms: 100,
            response_warn_after_ms: 15_000,
            playback_chunk_bytes: 1024,
            status_cues: true,
            record_responses_dir: None,
        }
    }
}

impl Config {
    /// Parse a TOML document; missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Load from `path` (or `$POLLY_CONFIG`) if given, then apply env overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        let mut config = match path.map(Path::to_path_buf).or(env_path) {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        if let Ok(url) = std::env::var(SERVER_URL_ENV) {
            config.server_url = url;
        }
        if let Ok(device_id) = std::env::var(DEVICE_ID_ENV) {
            config.device_id = device_id;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.frame_length == 0 {
            return Err(ConfigError::Invalid(
                "sample_rate and frame_length must be non-zero".to_string(),
            ));
        }
        if self.frame_length > self.sample_rate as usize {
            return Err(ConfigError::Invalid(format!(
                "frame_length {} is longer than one second at {} Hz",
                self.frame_length, self.sample_rate
            )));
        }
        if !(0.0..=1.0).contains(&self.trigger_sensitivity) {
            return Err(ConfigError::Invalid(format!(
                "trigger_sensitivity {} is outside 0.0..=1.0",
                self.trigger_sensitivity
            )));
        }
        if self.trigger_queue_frames == 0 || self.outbound_queue_frames == 0 {
            return Err(ConfigError::Invalid("queue capacities must be non-zero".to_string()));
        }
        if self.max_command_frames() == 0 {
            return Err(ConfigError::Invalid("max_command_secs yields zero frames".to_string()));
        }
        if self.response_audio_capacity == 0 || self.reassembly_capacity == 0 {
            return Err(ConfigError::Invalid("buffer capacities must be non-zero".to_string()));
        }
        if self.playback_chunk_bytes == 0 || self.playback_chunk_bytes % 2 != 0 {
            return Err(ConfigError::Invalid(
                "playback_chunk_bytes must be a non-zero even number".to_string(),
            ));
        }
        if self.device_id.is_empty() {
            return Err(ConfigError::Invalid("device_id must not be empty".to_string()));
        }
        Ok(())
    }

    /// Whole frames per second (integer division, remainder dropped).
    pub fn frames_per_second(&self) -> usize {
        self.sample_rate as usize / self.frame_length
    }

    /// Ring buffer capacity in frames.
    pub fn preroll_frames(&self) -> usize {
        (self.sample_rate as usize * self.preroll_secs as usize) / self.frame_length
    }

    /// Hard cap on live frames per episode.
    pub fn max_command_frames(&self) -> usize {
        (self.sample_rate as usize * self.max_command_secs as usize) / self.frame_length
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_micros(self.frame_length as u64 * 1_000_000 / self.sample_rate as u64)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn preroll_pacing(&self) -> Duration {
        Duration::from_millis(self.preroll_pacing_ms)
    }

    pub fn frame_stall_timeout(&self) -> Duration {
        Duration::from_millis(self.frame_stall_timeout_ms)
    }

    pub fn response_warn_after(&self) -> Duration {
        Duration::from_millis(self.response_warn_after_ms)
    }
}
