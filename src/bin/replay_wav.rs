//! Replay a WAV file through the pipeline
//!
//! Usage: `replay_wav <input.wav> [config.toml]`
//!
//! Feeds a 16-bit mono recording in place of the microphone, at real-time
//! pace, and writes any spoken replies to `record_responses_dir` (default
//! `./responses`) instead of the speaker. Useful for exercising a server
//! without audio hardware.

use anyhow::{bail, Context, Result};
use pollylive::media_in::{FrameSource, WavFrameSource};
use pollylive::pipeline::{self, Pipeline, PipelineParts};
use pollylive::ws_client::WsClient;
use pollylive::{Config, SessionState};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Time allowed for a reply after the input runs out
const DRAIN_GRACE: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let Some(input) = args.next().map(PathBuf::from) else {
        bail!("usage: replay_wav <input.wav> [config.toml]");
    };
    let config_path = args.next().map(PathBuf::from);

    let mut config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    if config.record_responses_dir.is_none() {
        config.record_responses_dir = Some(PathBuf::from("responses"));
    }

    println!("🎧 Replaying {} to {}", input.display(), config.server_url);

    let (events_tx, events_rx) = mpsc::channel(64);
    let (client, conn) = WsClient::new(
        &config.server_url,
        config.reconnect_interval(),
        config.outbound_queue_frames,
        events_tx,
    );

    let parts = PipelineParts {
        source: {
            let sample_rate = config.sample_rate;
            let frame_length = config.frame_length;
            Box::new(move || {
                WavFrameSource::open(&input, sample_rate, frame_length, true)
                    .map(|source| Box::new(source) as Box<dyn FrameSource>)
            })
        },
        classifier: pipeline::classifier_factory(&config),
        sinks: pipeline::sink_factory(&config, false),
    };

    let handle = Pipeline::spawn(config, conn, events_rx, parts).context("Failed to start pipeline")?;
    let ws_task = tokio::spawn(client.run(handle.shutdown_signal()));

    // Wait for the input to run out, then for the session to settle
    let stats = handle.stats().clone();
    let mut session_rx = handle.session().subscribe();
    let mut last_captured = u64::MAX;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
        let captured = stats.snapshot().frames_captured;
        if captured == last_captured {
            break;
        }
        last_captured = captured;
    }

    info!("Input finished, waiting up to {:?} for the reply", DRAIN_GRACE);
    let _ = tokio::time::timeout(
        DRAIN_GRACE,
        session_rx.wait_for(|state| matches!(state, SessionState::Idle | SessionState::Error)),
    )
    .await;

    let final_state = handle.session().get();
    handle.stop().await;
    if let Ok(Err(e)) = ws_task.await {
        eprintln!("WebSocket client failed: {:#}", e);
    }

    println!("📊 {}", stats.snapshot());
    if final_state == SessionState::Error {
        bail!("pipeline ended in the error state");
    }
    Ok(())
}
