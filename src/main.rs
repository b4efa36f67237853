//! PollyLive - voice assistant client
//!
//! Usage: `pollylive [config.toml]`
//!
//! Streams microphone audio to the assistant server after a trigger and
//! plays the spoken reply. Runs until Ctrl-C or an unrecoverable fault.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use pollylive::audio::PulseFrameSource;
use pollylive::media_in::{FrameSource, FrameSourceError};
use pollylive::pipeline::{self, Pipeline, PipelineParts};
use pollylive::ws_client::WsClient;
use pollylive::{Config, SessionState};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STATS_INTERVAL: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting pollylive");

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    info!(
        "Device {} -> {} ({:?} trigger, {:?} audio)",
        config.device_id, config.server_url, config.trigger_mode, config.audio_encoding
    );

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
                PulseFrameSource::new(None, sample_rate, frame_length)
                    .map(|source| Box::new(source) as Box<dyn FrameSource>)
                    .map_err(|e| FrameSourceError::Fault(e.to_string()))
            })
        },
        classifier: pipeline::classifier_factory(&config),
        sinks: pipeline::sink_factory(&config, true),
    };

    let handle = Pipeline::spawn(config, conn, events_rx, parts).context("Failed to start pipeline")?;
    let ws_task = tokio::spawn(client.run(handle.shutdown_signal()));

    let mut session_rx = handle.session().subscribe();
    let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
    stats_tick.tick().await;

    let failed = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break false;
            }
            _ = stats_tick.tick() => {
                info!("Stats: {}", handle.stats().snapshot());
            }
            changed = session_rx.changed() => {
                if changed.is_err() {
                    break false;
                }
                if *session_rx.borrow_and_update() == SessionState::Error {
                    error!("Pipeline entered the error state");
                    break true;
                }
            }
        }
    };

    handle.stop().await;
    match ws_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("WebSocket client failed: {:#}", e),
        Err(e) => error!("WebSocket task panicked: {}", e),
    }

    if failed {
        bail!("pipeline stopped after an unrecoverable fault");
    }
    Ok(())
}
