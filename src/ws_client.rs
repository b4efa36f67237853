//! WebSocket transport
//!
//! Keeps one connection to the server alive, reconnecting after a fixed
//! interval whenever it drops. Outbound messages go through a bounded queue
//! drained by this task; inbound messages are surfaced to the engine as
//! [`TransportEvent`]s. Every text message arrives whole from tungstenite and
//! is forwarded as a single fragment.

use crate::engine::{Connection, TransportError};
use crate::events::{Fragment, TransportEvent};
use crate::protocol::WireMessage;
use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Engine-side handle: queues messages for the socket task.
#[derive(Clone)]
pub struct WsConnection {
    tx: mpsc::Sender<WireMessage>,
    connected: Arc<AtomicBool>,
}

impl Connection for WsConnection {
    fn send(&self, message: WireMessage) -> std::result::Result<(), TransportError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(TransportError::NotConnected);
        }
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => TransportError::QueueFull,
            TrySendError::Closed(_) => TransportError::Closed,
        })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }
}

/// The socket task.
pub struct WsClient {
    url: String,
    reconnect_interval: Duration,
    outbound_rx: mpsc::Receiver<WireMessage>,
    events_tx: mpsc::Sender<TransportEvent>,
    connected: Arc<AtomicBool>,
}

impl WsClient {
    pub fn new(
        url: &str,
        reconnect_interval: Duration,
        queue_capacity: usize,
        events_tx: mpsc::Sender<TransportEvent>,
    ) -> (Self, WsConnection) {
        let (tx, outbound_rx) = mpsc::channel(queue_capacity);
        let connected = Arc::new(AtomicBool::new(false));
        let client = Self {
            url: url.to_string(),
            reconnect_interval,
            outbound_rx,
            events_tx,
            connected: connected.clone(),
        };
        (client, WsConnection { tx, connected })
    }

    /// Connect, pump messages, reconnect on loss. Returns on shutdown or when
    /// the engine stops listening.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }

            info!("Connecting to {}", self.url);
            match connect_async(&self.url).await {
                Ok((ws_stream, resp)) => {
                    debug!("WebSocket handshake response: {:?}", resp.status());
                    if !self.session(ws_stream, &mut shutdown).await? {
                        break;
                    }
                }
                Err(e) => warn!("Connection to {} failed: {}", self.url, e),
            }

            debug!("Reconnecting in {:?}", self.reconnect_interval);
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_interval) => {}
                _ = shutdown.changed() => break,
            }
        }

        info!("WebSocket client stopped");
        Ok(())
    }

    /// One connected session. Returns Ok(false) when the client should stop.
    async fn session<S>(
        &mut self,
        ws_stream: tokio_tungstenite::WebSocketStream<S>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<bool>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
    {
        let mut stale = 0;
        while self.outbound_rx.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} message(s) queued before the reconnect", stale);
        }

        let (mut sink, mut stream) = ws_stream.split();
        self.connected.store(true, Ordering::Release);
        info!("Connected to {}", self.url);
        if self.events_tx.send(TransportEvent::Connected).await.is_err() {
            return Ok(false);
        }

        let keep_running = loop {
            tokio::select! {
                outbound = self.outbound_rx.recv() => match outbound {
                    Some(message) => {
                        let message = match message {
                            WireMessage::Text(text) => Message::text(text),
                            WireMessage::Binary(bytes) => Message::binary(bytes),
                        };
                        if let Err(e) = sink.send(message).await {
                            warn!("WebSocket send failed: {}", e);
                            break true;
                        }
                    }
                    None => break false,
                },

                inbound = stream.next() => {
                    let event = match inbound {
                        Some(Ok(Message::Text(text))) => {
                            TransportEvent::Fragment(Fragment::whole(text.as_bytes().to_vec()))
                        }
                        Some(Ok(Message::Binary(bytes))) => TransportEvent::Binary(bytes.to_vec()),
                        Some(Ok(Message::Close(frame))) => {
                            info!("WebSocket closed by server: {:?}", frame);
                            break true;
                        }
                        Some(Ok(_)) => continue,
                        Some(Err(e)) => {
                            error!("WebSocket error: {}", e);
                            break true;
                        }
                        None => {
                            info!("WebSocket stream ended");
                            break true;
                        }
                    };
                    if self.events_tx.send(event).await.is_err() {
                        break false;
                    }
                }

                _ = shutdown.changed() => {
                    let _ = sink.close().await;
                    break false;
                }
            }
        };

        self.connected.store(false, Ordering::Release);
        if keep_running && self.events_tx.send(TransportEvent::Disconnected).await.is_err() {
            return Ok(false);
        }
        Ok(keep_running)
    }
}
