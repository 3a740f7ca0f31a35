//! WebSocket sync transport: one long-lived connection per open
//! presentation per participant.
//!
//! Provides:
//! - Connection lifecycle (connect, reconnect per [`ReconnectPolicy`], close)
//! - Text envelope send/receive
//! - Drop-on-disconnect outbound semantics (there is no offline queue)
//!
//! ```text
//!  TransportHandle::send() ──► outgoing mpsc ──► writer ─┐
//!                                                        ├── WebSocket
//!  mpsc<TransportEvent> ◄──────────────────── reader ◄──┘
//! ```

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::TransportConfig;
use crate::protocol::Envelope;

/// Transport connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// The reconnect policy ran out of attempts.
    GaveUp,
    /// Closed on request.
    Closed,
}

/// Events emitted by the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    /// A text frame from the server.
    Message(String),
    GaveUp,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport URL must start with ws:// or wss://, got `{0}`")]
    InvalidUrl(String),
}

/// Anything outbound envelopes can be handed to. Implemented by
/// [`TransportHandle`]; tests substitute recorders.
pub trait EnvelopeSink: Send {
    /// Queue a text frame. Returns `false` when it was dropped.
    fn send_text(&self, text: String) -> bool;

    fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                log::error!("Dropping {} envelope: {e}", envelope.type_name());
                false
            }
        }
    }

    /// Stop the underlying connection, if any.
    fn shutdown(&self) {}
}

pub struct SyncTransport;

impl SyncTransport {
    /// Spawn the connection task. Must be called inside a Tokio runtime.
    pub fn spawn(
        config: TransportConfig,
    ) -> Result<(TransportHandle, mpsc::Receiver<TransportEvent>), TransportError> {
        if !(config.url.starts_with("ws://") || config.url.starts_with("wss://")) {
            return Err(TransportError::InvalidUrl(config.url));
        }

        let capacity = config.channel_capacity.max(1);
        let (event_tx, event_rx) = mpsc::channel(capacity);
        let (out_tx, out_rx) = mpsc::channel::<String>(capacity);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_connection(config, state_tx, out_rx, event_tx, shutdown_rx));

        Ok((
            TransportHandle {
                outgoing: out_tx,
                state: state_rx,
                shutdown: shutdown_tx,
                task: Some(task),
            },
            event_rx,
        ))
    }
}

/// Owner side of a running transport. Dropping it closes the connection.
pub struct TransportHandle {
    outgoing: mpsc::Sender<String>,
    state: watch::Receiver<ConnectionState>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Wait until the transport reaches `target`, up to `limit`.
    pub async fn wait_for_state(&self, target: ConnectionState, limit: Duration) -> bool {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(limit, state.wait_for(|s| *s == target)).await;
        matches!(reached, Ok(Ok(_)))
    }

    /// Close the connection and wait for the task to finish.
    pub async fn close(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl EnvelopeSink for TransportHandle {
    fn send_text(&self, text: String) -> bool {
        if !self.is_connected() {
            log::debug!("Not connected, dropping outbound message");
            return false;
        }
        match self.outgoing.try_send(text) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Outbound queue unavailable, dropping message: {e}");
                false
            }
        }
    }

    fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }
}

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn run_connection(
    config: TransportConfig,
    state: watch::Sender<ConnectionState>,
    mut outgoing: mpsc::Receiver<String>,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        if *shutdown.borrow() {
            break;
        }
        state.send_replace(if attempt == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });

        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(config.url.as_str()) => result,
            _ = shutdown.changed() => break,
        };

        match connected {
            Ok((socket, _)) => {
                attempt = 0;
                // Anything queued before the connection existed is stale.
                while outgoing.try_recv().is_ok() {}
                state.send_replace(ConnectionState::Connected);
                log::info!("Connected to {}", config.url);
                if events.send(TransportEvent::Connected).await.is_err() {
                    break;
                }

                let closed_locally = pump(socket, &mut outgoing, &events, &mut shutdown).await;
                state.send_replace(ConnectionState::Disconnected);
                let _ = events.send(TransportEvent::Disconnected).await;
                if closed_locally {
                    break;
                }
                log::warn!("Connection to {} lost", config.url);
            }
            Err(e) => {
                log::warn!("Connecting to {} failed: {e}", config.url);
            }
        }

        attempt = attempt.saturating_add(1);
        let Some(delay) = config.reconnect.delay_for(attempt) else {
            log::error!("Giving up on {} after {} attempts", config.url, attempt - 1);
            state.send_replace(ConnectionState::GaveUp);
            let _ = events.send(TransportEvent::GaveUp).await;
            return;
        };
        log::info!("Reconnecting in {delay:?}");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }

    state.send_replace(ConnectionState::Closed);
}

/// Shuttle frames until the socket closes. Returns `true` when the close
/// was requested locally.
async fn pump(
    socket: Socket,
    outgoing: &mut mpsc::Receiver<String>,
    events: &mpsc::Sender<TransportEvent>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    let (mut writer, mut reader) = socket.split();

    loop {
        tokio::select! {
            msg = reader.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if events.send(TransportEvent::Message(text.as_str().to_owned())).await.is_err() {
                        let _ = writer.send(Message::Close(None)).await;
                        return true;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return false,
                Some(Err(e)) => {
                    log::warn!("WebSocket read error: {e}");
                    return false;
                }
                Some(Ok(_)) => {}
            },
            out = outgoing.recv() => match out {
                Some(text) => {
                    if let Err(e) = writer.send(Message::text(text)).await {
                        log::warn!("WebSocket write error: {e}");
                        return false;
                    }
                }
                None => {
                    let _ = writer.send(Message::Close(None)).await;
                    return true;
                }
            },
            _ = shutdown.changed() => {
                let _ = writer.send(Message::Close(None)).await;
                return true;
            }
        }
    }
}
