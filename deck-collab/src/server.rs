//! Relay server: routes envelopes between the participants of a
//! presentation.
//!
//! ```text
//! Client A ──┐                                   ┌──► Client B
//!            ├── /ws/presentations/{id}/ ── Room ┤
//! Client C ──┘      (BroadcastGroup)             └──► Client C
//! ```
//!
//! The relay holds no document state. It identifies each connection from
//! the handshake query (`user_id`, `username`, `permission`), attaches the
//! sender to every frame it forwards, and refuses editing envelopes from
//! viewers with an `{"error": ...}` frame. Persistence stays with the
//! server of record.

use std::net::SocketAddr;
use std::sync::Arc;

use deck_core::{ParticipantId, Permission, PresentationId};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use reqwest::Url;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Joined, PeerInfo, RelayMessage, RoomManager};
use crate::config::RelayConfig;
use crate::protocol::{attach_sender, error_frame, is_edit_type, peek_type, Envelope, Sender};

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub rejected_messages: u64,
    pub active_rooms: usize,
}

/// Who is connecting to which presentation, from the handshake request.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectTarget {
    pub presentation_id: PresentationId,
    pub user_id: ParticipantId,
    pub username: String,
    pub permission: Permission,
}

impl ConnectTarget {
    /// Parse `/ws/presentations/{id}/?user_id=..&username=..&permission=..`.
    pub fn from_uri(uri: &Uri) -> Result<Self, (StatusCode, String)> {
        let presentation_id = uri
            .path()
            .strip_prefix("/ws/presentations/")
            .map(|rest| rest.trim_end_matches('/'))
            .and_then(|id| id.parse::<i64>().ok())
            .map(PresentationId)
            .ok_or_else(|| (StatusCode::NOT_FOUND, format!("no presentation channel at {}", uri.path())))?;

        let query = Url::parse(&format!("ws://relay/?{}", uri.query().unwrap_or_default()))
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
        let param = |key: &str| {
            query
                .query_pairs()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.into_owned())
        };

        let user_id = param("user_id")
            .and_then(|id| id.parse::<i64>().ok())
            .map(ParticipantId)
            .ok_or_else(|| (StatusCode::UNAUTHORIZED, "missing or invalid user_id".to_string()))?;
        let username = param("username")
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| format!("User {user_id}"));
        let permission = param("permission")
            .map(|label| Permission::from_label(&label))
            .unwrap_or_default();

        Ok(Self {
            presentation_id,
            user_id,
            username,
            permission,
        })
    }
}

pub struct RelayServer {
    config: RelayConfig,
    rooms: Arc<RoomManager>,
    stats: Arc<RwLock<RelayStats>>,
}

impl RelayServer {
    pub fn new(config: RelayConfig) -> Self {
        let rooms = Arc::new(RoomManager::new(config.broadcast_capacity));
        Self {
            config,
            rooms,
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RelayConfig::default())
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    pub async fn stats(&self) -> RelayStats {
        self.stats.read().await.clone()
    }

    /// Bind the configured address and serve until the process exits.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay listening on {}", self.config.bind_addr);
        self.serve(listener).await
    }

    /// Bind the configured address (port 0 picks a free one) and serve in
    /// the background.
    pub async fn spawn(self) -> std::io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        log::info!("Relay listening on {addr}");
        let task = tokio::spawn(async move {
            if let Err(e) = self.serve(listener).await {
                log::error!("Relay stopped: {e}");
            }
        });
        Ok((addr, task))
    }

    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let rooms = self.rooms.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, rooms, stats).await {
                    log::warn!("Connection from {addr} ended with error: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        rooms: Arc<RoomManager>,
        stats: Arc<RwLock<RelayStats>>,
    ) -> Result<(), BoxError> {
        let mut target: Option<ConnectTarget> = None;
        let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
            match ConnectTarget::from_uri(request.uri()) {
                Ok(parsed) => {
                    target = Some(parsed);
                    Ok(response)
                }
                Err((status, reason)) => {
                    log::warn!("Rejecting handshake from {addr}: {reason}");
                    let mut rejection = ErrorResponse::new(Some(reason));
                    *rejection.status_mut() = status;
                    Err(rejection)
                }
            }
        };
        let socket = tokio_tungstenite::accept_hdr_async(stream, callback).await?;
        let Some(target) = target else {
            return Ok(());
        };

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let peer = PeerInfo::new(target.user_id, target.username.clone(), target.permission);
        let connection_id = peer.connection_id;
        let sender = peer.sender();
        let Joined {
            room,
            already_here,
            receiver: mut rx,
        } = rooms.join(target.presentation_id, peer).await;
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
            s.active_rooms = rooms.room_count().await;
        }
        log::info!(
            "{} ({}, {}) joined presentation {}",
            target.username,
            target.user_id,
            target.permission.as_str(),
            target.presentation_id
        );

        // From here on the peer is registered; errors must fall through to
        // the cleanup below.
        let result = match Self::announce(
            &mut ws_sender,
            already_here,
            &room,
            &target,
            connection_id,
        )
        .await
        {
            Ok(()) => {
                Self::relay_loop(
                    &mut ws_sender,
                    &mut ws_receiver,
                    &mut rx,
                    &room,
                    &target,
                    connection_id,
                    &sender,
                    &stats,
                )
                .await
            }
            Err(e) => Err(e),
        };

        let departure = rooms.leave(target.presentation_id, &connection_id).await;
        if departure.peer.is_some() && !departure.still_present && !departure.room_closed {
            let left = Envelope::UserLeft {
                user_id: target.user_id,
                username: Some(target.username.clone()),
            };
            match left.encode() {
                Ok(text) => {
                    room.broadcast(connection_id, text);
                }
                Err(e) => log::error!("Failed to encode user_left: {e}"),
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
            s.active_rooms = rooms.room_count().await;
        }
        log::info!(
            "{} ({}) left presentation {}",
            target.username,
            target.user_id,
            target.presentation_id
        );
        result
    }

    /// Tell the newcomer who is already present, then tell everyone else.
    async fn announce(
        ws_sender: &mut WsSink,
        already_here: Vec<PeerInfo>,
        room: &BroadcastGroup,
        target: &ConnectTarget,
        connection_id: Uuid,
    ) -> Result<(), BoxError> {
        let mut announced = Vec::new();
        for existing in already_here {
            if existing.user_id == target.user_id || announced.contains(&existing.user_id) {
                continue;
            }
            announced.push(existing.user_id);
            let joined = Envelope::UserJoined {
                user_id: existing.user_id,
                username: existing.username,
            };
            ws_sender.send(Message::text(joined.encode()?)).await?;
        }
        let joined = Envelope::UserJoined {
            user_id: target.user_id,
            username: target.username.clone(),
        };
        room.broadcast(connection_id, joined.encode()?);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn relay_loop(
        ws_sender: &mut WsSink,
        ws_receiver: &mut WsSource,
        rx: &mut broadcast::Receiver<Arc<RelayMessage>>,
        room: &BroadcastGroup,
        target: &ConnectTarget,
        connection_id: Uuid,
        sender: &Sender,
        stats: &RwLock<RelayStats>,
    ) -> Result<(), BoxError> {
        loop {
            tokio::select! {
                msg = ws_receiver.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.write().await.total_messages += 1;
                        match Self::route(text.as_str(), target.permission, sender) {
                            Ok(forward) => {
                                room.broadcast(connection_id, forward);
                            }
                            Err(reason) => {
                                log::debug!("Rejected frame from {}: {reason}", target.user_id);
                                stats.write().await.rejected_messages += 1;
                                ws_sender.send(Message::text(error_frame(&reason))).await?;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },
                msg = rx.recv() => match msg {
                    Ok(message) => {
                        if message.from != connection_id {
                            ws_sender.send(Message::text(message.text.clone())).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("Connection of {} lagged by {skipped} messages", target.user_id);
                        room.record_lag(skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Validate an inbound frame and attach its sender. Unknown envelope
    /// types are forwarded; receivers ignore them.
    fn route(raw: &str, permission: Permission, sender: &Sender) -> Result<String, String> {
        let value: Value = serde_json::from_str(raw).map_err(|_| "Invalid JSON".to_string())?;
        let type_name = peek_type(&value).ok_or_else(|| "Missing message type".to_string())?;
        if is_edit_type(type_name) && !permission.can_edit() {
            return Err("Permission denied: read-only access".to_string());
        }
        attach_sender(raw, sender).map_err(|e| e.to_string())
    }
}
