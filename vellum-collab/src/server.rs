//! WebSocket sync server for collaborative note sessions.
//!
//! Connection lifecycle:
//!
//! ```text
//!  connect ──▶ handshake ──▶ authenticate ──▶ permission gate
//!                                                   │
//!                         rejected: close ◀─────────┤
//!                                                   ▼
//!                                         join room (capacity check)
//!                                                   │
//!                                                   ▼
//!                                  connection_established (self only)
//!                                  user_joined (everyone else)
//!                                                   │
//!                                                   ▼
//!                         ┌──────── select! loop ─────────┐
//!                         │ inbound frame  → dispatch     │
//!                         │ outbound queue → socket       │
//!                         └───────────────────────────────┘
//!                                                   │ close / error
//!                                                   ▼
//!                                  user_left (everyone else)
//!                                  leave room, retire if empty
//! ```
//!
//! Block edits are serialized per room: the dispatcher holds the room's
//! sequencer across the store commit and the broadcast, so every member
//! observes one note's edits in a single order. Cursor and selection
//! frames touch neither the store nor the sequencer.
//!
//! The protocol is lenient. Malformed frames, edits against missing
//! blocks, and invalid payloads are dropped without a reply; only engine
//! faults make it into the log at warn level.

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use uuid::Uuid;

use vellum_core::UserIdentity;

use crate::auth::{Authenticator, PermissionGate};
use crate::pipeline::EditPipeline;
use crate::protocol::{ClientMessage, ServerEvent};
use crate::room::{Room, RoomMember, RoomRegistry};
use crate::storage::NoteStore;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Maximum connections per note room
    pub max_members_per_room: usize,
    /// Outbound frame queue depth per connection
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_members_per_room: 64,
            queue_capacity: 256,
        }
    }
}

/// Server runtime statistics
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: usize,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub rejected_connections: u64,
}

/// The collaborative editing server. All shared state is injected at
/// construction; nothing lives in globals.
pub struct CollabServer {
    config: ServerConfig,
    registry: Arc<RoomRegistry>,
    pipeline: Arc<EditPipeline>,
    gate: Arc<PermissionGate>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(
        config: ServerConfig,
        store: Arc<NoteStore>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let registry = Arc::new(RoomRegistry::new(config.max_members_per_room));
        let gate = Arc::new(PermissionGate::new(Arc::clone(&store)));
        let pipeline = Arc::new(EditPipeline::new(store));
        Self {
            config,
            registry,
            pipeline,
            gate,
            authenticator,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<NoteStore> {
        self.pipeline.store()
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Accept connections until the task is cancelled.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("Collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            let registry = Arc::clone(&self.registry);
            let pipeline = Arc::clone(&self.pipeline);
            let gate = Arc::clone(&self.gate);
            let authenticator = Arc::clone(&self.authenticator);
            let stats = Arc::clone(&self.stats);
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(
                    stream,
                    addr,
                    registry,
                    pipeline,
                    gate,
                    authenticator,
                    stats,
                    config,
                )
                .await
                {
                    debug!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    registry: Arc<RoomRegistry>,
    pipeline: Arc<EditPipeline>,
    gate: Arc<PermissionGate>,
    authenticator: Arc<dyn Authenticator>,
    stats: Arc<RwLock<ServerStats>>,
    config: ServerConfig,
) -> Result<(), WsError> {
    // The note id and token travel in the request URI; capture it during
    // the handshake.
    let mut request_uri: Option<String> = None;
    let ws_stream = accept_hdr_async(stream, |req: &Request, resp: Response| {
        request_uri = Some(req.uri().to_string());
        Ok(resp)
    })
    .await?;

    debug!("WebSocket connection from {}", addr);

    let (note_id, token) = match request_uri.as_deref().and_then(parse_connect_uri) {
        Some(parts) => parts,
        None => {
            warn!("Connection from {} used an unrecognized path", addr);
            return reject(ws_stream, &stats).await;
        }
    };

    let user = match token.as_deref().and_then(|t| authenticator.authenticate(t)) {
        Some(user) => user,
        None => {
            info!("Connection from {} presented no valid token", addr);
            return reject(ws_stream, &stats).await;
        }
    };

    if !gate.check(user.user_id, note_id) {
        info!("User {} denied access to note {}", user.username, note_id);
        return reject(ws_stream, &stats).await;
    }

    let connection_id = Uuid::new_v4();
    let (out_tx, mut out_rx) = mpsc::channel::<Arc<String>>(config.queue_capacity);
    let member = RoomMember::new(connection_id, user.clone(), out_tx);

    let room = match registry.join(note_id, member).await {
        Some(room) => room,
        None => {
            info!("Note {} is at capacity, rejecting {}", note_id, user.username);
            return reject(ws_stream, &stats).await;
        }
    };

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }
    info!("{} joined note {} ({})", user.username, note_id, connection_id);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Only the joining connection receives the established frame.
    let established_ok = match ServerEvent::connection_established(note_id, &user).encode() {
        Ok(text) => ws_sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            error!("Failed to encode connection_established: {}", e);
            false
        }
    };

    // From here on, errors break out of the loop instead of returning, so
    // the departure broadcast and the registry leave always run.
    if established_ok {
        room.broadcast(&ServerEvent::user_joined(&user), Some(connection_id))
            .await;

        loop {
            tokio::select! {
                inbound = ws_receiver.next() => {
                    match inbound {
                        Some(Ok(Message::Text(text))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.total_bytes += text.len() as u64;
                            }
                            match ClientMessage::decode(&text) {
                                Ok(msg) => {
                                    dispatch(msg, &room, &pipeline, note_id, &user, connection_id)
                                        .await;
                                }
                                Err(e) => {
                                    debug!("Dropping malformed frame from {}: {}", connection_id, e);
                                }
                            }
                        }
                        Some(Ok(Message::Binary(_))) => {
                            debug!("Dropping unexpected binary frame from {}", connection_id);
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if ws_sender.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            debug!("WebSocket error from {}: {}", connection_id, e);
                            break;
                        }
                    }
                }
                outbound = out_rx.recv() => {
                    match outbound {
                        Some(frame) => {
                            if ws_sender.send(Message::Text(frame.as_str().into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }

        // Departure is announced while the membership still stands, and
        // dropped immediately after.
        room.broadcast(&ServerEvent::user_left(&user), Some(connection_id))
            .await;
    }

    registry.leave(&note_id, &connection_id).await;
    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }
    info!("{} left note {} ({})", user.username, note_id, connection_id);

    Ok(())
}

/// Close a connection that never made it into a room.
async fn reject(
    mut ws_stream: WebSocketStream<TcpStream>,
    stats: &RwLock<ServerStats>,
) -> Result<(), WsError> {
    stats.write().await.rejected_connections += 1;
    let _ = ws_stream.close(None).await;
    Ok(())
}

/// Apply one client frame. Edits take the room sequencer across commit and
/// broadcast; presence frames are fanned out directly.
async fn dispatch(
    msg: ClientMessage,
    room: &Room,
    pipeline: &EditPipeline,
    note_id: Uuid,
    user: &UserIdentity,
    connection_id: Uuid,
) {
    match msg {
        ClientMessage::BlockUpdate { block_id, content } => {
            if content.is_null() {
                debug!("Ignoring block_update without content for {}", block_id);
                return;
            }
            let _guard = room.sequencer().lock().await;
            match pipeline.update_content(note_id, block_id, content, user) {
                Ok(event) => {
                    room.broadcast(&event, Some(connection_id)).await;
                }
                Err(e) if e.is_rejection() => debug!("Dropped block_update for {}: {}", block_id, e),
                Err(e) => warn!("block_update for {} failed: {}", block_id, e),
            }
        }
        ClientMessage::BlockCreate {
            block_type,
            content,
            order,
        } => {
            let _guard = room.sequencer().lock().await;
            match pipeline.create_block(note_id, block_type, content, order, user) {
                Ok(event) => {
                    room.broadcast(&event, Some(connection_id)).await;
                }
                Err(e) if e.is_rejection() => debug!("Dropped block_create: {}", e),
                Err(e) => warn!("block_create failed: {}", e),
            }
        }
        ClientMessage::BlockDelete { block_id } => {
            let _guard = room.sequencer().lock().await;
            match pipeline.delete_block(note_id, block_id, user) {
                Ok(event) => {
                    room.broadcast(&event, Some(connection_id)).await;
                }
                Err(e) if e.is_rejection() => debug!("Dropped block_delete for {}: {}", block_id, e),
                Err(e) => warn!("block_delete for {} failed: {}", block_id, e),
            }
        }
        ClientMessage::BlockReorder { block_ids } => {
            if block_ids.is_empty() {
                debug!("Ignoring empty block_reorder");
                return;
            }
            let _guard = room.sequencer().lock().await;
            match pipeline.reorder(note_id, block_ids, user) {
                Ok(event) => {
                    room.broadcast(&event, Some(connection_id)).await;
                }
                Err(e) if e.is_rejection() => debug!("Dropped block_reorder: {}", e),
                Err(e) => warn!("block_reorder failed: {}", e),
            }
        }
        ClientMessage::CursorPosition { block_id, position } => {
            room.broadcast(
                &ServerEvent::cursor_moved(block_id, position, user),
                Some(connection_id),
            )
            .await;
        }
        ClientMessage::UserSelection {
            block_id,
            selection_start,
            selection_end,
        } => {
            room.broadcast(
                &ServerEvent::selection_changed(block_id, selection_start, selection_end, user),
                Some(connection_id),
            )
            .await;
        }
    }
}

/// Extract the note id and token from a connect path of the form
/// `/ws/notes/{note_id}/?token={token}`. The trailing slash is optional.
fn parse_connect_uri(uri: &str) -> Option<(Uuid, Option<String>)> {
    let (path, query) = match uri.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (uri, None),
    };

    let note_id = path
        .strip_prefix("/ws/notes/")?
        .trim_end_matches('/')
        .parse::<Uuid>()
        .ok()?;

    let token = query.and_then(|q| {
        q.split('&')
            .find_map(|pair| pair.strip_prefix("token="))
            .map(|t| t.to_string())
    });

    Some((note_id, token))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect_uri() {
        let note_id = Uuid::new_v4();

        let uri = format!("/ws/notes/{}/?token=abc123", note_id);
        assert_eq!(
            parse_connect_uri(&uri),
            Some((note_id, Some("abc123".to_string())))
        );

        // Trailing slash optional, token optional
        let uri = format!("/ws/notes/{}", note_id);
        assert_eq!(parse_connect_uri(&uri), Some((note_id, None)));

        // Token among other query parameters
        let uri = format!("/ws/notes/{}/?client=web&token=t&v=2", note_id);
        assert_eq!(parse_connect_uri(&uri), Some((note_id, Some("t".to_string()))));
    }

    #[test]
    fn test_parse_connect_uri_rejects_garbage() {
        assert_eq!(parse_connect_uri("/ws/docs/abc"), None);
        assert_eq!(parse_connect_uri("/ws/notes/not-a-uuid/"), None);
        assert_eq!(parse_connect_uri(""), None);
        assert_eq!(parse_connect_uri("/"), None);
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert!(config.max_members_per_room > 0);
        assert!(config.queue_capacity > 0);
    }
}
