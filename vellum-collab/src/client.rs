//! Client-side session handle for one collaborative note.
//!
//! [`CollabClient`] owns the socket through two spawned tasks: a writer
//! draining the outgoing queue, and a reader decoding server frames into
//! the [`CollabEvent`] stream the application consumes via
//! [`CollabClient::take_event_rx`].
//!
//! The client reports [`ClientState::Connected`] only once the server's
//! `connection_established` frame arrives. A server may still turn a
//! socket away after the handshake (bad token, unknown note, full room);
//! that surfaces as [`CollabEvent::Disconnected`] without ever passing
//! through `Connected`.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

use vellum_core::{BlockType, UserIdentity};

use crate::protocol::{ClientMessage, ProtocolError, ServerEvent};

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Client connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    /// Socket open, waiting for `connection_established`.
    Connecting,
    Connected,
}

/// What the application sees from a session.
#[derive(Debug, Clone, PartialEq)]
pub enum CollabEvent {
    /// The server accepted the session.
    Connected {
        note_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    /// The session ended, by either side.
    Disconnected,
    /// Something happened in the note.
    Remote(ServerEvent),
}

/// Client-side errors
#[derive(Debug, Clone, PartialEq)]
pub enum ClientError {
    /// No session; call connect first
    NotConnected,
    /// The WebSocket connection could not be opened
    ConnectionFailed(String),
    /// The writer task is gone
    ChannelClosed,
    /// Frame encoding failed
    Protocol(ProtocolError),
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConnected => write!(f, "not connected"),
            ClientError::ConnectionFailed(e) => write!(f, "connection failed: {}", e),
            ClientError::ChannelClosed => write!(f, "outgoing channel closed"),
            ClientError::Protocol(e) => write!(f, "protocol error: {}", e),
        }
    }
}

impl Error for ClientError {}

impl From<ProtocolError> for ClientError {
    fn from(e: ProtocolError) -> Self {
        ClientError::Protocol(e)
    }
}

/// A connection to one note's live session.
pub struct CollabClient {
    note_id: Uuid,
    server_url: String,
    token: String,
    state: Arc<RwLock<ClientState>>,
    identity: Arc<RwLock<Option<UserIdentity>>>,
    outgoing_tx: Option<mpsc::Sender<String>>,
    event_tx: mpsc::Sender<CollabEvent>,
    event_rx: Option<mpsc::Receiver<CollabEvent>>,
}

impl CollabClient {
    pub fn new(server_url: impl Into<String>, note_id: Uuid, token: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            note_id,
            server_url: server_url.into(),
            token: token.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            identity: Arc::new(RwLock::new(None)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Who the server says we are. None until the session is established.
    pub async fn identity(&self) -> Option<UserIdentity> {
        self.identity.read().await.clone()
    }

    /// Take the event stream. Yields once; later calls return None.
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<CollabEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and spawn the session tasks.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        let url = format!(
            "{}/ws/notes/{}/?token={}",
            self.server_url, self.note_id, self.token
        );
        info!("Connecting to note {} at {}", self.note_id, self.server_url);
        *self.state.write().await = ClientState::Connecting;

        let (ws_stream, _) = match connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                return Err(ClientError::ConnectionFailed(e.to_string()));
            }
        };

        let (ws_sender, ws_receiver) = ws_stream.split();
        let (out_tx, out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);

        tokio::spawn(write_loop(ws_sender, out_rx));
        tokio::spawn(read_loop(
            ws_receiver,
            Arc::clone(&self.state),
            Arc::clone(&self.identity),
            self.event_tx.clone(),
        ));

        Ok(())
    }

    /// Drop the session. The writer task closes the socket when its queue
    /// closes; the reader task then reports `Disconnected`.
    pub async fn disconnect(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ClientState::Disconnected;
    }

    pub async fn update_block(&self, block_id: Uuid, content: Value) -> Result<(), ClientError> {
        self.send(ClientMessage::BlockUpdate { block_id, content }).await
    }

    pub async fn create_block(
        &self,
        block_type: BlockType,
        content: Value,
        order: u32,
    ) -> Result<(), ClientError> {
        self.send(ClientMessage::BlockCreate {
            block_type,
            content,
            order,
        })
        .await
    }

    pub async fn delete_block(&self, block_id: Uuid) -> Result<(), ClientError> {
        self.send(ClientMessage::BlockDelete { block_id }).await
    }

    pub async fn reorder_blocks(&self, block_ids: Vec<Uuid>) -> Result<(), ClientError> {
        self.send(ClientMessage::BlockReorder { block_ids }).await
    }

    pub async fn send_cursor(&self, block_id: Uuid, position: u64) -> Result<(), ClientError> {
        self.send(ClientMessage::CursorPosition { block_id, position }).await
    }

    pub async fn send_selection(
        &self,
        block_id: Uuid,
        selection_start: u64,
        selection_end: u64,
    ) -> Result<(), ClientError> {
        self.send(ClientMessage::UserSelection {
            block_id,
            selection_start,
            selection_end,
        })
        .await
    }

    async fn send(&self, msg: ClientMessage) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        let text = msg.encode()?;
        tx.send(text).await.map_err(|_| ClientError::ChannelClosed)
    }
}

async fn write_loop(mut ws_sender: WsSink, mut out_rx: mpsc::Receiver<String>) {
    while let Some(text) = out_rx.recv().await {
        if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
            debug!("Client write failed: {}", e);
            break;
        }
    }
    let _ = ws_sender.close().await;
}

async fn read_loop(
    mut ws_receiver: WsSource,
    state: Arc<RwLock<ClientState>>,
    identity: Arc<RwLock<Option<UserIdentity>>>,
    event_tx: mpsc::Sender<CollabEvent>,
) {
    while let Some(frame) = ws_receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match ServerEvent::decode(&text) {
                Ok(ServerEvent::ConnectionEstablished {
                    note_id,
                    user_id,
                    username,
                }) => {
                    *state.write().await = ClientState::Connected;
                    *identity.write().await =
                        Some(UserIdentity::with_id(user_id, username.clone()));
                    let _ = event_tx
                        .send(CollabEvent::Connected {
                            note_id,
                            user_id,
                            username,
                        })
                        .await;
                }
                Ok(event) => {
                    let _ = event_tx.send(CollabEvent::Remote(event)).await;
                }
                Err(e) => debug!("Ignoring undecodable frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Client read failed: {}", e);
                break;
            }
        }
    }
    *state.write().await = ClientState::Disconnected;
    let _ = event_tx.send(CollabEvent::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_new_client_is_disconnected() {
        let client = CollabClient::new("ws://127.0.0.1:1", Uuid::new_v4(), "token");
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert_eq!(client.identity().await, None);
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let client = CollabClient::new("ws://127.0.0.1:1", Uuid::new_v4(), "token");
        let err = client
            .update_block(Uuid::new_v4(), json!({"text": "x"}))
            .await
            .unwrap_err();
        assert_eq!(err, ClientError::NotConnected);
    }

    #[tokio::test]
    async fn test_event_rx_yields_once() {
        let mut client = CollabClient::new("ws://127.0.0.1:1", Uuid::new_v4(), "token");
        assert!(client.take_event_rx().is_some());
        assert!(client.take_event_rx().is_none());
    }

    #[tokio::test]
    async fn test_connect_to_unreachable_server() {
        // Port 1 should refuse immediately
        let mut client = CollabClient::new("ws://127.0.0.1:1", Uuid::new_v4(), "token");
        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionFailed(_)));
        assert_eq!(client.state().await, ClientState::Disconnected);
    }
}
