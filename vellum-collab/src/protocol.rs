//! Wire protocol for collaborative note sessions.
//!
//! Every frame is a JSON text message tagged by a `type` field. Clients send
//! [`ClientMessage`]s; the server answers and fans out [`ServerEvent`]s.
//!
//! Client → Server            Server → Client
//! ─────────────────          ──────────────────────
//! block_update               connection_established
//! block_create               user_joined / user_left
//! block_delete               block_updated
//! block_reorder              block_created
//! cursor_position            block_deleted
//! user_selection             blocks_reordered
//!                            cursor_moved
//!                            user_selection_changed
//!
//! The protocol is lenient by design: a frame that fails to decode, names a
//! block that does not exist, or carries invalid content is dropped by the
//! server without a reply. Every server event carries the `user_id` and
//! `username` of the user whose action produced it, so receivers can
//! attribute remote changes without a second lookup.

use serde::{Serialize, Deserialize};
use serde_json::Value;
use std::error::Error;
use std::fmt;
use uuid::Uuid;

use vellum_core::{Block, BlockType, UserIdentity};

/// Errors that can occur during protocol operations
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolError {
    /// Failed to serialize message
    SerializationError(String),
    /// Failed to deserialize message
    DeserializationError(String),
    /// Connection closed unexpectedly
    ConnectionClosed,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::SerializationError(e) => write!(f, "serialization error: {}", e),
            ProtocolError::DeserializationError(e) => write!(f, "deserialization error: {}", e),
            ProtocolError::ConnectionClosed => write!(f, "connection closed"),
        }
    }
}

impl Error for ProtocolError {}

fn empty_content() -> Value {
    Value::Object(serde_json::Map::new())
}

/// A message sent by an editor client.
///
/// Unknown `type` tags and frames missing required fields fail to decode and
/// are dropped by the server. Optional fields take the defaults a fresh
/// editor would use: `block_create` with no payload produces an empty text
/// block at order 0.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replace a block's content.
    BlockUpdate {
        block_id: Uuid,
        #[serde(default)]
        content: Value,
    },
    /// Create a new block in the note.
    BlockCreate {
        #[serde(default)]
        block_type: BlockType,
        #[serde(default = "empty_content")]
        content: Value,
        #[serde(default)]
        order: u32,
    },
    /// Remove a block and its history.
    BlockDelete { block_id: Uuid },
    /// Reassign block positions: each listed block takes its index as order.
    BlockReorder { block_ids: Vec<Uuid> },
    /// Ephemeral caret position inside a block.
    CursorPosition {
        block_id: Uuid,
        #[serde(default)]
        position: u64,
    },
    /// Ephemeral text selection inside a block.
    UserSelection {
        block_id: Uuid,
        #[serde(default)]
        selection_start: u64,
        #[serde(default)]
        selection_end: u64,
    },
}

impl ClientMessage {
    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// An event the server fans out to room members.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Sent to a connection (and only that connection) once its join
    /// completes.
    ConnectionEstablished {
        note_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    /// A user's connection entered the room.
    UserJoined { user_id: Uuid, username: String },
    /// A user's connection left the room.
    UserLeft { user_id: Uuid, username: String },
    /// A block's content changed.
    BlockUpdated {
        block_id: Uuid,
        content: Value,
        user_id: Uuid,
        username: String,
    },
    /// A block was created; carries the full stored block so receivers can
    /// render it without a fetch.
    BlockCreated {
        block: Block,
        user_id: Uuid,
        username: String,
    },
    /// A block and its history were removed.
    BlockDeleted {
        block_id: Uuid,
        user_id: Uuid,
        username: String,
    },
    /// Blocks took new positions, in the order listed.
    BlocksReordered {
        block_ids: Vec<Uuid>,
        user_id: Uuid,
        username: String,
    },
    /// A user's caret moved.
    CursorMoved {
        block_id: Uuid,
        position: u64,
        user_id: Uuid,
        username: String,
    },
    /// A user's selection changed.
    UserSelectionChanged {
        block_id: Uuid,
        selection_start: u64,
        selection_end: u64,
        user_id: Uuid,
        username: String,
    },
}

impl ServerEvent {
    pub fn connection_established(note_id: Uuid, user: &UserIdentity) -> Self {
        ServerEvent::ConnectionEstablished {
            note_id,
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn user_joined(user: &UserIdentity) -> Self {
        ServerEvent::UserJoined {
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn user_left(user: &UserIdentity) -> Self {
        ServerEvent::UserLeft {
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn block_updated(block_id: Uuid, content: Value, user: &UserIdentity) -> Self {
        ServerEvent::BlockUpdated {
            block_id,
            content,
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn block_created(block: Block, user: &UserIdentity) -> Self {
        ServerEvent::BlockCreated {
            block,
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn block_deleted(block_id: Uuid, user: &UserIdentity) -> Self {
        ServerEvent::BlockDeleted {
            block_id,
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn blocks_reordered(block_ids: Vec<Uuid>, user: &UserIdentity) -> Self {
        ServerEvent::BlocksReordered {
            block_ids,
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn cursor_moved(block_id: Uuid, position: u64, user: &UserIdentity) -> Self {
        ServerEvent::CursorMoved {
            block_id,
            position,
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    pub fn selection_changed(
        block_id: Uuid,
        selection_start: u64,
        selection_end: u64,
        user: &UserIdentity,
    ) -> Self {
        ServerEvent::UserSelectionChanged {
            block_id,
            selection_start,
            selection_end,
            user_id: user.user_id,
            username: user.username.clone(),
        }
    }

    /// The user whose action produced this event.
    pub fn user_id(&self) -> Uuid {
        match self {
            ServerEvent::ConnectionEstablished { user_id, .. }
            | ServerEvent::UserJoined { user_id, .. }
            | ServerEvent::UserLeft { user_id, .. }
            | ServerEvent::BlockUpdated { user_id, .. }
            | ServerEvent::BlockCreated { user_id, .. }
            | ServerEvent::BlockDeleted { user_id, .. }
            | ServerEvent::BlocksReordered { user_id, .. }
            | ServerEvent::CursorMoved { user_id, .. }
            | ServerEvent::UserSelectionChanged { user_id, .. } => *user_id,
        }
    }

    /// Encode to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    /// Decode from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}
