//! # Vellum Collab
//!
//! Real-time collaborative note editing over WebSocket, with persistent
//! blocks and per-block version history.
//!
//! ## Architecture
//!
//! ```text
//!    editors (WebSocket clients)
//!         │
//!         ▼
//!   ┌──────────────┐  authenticate + permission gate
//!   │ CollabServer │◀───────────────▶ Authenticator / PermissionGate
//!   └──────┬───────┘
//!          │ join / leave
//!          ▼
//!   ┌──────────────┐             ┌──────┐
//!   │ RoomRegistry │── note_id ─▶│ Room │  fan-out, echo suppression
//!   └──────────────┘             └──┬───┘
//!                                   │ sequenced edits
//!                                   ▼
//!                            ┌──────────────┐      ┌─────────────┐
//!                            │ EditPipeline │─────▶│  NoteStore  │
//!                            └──────────────┘      │  (RocksDB)  │
//!                                                  └─────────────┘
//! ```
//!
//! One room per open note. Every accepted edit commits to the store and
//! broadcasts to the room as a single sequenced step, excluding the
//! connection that sent it; a block's history is always versions 1..N
//! with no gaps.

pub mod auth;
pub mod client;
pub mod pipeline;
pub mod presence;
pub mod protocol;
pub mod room;
pub mod server;
pub mod storage;

pub use auth::{Authenticator, PermissionGate, StaticTokenAuthenticator};
pub use client::{ClientError, ClientState, CollabClient, CollabEvent};
pub use pipeline::{EditError, EditPipeline};
pub use presence::{PresenceRoster, RemoteUser};
pub use protocol::{ClientMessage, ProtocolError, ServerEvent};
pub use room::{Admission, Room, RoomMember, RoomRegistry, RoomStats};
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use storage::{NoteStore, StoreConfig, StoreError};
