//! The edit pipeline: validate, persist, version, then hand back the event
//! to broadcast.
//!
//! ```text
//!   client frame ──▶ validate ──▶ NoteStore commit ──▶ ServerEvent
//! ```
//!
//! The pipeline is stateless; ordering is the caller's concern. The server
//! holds the room's sequencer across commit and publish so every member
//! sees one note's block events in a single order.
//!
//! Rejections and faults are distinct: a missing block or bad payload is a
//! rejection (the frame is dropped without a reply), while an engine error
//! is a fault worth logging.

use log::debug;
use serde_json::Value;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use vellum_core::{validate_content, BlockType, ContentError, UserIdentity};

use crate::protocol::ServerEvent;
use crate::storage::{NoteStore, StoreError};

/// Why an edit did not go through.
#[derive(Debug, Clone, PartialEq)]
pub enum EditError {
    /// The payload failed per-type content validation.
    InvalidContent(ContentError),
    /// The store refused or failed the mutation.
    Store(StoreError),
}

impl fmt::Display for EditError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EditError::InvalidContent(e) => write!(f, "invalid content: {}", e),
            EditError::Store(e) => write!(f, "store error: {}", e),
        }
    }
}

impl Error for EditError {}

impl From<ContentError> for EditError {
    fn from(e: ContentError) -> Self {
        EditError::InvalidContent(e)
    }
}

impl From<StoreError> for EditError {
    fn from(e: StoreError) -> Self {
        EditError::Store(e)
    }
}

impl EditError {
    /// True when the edit was refused for a client-side reason (missing
    /// block, invalid payload) rather than failing inside the engine.
    pub fn is_rejection(&self) -> bool {
        match self {
            EditError::InvalidContent(_) => true,
            EditError::Store(e) => e.is_not_found(),
        }
    }
}

/// Applies block edits to the store and produces the events to fan out.
pub struct EditPipeline {
    store: Arc<NoteStore>,
}

impl EditPipeline {
    pub fn new(store: Arc<NoteStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<NoteStore> {
        &self.store
    }

    /// Replace a block's content and snapshot it if it changed.
    ///
    /// Content is taken as-is here; live typing routinely passes through
    /// partial states that would fail shape validation.
    pub fn update_content(
        &self,
        note_id: Uuid,
        block_id: Uuid,
        content: Value,
        author: &UserIdentity,
    ) -> Result<ServerEvent, EditError> {
        let (block, version) = self
            .store
            .update_block_content(note_id, block_id, content, author.user_id)?;
        if let Some(version) = &version {
            debug!("Block {} now at version {}", block_id, version.version_number);
        }
        Ok(ServerEvent::block_updated(block.id, block.content, author))
    }

    /// Create a block and announce it with its stored form.
    ///
    /// A bare create produces an empty block of the requested type; only
    /// non-empty payloads are held to the per-type shape.
    pub fn create_block(
        &self,
        note_id: Uuid,
        block_type: BlockType,
        content: Value,
        order: u32,
        author: &UserIdentity,
    ) -> Result<ServerEvent, EditError> {
        if !is_empty_object(&content) {
            validate_content(block_type, &content)?;
        }
        let block = self
            .store
            .create_block(note_id, block_type, content, order, author.user_id)?;
        Ok(ServerEvent::block_created(block, author))
    }

    /// Remove a block and its history.
    pub fn delete_block(
        &self,
        note_id: Uuid,
        block_id: Uuid,
        author: &UserIdentity,
    ) -> Result<ServerEvent, EditError> {
        self.store.delete_block(note_id, block_id)?;
        Ok(ServerEvent::block_deleted(block_id, author))
    }

    /// Reposition blocks; each id takes its index as order.
    pub fn reorder(
        &self,
        note_id: Uuid,
        block_ids: Vec<Uuid>,
        author: &UserIdentity,
    ) -> Result<ServerEvent, EditError> {
        self.store.reorder_blocks(note_id, &block_ids)?;
        Ok(ServerEvent::blocks_reordered(block_ids, author))
    }
}

fn is_empty_object(content: &Value) -> bool {
    content.as_object().map_or(false, |o| o.is_empty())
}
