use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use serde_json::Value;
use uuid::Uuid;

pub mod content;

pub use content::{validate_content, ContentError};

/// An authenticated user's identity as seen by the sync layer.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: Uuid,
    pub username: String,
}

impl UserIdentity {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            username: username.into(),
        }
    }

    /// Create with an explicit user id (for testing and token tables).
    pub fn with_id(user_id: Uuid, username: impl Into<String>) -> Self {
        Self {
            user_id,
            username: username.into(),
        }
    }
}

/// The closed set of block kinds an editor can place in a note.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    #[default]
    Text,
    Heading,
    Code,
    Latex,
    Image,
    Table,
    List,
}

impl BlockType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockType::Text => "text",
            BlockType::Heading => "heading",
            BlockType::Code => "code",
            BlockType::Latex => "latex",
            BlockType::Image => "image",
            BlockType::Table => "table",
            BlockType::List => "list",
        }
    }
}

/// A collaboratively edited note: an ordered collection of typed blocks
/// owned by one user and shared with a set of collaborators.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Note {
    pub id: Uuid,
    pub title: String,
    pub owner: Uuid,
    /// Users granted edit access. The owner is implicitly a collaborator
    /// and never appears in this list.
    pub collaborators: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Note {
    pub fn new(owner: Uuid, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            owner,
            collaborators: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn untitled(owner: Uuid) -> Self {
        Self::new(owner, "Untitled Note")
    }

    /// Whether `user_id` may view and edit this note (owner or collaborator).
    pub fn can_edit(&self, user_id: Uuid) -> bool {
        self.owner == user_id || self.collaborators.contains(&user_id)
    }

    /// Grant edit access. Returns false if the user is the owner or already
    /// a collaborator.
    pub fn add_collaborator(&mut self, user_id: Uuid) -> bool {
        if user_id == self.owner || self.collaborators.contains(&user_id) {
            return false;
        }
        self.collaborators.push(user_id);
        true
    }

    /// Revoke edit access. Returns false if the user was not a collaborator.
    pub fn remove_collaborator(&mut self, user_id: Uuid) -> bool {
        let before = self.collaborators.len();
        self.collaborators.retain(|id| *id != user_id);
        self.collaborators.len() != before
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One typed content unit within a note.
///
/// `content` is an opaque JSON object whose required fields depend on
/// `block_type` (see [`content::validate_content`]). `order` positions the
/// block within its note.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct Block {
    pub id: Uuid,
    pub note_id: Uuid,
    pub block_type: BlockType,
    pub content: Value,
    pub order: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Block {
    pub fn new(note_id: Uuid, block_type: BlockType, content: Value, order: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            note_id,
            block_type,
            content,
            order,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// An immutable snapshot of a block's content at one point in its history.
///
/// Version numbers are per-block, start at 1, and increase by exactly one
/// per snapshot, so a block's history is always 1..N with no gaps.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct BlockVersion {
    pub id: Uuid,
    pub block_id: Uuid,
    pub content: Value,
    pub created_by: Uuid,
    pub version_number: u64,
    pub created_at: DateTime<Utc>,
}

impl BlockVersion {
    pub fn new(block_id: Uuid, content: Value, created_by: Uuid, version_number: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            block_id,
            content,
            created_by,
            version_number,
            created_at: Utc::now(),
        }
    }
}
