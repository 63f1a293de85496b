//! Authentication and note-level access control.
//!
//! [`Authenticator`] turns a connect-time token into a [`UserIdentity`].
//! The server holds it as a trait object, so deployments plug in their own
//! identity provider; [`StaticTokenAuthenticator`] is the in-memory table
//! used by the bundled binary and the tests.
//!
//! [`PermissionGate`] answers one question: may this user open this note.
//! Owners and collaborators may; everyone else is turned away before they
//! reach the room.

use log::warn;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use uuid::Uuid;

use vellum_core::UserIdentity;

use crate::storage::NoteStore;

/// Resolves a connect-time token to a user, or rejects it.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Option<UserIdentity>;
}

/// Fixed token table. Registration replaces any previous holder of the
/// same token.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: RwLock<HashMap<String, UserIdentity>>,
}

impl StaticTokenAuthenticator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: impl Into<String>, user: UserIdentity) {
        if let Ok(mut tokens) = self.tokens.write() {
            tokens.insert(token.into(), user);
        }
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Option<UserIdentity> {
        self.tokens.read().ok()?.get(token).cloned()
    }
}

/// Edit-permission check backed by the note store.
pub struct PermissionGate {
    store: Arc<NoteStore>,
}

impl PermissionGate {
    pub fn new(store: Arc<NoteStore>) -> Self {
        Self { store }
    }

    /// Whether `user_id` may open and edit `note_id`. A missing note denies;
    /// an engine fault denies and is logged.
    pub fn check(&self, user_id: Uuid, note_id: Uuid) -> bool {
        match self.store.get_note(note_id) {
            Ok(note) => note.can_edit(user_id),
            Err(e) => {
                if !e.is_not_found() {
                    warn!("Permission check for note {} failed: {}", note_id, e);
                }
                false
            }
        }
    }
}
