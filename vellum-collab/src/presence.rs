//! Client-side presence: who is in the note, where their cursors and
//! selections sit.
//!
//! [`PresenceRoster`] folds the server's presence events into a per-user
//! view and throttles outgoing cursor traffic so a fast typist does not
//! flood the room. The default interval is 33ms, about thirty cursor
//! frames per second.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::protocol::{ClientMessage, ServerEvent};

/// Where a remote user's caret last was.
#[derive(Debug, Clone)]
pub struct CursorState {
    pub block_id: Uuid,
    pub position: u64,
    updated: Instant,
}

impl CursorState {
    fn new(block_id: Uuid, position: u64) -> Self {
        Self {
            block_id,
            position,
            updated: Instant::now(),
        }
    }

    /// Time since the last move.
    pub fn time_since_update(&self) -> Duration {
        self.updated.elapsed()
    }
}

/// A remote user's active selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionState {
    pub block_id: Uuid,
    pub selection_start: u64,
    pub selection_end: u64,
}

/// Everything known about one other user in the room.
#[derive(Debug, Clone)]
pub struct RemoteUser {
    pub user_id: Uuid,
    pub username: String,
    pub cursor: Option<CursorState>,
    pub selection: Option<SelectionState>,
}

impl RemoteUser {
    fn new(user_id: Uuid, username: String) -> Self {
        Self {
            user_id,
            username,
            cursor: None,
            selection: None,
        }
    }
}

/// Tracks the other members of a note session.
///
/// Events attributed to the local user are ignored wholesale; the server
/// already suppresses echo per connection, and a user's other tabs are
/// not "remote" for presence purposes.
pub struct PresenceRoster {
    local_user_id: Uuid,
    users: HashMap<Uuid, RemoteUser>,
    local_cursor: Option<(Uuid, u64)>,
    last_cursor_broadcast: Instant,
    cursor_broadcast_interval: Duration,
}

impl PresenceRoster {
    pub fn new(local_user_id: Uuid) -> Self {
        Self::with_interval(local_user_id, Duration::from_millis(33))
    }

    pub fn with_interval(local_user_id: Uuid, cursor_broadcast_interval: Duration) -> Self {
        Self {
            local_user_id,
            users: HashMap::new(),
            local_cursor: None,
            // Backdated so the first cursor goes out immediately
            last_cursor_broadcast: Instant::now() - Duration::from_secs(1),
            cursor_broadcast_interval,
        }
    }

    /// Fold one server event into the roster.
    pub fn handle_event(&mut self, event: &ServerEvent) {
        if event.user_id() == self.local_user_id {
            return;
        }

        match event {
            ServerEvent::UserJoined { user_id, username } => {
                self.users
                    .entry(*user_id)
                    .or_insert_with(|| RemoteUser::new(*user_id, username.clone()));
            }
            ServerEvent::UserLeft { user_id, .. } => {
                self.users.remove(user_id);
            }
            ServerEvent::CursorMoved {
                block_id,
                position,
                user_id,
                username,
            } => {
                // A cursor can arrive before the join was observed; create
                // the entry on the spot.
                let user = self
                    .users
                    .entry(*user_id)
                    .or_insert_with(|| RemoteUser::new(*user_id, username.clone()));
                user.cursor = Some(CursorState::new(*block_id, *position));
            }
            ServerEvent::UserSelectionChanged {
                block_id,
                selection_start,
                selection_end,
                user_id,
                username,
            } => {
                let user = self
                    .users
                    .entry(*user_id)
                    .or_insert_with(|| RemoteUser::new(*user_id, username.clone()));
                user.selection = Some(SelectionState {
                    block_id: *block_id,
                    selection_start: *selection_start,
                    selection_end: *selection_end,
                });
            }
            _ => {}
        }
    }

    /// Record the local caret and, if the throttle window has passed,
    /// return the frame to send.
    pub fn update_local_cursor(&mut self, block_id: Uuid, position: u64) -> Option<ClientMessage> {
        self.local_cursor = Some((block_id, position));
        if self.last_cursor_broadcast.elapsed() < self.cursor_broadcast_interval {
            return None;
        }
        self.last_cursor_broadcast = Instant::now();
        Some(ClientMessage::CursorPosition { block_id, position })
    }

    /// The latest local cursor frame regardless of throttling, for the
    /// trailing update after a burst.
    pub fn flush_local_cursor(&mut self) -> Option<ClientMessage> {
        let (block_id, position) = self.local_cursor?;
        self.last_cursor_broadcast = Instant::now();
        Some(ClientMessage::CursorPosition { block_id, position })
    }

    /// Selection changes are not throttled; they happen at human speed.
    pub fn selection_message(
        &self,
        block_id: Uuid,
        selection_start: u64,
        selection_end: u64,
    ) -> ClientMessage {
        ClientMessage::UserSelection {
            block_id,
            selection_start,
            selection_end,
        }
    }

    pub fn user(&self, user_id: &Uuid) -> Option<&RemoteUser> {
        self.users.get(user_id)
    }

    pub fn remote_users(&self) -> Vec<&RemoteUser> {
        self.users.values().collect()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }

    /// Remote users whose cursor currently sits in `block_id`.
    pub fn users_in_block(&self, block_id: Uuid) -> Vec<&RemoteUser> {
        self.users
            .values()
            .filter(|u| u.cursor.as_ref().map_or(false, |c| c.block_id == block_id))
            .collect()
    }

    pub fn clear(&mut self) {
        self.users.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vellum_core::UserIdentity;

    fn roster() -> (PresenceRoster, UserIdentity) {
        let local = UserIdentity::new("me");
        (PresenceRoster::new(local.user_id), local)
    }

    #[test]
    fn test_join_and_leave() {
        let (mut roster, _local) = roster();
        let remote = UserIdentity::new("them");

        roster.handle_event(&ServerEvent::user_joined(&remote));
        assert_eq!(roster.user_count(), 1);
        assert_eq!(
            roster.user(&remote.user_id).map(|u| u.username.as_str()),
            Some("them")
        );

        roster.handle_event(&ServerEvent::user_left(&remote));
        assert_eq!(roster.user_count(), 0);
    }

    #[test]
    fn test_own_events_ignored() {
        let (mut roster, local) = roster();

        roster.handle_event(&ServerEvent::user_joined(&local));
        roster.handle_event(&ServerEvent::cursor_moved(Uuid::new_v4(), 5, &local));
        assert_eq!(roster.user_count(), 0);
    }

    #[test]
    fn test_cursor_creates_missing_entry() {
        let (mut roster, _local) = roster();
        let remote = UserIdentity::new("late");
        let block_id = Uuid::new_v4();

        // No user_joined seen for this user
        roster.handle_event(&ServerEvent::cursor_moved(block_id, 7, &remote));

        let user = roster.user(&remote.user_id).unwrap();
        assert_eq!(user.username, "late");
        let cursor = user.cursor.as_ref().unwrap();
        assert_eq!((cursor.block_id, cursor.position), (block_id, 7));
    }

    #[test]
    fn test_selection_tracking() {
        let (mut roster, _local) = roster();
        let remote = UserIdentity::new("them");
        let block_id = Uuid::new_v4();

        roster.handle_event(&ServerEvent::user_joined(&remote));
        roster.handle_event(&ServerEvent::selection_changed(block_id, 2, 9, &remote));

        let selection = roster
            .user(&remote.user_id)
            .and_then(|u| u.selection.clone())
            .unwrap();
        assert_eq!(
            selection,
            SelectionState {
                block_id,
                selection_start: 2,
                selection_end: 9
            }
        );
    }

    #[test]
    fn test_cursor_throttle() {
        let local = UserIdentity::new("me");
        let mut roster = PresenceRoster::with_interval(local.user_id, Duration::from_millis(500));
        let block_id = Uuid::new_v4();

        // First update passes, the immediate second is throttled
        assert!(roster.update_local_cursor(block_id, 1).is_some());
        assert!(roster.update_local_cursor(block_id, 2).is_none());

        // The throttled position is retained and can be flushed
        let flushed = roster.flush_local_cursor().unwrap();
        assert_eq!(
            flushed,
            ClientMessage::CursorPosition {
                block_id,
                position: 2
            }
        );
    }

    #[test]
    fn test_users_in_block() {
        let (mut roster, _local) = roster();
        let here = UserIdentity::new("here");
        let elsewhere = UserIdentity::new("elsewhere");
        let block_id = Uuid::new_v4();

        roster.handle_event(&ServerEvent::cursor_moved(block_id, 0, &here));
        roster.handle_event(&ServerEvent::cursor_moved(Uuid::new_v4(), 0, &elsewhere));

        let in_block = roster.users_in_block(block_id);
        assert_eq!(in_block.len(), 1);
        assert_eq!(in_block[0].username, "here");
    }

    #[test]
    fn test_clear() {
        let (mut roster, _local) = roster();
        roster.handle_event(&ServerEvent::user_joined(&UserIdentity::new("a")));
        roster.handle_event(&ServerEvent::user_joined(&UserIdentity::new("b")));
        assert_eq!(roster.user_count(), 2);

        roster.clear();
        assert_eq!(roster.user_count(), 0);
    }
}
