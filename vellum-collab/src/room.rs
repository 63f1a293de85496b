//! Per-note broadcast rooms and the registry that owns them.
//!
//! ```text
//!                  ┌──────────────┐
//!   join/leave ───▶│ RoomRegistry │─── note_id ──▶ Arc<Room>
//!                  └──────┬───────┘
//!                         │
//!              ┌──────────┴──────────┐
//!              ▼                     ▼
//!          ┌──────┐              ┌──────┐
//!          │ Room │              │ Room │    one per open note
//!          └──┬───┘              └──────┘
//!             │ try_send into each member's queue
//!        ┌────┼────┐
//!        ▼    ▼    ▼
//!      conn  conn  conn
//! ```
//!
//! Each member registers a bounded queue; [`Room::broadcast`] encodes the
//! event once and pushes the shared frame into every queue except the
//! excluded one. A full or closed queue drops that member's frame rather
//! than stalling the room.
//!
//! A room that empties is retired: the flag is set under the member lock
//! and the registry entry removed in the same critical section, so a join
//! racing against retirement observes [`Admission::Retired`] and recreates
//! the room instead of landing in an orphan.

use log::{debug, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use vellum_core::UserIdentity;

use crate::protocol::ServerEvent;

/// One connection's seat in a room: who it is and where to push frames.
#[derive(Clone)]
pub struct RoomMember {
    pub connection_id: Uuid,
    pub user: UserIdentity,
    pub sender: mpsc::Sender<Arc<String>>,
}

impl RoomMember {
    pub fn new(connection_id: Uuid, user: UserIdentity, sender: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            connection_id,
            user,
            sender,
        }
    }
}

/// Outcome of [`Room::add_member`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// The room is at capacity.
    Full,
    /// The room was retired between lookup and join; the caller should
    /// fetch a fresh room from the registry and retry.
    Retired,
}

/// Lock-free counters for room activity.
#[derive(Debug, Default)]
pub struct AtomicRoomStats {
    pub events_broadcast: AtomicU64,
    pub deliveries: AtomicU64,
    pub dropped: AtomicU64,
    pub members_joined: AtomicU64,
    pub members_left: AtomicU64,
}

impl AtomicRoomStats {
    pub fn snapshot(&self) -> RoomStats {
        RoomStats {
            events_broadcast: self.events_broadcast.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            members_joined: self.members_joined.load(Ordering::Relaxed),
            members_left: self.members_left.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`AtomicRoomStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomStats {
    pub events_broadcast: u64,
    pub deliveries: u64,
    pub dropped: u64,
    pub members_joined: u64,
    pub members_left: u64,
}

struct Membership {
    connections: HashMap<Uuid, RoomMember>,
    retired: bool,
}

/// The broadcast domain for one note's live session.
pub struct Room {
    note_id: Uuid,
    members: RwLock<Membership>,
    /// Serializes store-commit then publish for edits in this room, so all
    /// members observe block events for one note in a single order.
    sequencer: Mutex<()>,
    max_members: usize,
    stats: AtomicRoomStats,
}

impl Room {
    pub fn new(note_id: Uuid, max_members: usize) -> Self {
        Self {
            note_id,
            members: RwLock::new(Membership {
                connections: HashMap::new(),
                retired: false,
            }),
            sequencer: Mutex::new(()),
            max_members,
            stats: AtomicRoomStats::default(),
        }
    }

    pub fn note_id(&self) -> Uuid {
        self.note_id
    }

    /// The commit-then-publish lock for this room's edit pipeline.
    pub fn sequencer(&self) -> &Mutex<()> {
        &self.sequencer
    }

    pub fn stats(&self) -> &AtomicRoomStats {
        &self.stats
    }

    pub async fn add_member(&self, member: RoomMember) -> Admission {
        let mut members = self.members.write().await;
        if members.retired {
            return Admission::Retired;
        }
        if members.connections.len() >= self.max_members {
            return Admission::Full;
        }
        members.connections.insert(member.connection_id, member);
        self.stats.members_joined.fetch_add(1, Ordering::Relaxed);
        Admission::Admitted
    }

    pub async fn remove_member(&self, connection_id: &Uuid) -> Option<RoomMember> {
        let mut members = self.members.write().await;
        let removed = members.connections.remove(connection_id);
        if removed.is_some() {
            self.stats.members_left.fetch_add(1, Ordering::Relaxed);
        }
        removed
    }

    /// Mark the room retired if it is empty. Returns true only for the call
    /// that performed the retirement; the caller must then drop the registry
    /// entry within the same registry critical section.
    async fn try_retire(&self) -> bool {
        let mut members = self.members.write().await;
        if !members.retired && members.connections.is_empty() {
            members.retired = true;
            true
        } else {
            false
        }
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.connections.len()
    }

    pub async fn contains(&self, connection_id: &Uuid) -> bool {
        self.members.read().await.connections.contains_key(connection_id)
    }

    /// Connection ids and identities of everyone currently in the room.
    pub async fn members(&self) -> Vec<(Uuid, UserIdentity)> {
        self.members
            .read()
            .await
            .connections
            .values()
            .map(|m| (m.connection_id, m.user.clone()))
            .collect()
    }

    /// Encode `event` once and deliver it to every member except `exclude`.
    /// Returns the number of queues the frame actually entered.
    pub async fn broadcast(&self, event: &ServerEvent, exclude: Option<Uuid>) -> usize {
        match event.encode() {
            Ok(text) => self.broadcast_frame(Arc::new(text), exclude).await,
            Err(e) => {
                warn!("Failed to encode event for note {}: {}", self.note_id, e);
                0
            }
        }
    }

    /// Deliver an already-encoded frame. The member snapshot is taken under
    /// the read lock; sends happen after it is released so a slow queue
    /// never blocks joins or leaves.
    pub async fn broadcast_frame(&self, frame: Arc<String>, exclude: Option<Uuid>) -> usize {
        let recipients: Vec<(Uuid, mpsc::Sender<Arc<String>>)> = {
            let members = self.members.read().await;
            members
                .connections
                .values()
                .filter(|m| Some(m.connection_id) != exclude)
                .map(|m| (m.connection_id, m.sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (connection_id, sender) in recipients {
            match sender.try_send(Arc::clone(&frame)) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Queue full for connection {} in note {}, frame dropped",
                        connection_id, self.note_id
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Queue closed for connection {} in note {}, frame dropped",
                        connection_id, self.note_id
                    );
                }
            }
        }

        self.stats.events_broadcast.fetch_add(1, Ordering::Relaxed);
        self.stats.deliveries.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}

/// Owns the note-id → room map. Handed to the server explicitly; nothing
/// in this crate reaches for a global.
pub struct RoomRegistry {
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    max_members_per_room: usize,
}

impl RoomRegistry {
    pub fn new(max_members_per_room: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            max_members_per_room,
        }
    }

    /// Get the room for a note, creating it on first use.
    pub async fn get_or_create(&self, note_id: Uuid) -> Arc<Room> {
        // Fast path: room already exists
        {
            let rooms = self.rooms.read().await;
            if let Some(room) = rooms.get(&note_id) {
                return Arc::clone(room);
            }
        }

        // Slow path: take the write lock and re-check for a racing creator
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(&note_id) {
            return Arc::clone(room);
        }
        let room = Arc::new(Room::new(note_id, self.max_members_per_room));
        rooms.insert(note_id, Arc::clone(&room));
        room
    }

    /// Admit a member to the note's room, creating the room if needed.
    /// Returns None if the room is full.
    pub async fn join(&self, note_id: Uuid, member: RoomMember) -> Option<Arc<Room>> {
        loop {
            let room = self.get_or_create(note_id).await;
            match room.add_member(member.clone()).await {
                Admission::Admitted => return Some(room),
                Admission::Full => {
                    // A rejected join must not strand an empty room it
                    // just created.
                    self.remove_if_empty(&note_id).await;
                    return None;
                }
                Admission::Retired => continue,
            }
        }
    }

    /// Remove a connection from the note's room and retire the room if it
    /// was the last member.
    pub async fn leave(&self, note_id: &Uuid, connection_id: &Uuid) -> Option<RoomMember> {
        let room = {
            let rooms = self.rooms.read().await;
            rooms.get(note_id).cloned()
        }?;
        let removed = room.remove_member(connection_id).await;
        self.remove_if_empty(note_id).await;
        removed
    }

    /// Drop the registry entry for a note whose room has no members.
    /// Retirement and removal happen under the registry write lock, so the
    /// map never exposes a retired room.
    pub async fn remove_if_empty(&self, note_id: &Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get(note_id) {
            if room.try_retire().await {
                rooms.remove(note_id);
                return true;
            }
        }
        false
    }

    pub async fn get(&self, note_id: &Uuid) -> Option<Arc<Room>> {
        self.rooms.read().await.get(note_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Ids of all notes with at least one live connection.
    pub async fn active_notes(&self) -> Vec<Uuid> {
        self.rooms.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_member(name: &str) -> (RoomMember, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(8);
        let member = RoomMember::new(Uuid::new_v4(), UserIdentity::new(name), tx);
        (member, rx)
    }

    fn joined_event() -> ServerEvent {
        ServerEvent::user_joined(&UserIdentity::new("emitter"))
    }

    #[tokio::test]
    async fn test_add_and_remove_member() {
        let room = Room::new(Uuid::new_v4(), 16);
        let (member, _rx) = test_member("alice");
        let id = member.connection_id;

        assert_eq!(room.add_member(member).await, Admission::Admitted);
        assert_eq!(room.member_count().await, 1);
        assert!(room.contains(&id).await);

        let removed = room.remove_member(&id).await;
        assert_eq!(removed.map(|m| m.user.username), Some("alice".to_string()));
        assert_eq!(room.member_count().await, 0);
    }

    #[tokio::test]
    async fn test_room_capacity() {
        let room = Room::new(Uuid::new_v4(), 2);
        let (a, _ra) = test_member("a");
        let (b, _rb) = test_member("b");
        let (c, _rc) = test_member("c");

        assert_eq!(room.add_member(a).await, Admission::Admitted);
        assert_eq!(room.add_member(b).await, Admission::Admitted);
        assert_eq!(room.add_member(c).await, Admission::Full);
        assert_eq!(room.member_count().await, 2);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_members() {
        let room = Room::new(Uuid::new_v4(), 16);
        let (a, mut ra) = test_member("a");
        let (b, mut rb) = test_member("b");
        room.add_member(a).await;
        room.add_member(b).await;

        let delivered = room.broadcast(&joined_event(), None).await;
        assert_eq!(delivered, 2);

        let frame_a = ra.recv().await.unwrap();
        let frame_b = rb.recv().await.unwrap();
        assert_eq!(*frame_a, *frame_b);
        assert!(frame_a.contains("user_joined"));
    }

    #[tokio::test]
    async fn test_broadcast_excludes_origin_connection() {
        let room = Room::new(Uuid::new_v4(), 16);
        let (a, mut ra) = test_member("a");
        let (b, mut rb) = test_member("b");
        let origin = a.connection_id;
        room.add_member(a).await;
        room.add_member(b).await;

        let delivered = room.broadcast(&joined_event(), Some(origin)).await;
        assert_eq!(delivered, 1);

        assert!(rb.recv().await.is_some());
        assert!(ra.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_frame_without_blocking() {
        let room = Room::new(Uuid::new_v4(), 16);
        let (tx, mut rx) = mpsc::channel(1);
        let member = RoomMember::new(Uuid::new_v4(), UserIdentity::new("slow"), tx);
        room.add_member(member).await;

        assert_eq!(room.broadcast(&joined_event(), None).await, 1);
        // Queue is now full; the next frame must be dropped, not awaited.
        assert_eq!(room.broadcast(&joined_event(), None).await, 0);
        assert_eq!(room.stats().snapshot().dropped, 1);

        // The first frame is still there.
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_closed_queue_counts_as_dropped() {
        let room = Room::new(Uuid::new_v4(), 16);
        let (member, rx) = test_member("gone");
        room.add_member(member).await;
        drop(rx);

        assert_eq!(room.broadcast(&joined_event(), None).await, 0);
        assert_eq!(room.stats().snapshot().dropped, 1);
    }

    #[tokio::test]
    async fn test_registry_get_or_create_returns_same_room() {
        let registry = RoomRegistry::new(16);
        let note_id = Uuid::new_v4();

        let first = registry.get_or_create(note_id).await;
        let second = registry.get_or_create(note_id).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_registry_isolates_notes() {
        let registry = RoomRegistry::new(16);
        let note_a = Uuid::new_v4();
        let note_b = Uuid::new_v4();

        let (ma, mut ra) = test_member("a");
        let (mb, mut rb) = test_member("b");
        let room_a = registry.join(note_a, ma).await.unwrap();
        registry.join(note_b, mb).await.unwrap();

        room_a.broadcast(&joined_event(), None).await;
        assert!(ra.recv().await.is_some());
        assert!(rb.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_last_leave_retires_room() {
        let registry = RoomRegistry::new(16);
        let note_id = Uuid::new_v4();

        let (a, _ra) = test_member("a");
        let (b, _rb) = test_member("b");
        let id_a = a.connection_id;
        let id_b = b.connection_id;

        registry.join(note_id, a).await.unwrap();
        registry.join(note_id, b).await.unwrap();
        assert_eq!(registry.room_count().await, 1);

        registry.leave(&note_id, &id_a).await;
        assert_eq!(registry.room_count().await, 1);

        registry.leave(&note_id, &id_b).await;
        assert_eq!(registry.room_count().await, 0);
    }

    #[tokio::test]
    async fn test_rejoin_after_retirement_gets_fresh_room() {
        let registry = RoomRegistry::new(16);
        let note_id = Uuid::new_v4();

        let (first, _r1) = test_member("first");
        let first_id = first.connection_id;
        let old_room = registry.join(note_id, first).await.unwrap();
        registry.leave(&note_id, &first_id).await;

        let (second, mut r2) = test_member("second");
        let new_room = registry.join(note_id, second).await.unwrap();
        assert!(!Arc::ptr_eq(&old_room, &new_room));

        new_room.broadcast(&joined_event(), None).await;
        assert!(r2.recv().await.is_some());
    }

    #[tokio::test]
    async fn test_join_rejected_when_full() {
        let registry = RoomRegistry::new(1);
        let note_id = Uuid::new_v4();

        let (a, _ra) = test_member("a");
        let (b, _rb) = test_member("b");

        assert!(registry.join(note_id, a).await.is_some());
        assert!(registry.join(note_id, b).await.is_none());
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn test_stats_track_membership_and_deliveries() {
        let room = Room::new(Uuid::new_v4(), 16);
        let (a, _ra) = test_member("a");
        let (b, _rb) = test_member("b");
        let id_a = a.connection_id;
        room.add_member(a).await;
        room.add_member(b).await;
        room.broadcast(&joined_event(), None).await;
        room.remove_member(&id_a).await;

        let stats = room.stats().snapshot();
        assert_eq!(stats.members_joined, 2);
        assert_eq!(stats.members_left, 1);
        assert_eq!(stats.events_broadcast, 1);
        assert_eq!(stats.deliveries, 2);
        assert_eq!(stats.dropped, 0);
    }
}
