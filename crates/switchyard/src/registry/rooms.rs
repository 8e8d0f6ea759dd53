//! Per-worker room membership index.
//!
//! Rooms exist only while they have at least one local member. Membership is
//! tracked in both directions so removing a connection is proportional to the
//! number of rooms it joined, not the number of rooms on the worker.

use super::ConnectionId;
use std::collections::{BTreeSet, HashMap};

/// Result of a join.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinOutcome {
    /// The room did not exist locally and was created.
    RoomCreated,
    /// The connection joined an existing room.
    Joined,
    /// The connection was already a member.
    AlreadyMember,
}

impl JoinOutcome {
    #[must_use]
    pub fn room_created(self) -> bool {
        matches!(self, JoinOutcome::RoomCreated)
    }
}

/// Result of a leave.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The connection left and was the last member, so the room was deleted.
    RoomRemoved,
    /// The connection left; other members remain.
    Left,
    /// The connection was not a member.
    NotMember,
}

impl LeaveOutcome {
    #[must_use]
    pub fn room_removed(self) -> bool {
        matches!(self, LeaveOutcome::RoomRemoved)
    }
}

#[derive(Debug, Default)]
pub struct RoomDirectory {
    rooms: HashMap<String, BTreeSet<ConnectionId>>,
    memberships: HashMap<ConnectionId, BTreeSet<String>>,
}

impl RoomDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `id` to `room`, creating the room if needed.
    pub fn join(&mut self, id: ConnectionId, room: &str) -> JoinOutcome {
        let created = !self.rooms.contains_key(room);
        let members = self.rooms.entry(room.to_string()).or_default();
        if !members.insert(id) {
            return JoinOutcome::AlreadyMember;
        }
        self.memberships
            .entry(id)
            .or_default()
            .insert(room.to_string());

        if created {
            JoinOutcome::RoomCreated
        } else {
            JoinOutcome::Joined
        }
    }

    /// Remove `id` from `room`, deleting the room when it becomes empty.
    pub fn leave(&mut self, id: ConnectionId, room: &str) -> LeaveOutcome {
        let Some(members) = self.rooms.get_mut(room) else {
            return LeaveOutcome::NotMember;
        };
        if !members.remove(&id) {
            return LeaveOutcome::NotMember;
        }
        let now_empty = members.is_empty();

        if let Some(joined) = self.memberships.get_mut(&id) {
            joined.remove(room);
            if joined.is_empty() {
                self.memberships.remove(&id);
            }
        }

        if now_empty {
            self.rooms.remove(room);
            LeaveOutcome::RoomRemoved
        } else {
            LeaveOutcome::Left
        }
    }

    #[must_use]
    pub fn is_local_member(&self, id: ConnectionId, room: &str) -> bool {
        self.rooms
            .get(room)
            .is_some_and(|members| members.contains(&id))
    }

    /// Local members of `room` in connection (insertion) order.
    pub fn local_members(&self, room: &str) -> impl Iterator<Item = ConnectionId> + '_ {
        self.rooms
            .get(room)
            .into_iter()
            .flat_map(|members| members.iter().copied())
    }

    #[must_use]
    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, BTreeSet::len)
    }

    /// Rooms `id` belongs to, sorted by name.
    pub fn rooms_of(&self, id: ConnectionId) -> impl Iterator<Item = &str> + '_ {
        self.memberships
            .get(&id)
            .into_iter()
            .flat_map(|rooms| rooms.iter().map(String::as_str))
    }

    /// Drop `id` from every room. Returns the rooms that became empty.
    pub fn remove_connection(&mut self, id: ConnectionId) -> Vec<String> {
        let Some(joined) = self.memberships.remove(&id) else {
            return Vec::new();
        };

        let mut emptied = Vec::new();
        for room in joined {
            if let Some(members) = self.rooms.get_mut(&room) {
                members.remove(&id);
                if members.is_empty() {
                    self.rooms.remove(&room);
                    emptied.push(room);
                }
            }
        }
        emptied
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn rooms(&self) -> impl Iterator<Item = &str> + '_ {
        self.rooms.keys().map(String::as_str)
    }
}
