//! Per-worker connection registry.
//!
//! The registry is the only owner of connection records and their socket
//! handles. It also owns the worker's [`RoomDirectory`] so room membership can
//! never reference a connection the registry does not know about: joins are
//! checked against the registry and [`ConnectionRegistry::remove`] cascades to
//! every room.
//!
//! The registry is not synchronized. It lives inside the worker hub actor,
//! which is the only task that touches it.

mod connection;
mod rooms;

pub use connection::{
    Connection, ConnectionId, ConnectionInit, OutboundFrame, SendFailure, SocketHandle,
    CLOSE_GOING_AWAY, CLOSE_INTERNAL_ERROR, CLOSE_NORMAL, CLOSE_POLICY_VIOLATION,
};
pub use rooms::{JoinOutcome, LeaveOutcome, RoomDirectory};

use crate::errors::SwitchyardError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A connection removed from the registry, with the rooms its removal emptied.
#[derive(Debug)]
pub struct RemovedConnection {
    pub connection: Connection,
    pub emptied_rooms: Vec<String>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: u64,
    connections: BTreeMap<ConnectionId, Connection>,
    rooms: RoomDirectory,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next connection id. Ids are never reused.
    pub fn allocate_id(&mut self) -> ConnectionId {
        self.next_id += 1;
        ConnectionId::new(self.next_id)
    }

    /// Register a connection.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if `id` is already registered.
    pub fn add(
        &mut self,
        id: ConnectionId,
        socket: SocketHandle,
        init: ConnectionInit,
    ) -> Result<&Connection, SwitchyardError> {
        if self.connections.contains_key(&id) {
            return Err(SwitchyardError::Conflict(format!(
                "connection {id} already registered"
            )));
        }
        // Keep allocation monotonic when callers pick their own ids.
        if id.get() > self.next_id {
            self.next_id = id.get();
        }

        let connection = self
            .connections
            .entry(id)
            .or_insert_with(|| Connection::new(id, socket, init));
        debug!(target: "sy.registry", connection_id = %id, "Connection registered");
        Ok(connection)
    }

    #[must_use]
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    #[must_use]
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Remove a connection and drop it from every room.
    ///
    /// Dropping the returned record releases the socket handle, which ends
    /// the connection's writer task.
    pub fn remove(&mut self, id: ConnectionId) -> Option<RemovedConnection> {
        let connection = self.connections.remove(&id)?;
        let emptied_rooms = self.rooms.remove_connection(id);
        debug!(
            target: "sy.registry",
            connection_id = %id,
            emptied_rooms = emptied_rooms.len(),
            "Connection removed"
        );
        Some(RemovedConnection {
            connection,
            emptied_rooms,
        })
    }

    /// Update one field of a connection.
    ///
    /// `user_id` and `user_type` take a string or `null` (which clears them).
    /// Any other key is stored in the connection's metadata.
    ///
    /// # Errors
    ///
    /// `ConnectionNotFound` for unknown ids, `Validation` for a non-string
    /// identity value.
    pub fn update_field(
        &mut self,
        id: ConnectionId,
        key: &str,
        value: Value,
    ) -> Result<(), SwitchyardError> {
        let connection = self
            .connections
            .get_mut(&id)
            .ok_or(SwitchyardError::ConnectionNotFound(id))?;

        match key {
            "user_id" => connection.set_user_id(optional_string(key, value)?),
            "user_type" => connection.set_user_type(optional_string(key, value)?),
            _ => connection.set_metadata(key, value),
        }
        Ok(())
    }

    /// Record activity on a connection. Returns false for unknown ids.
    pub fn touch(&mut self, id: ConnectionId, now: Instant) -> bool {
        match self.connections.get_mut(&id) {
            Some(connection) => {
                connection.touch(now);
                true
            }
            None => false,
        }
    }

    /// First connection (in insertion order) matching `predicate`.
    pub fn find<P>(&self, mut predicate: P) -> Option<&Connection>
    where
        P: FnMut(&Connection) -> bool,
    {
        self.connections.values().find(|c| predicate(c))
    }

    /// All connections in insertion order.
    pub fn list(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.connections.values()
    }

    /// Connections matching `filter`, in insertion order.
    pub fn list_where<F>(&self, mut filter: F) -> Vec<&Connection>
    where
        F: FnMut(&Connection) -> bool,
    {
        self.connections.values().filter(|c| filter(c)).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    #[must_use]
    pub fn rooms(&self) -> &RoomDirectory {
        &self.rooms
    }

    /// Add a registered connection to a room.
    ///
    /// # Errors
    ///
    /// `ConnectionNotFound` if `id` is not registered.
    pub fn join_room(
        &mut self,
        id: ConnectionId,
        room: &str,
    ) -> Result<JoinOutcome, SwitchyardError> {
        if !self.connections.contains_key(&id) {
            return Err(SwitchyardError::ConnectionNotFound(id));
        }
        Ok(self.rooms.join(id, room))
    }

    /// Remove a registered connection from a room.
    ///
    /// # Errors
    ///
    /// `ConnectionNotFound` if `id` is not registered.
    pub fn leave_room(
        &mut self,
        id: ConnectionId,
        room: &str,
    ) -> Result<LeaveOutcome, SwitchyardError> {
        if !self.connections.contains_key(&id) {
            return Err(SwitchyardError::ConnectionNotFound(id));
        }
        Ok(self.rooms.leave(id, room))
    }

    /// Close and remove every connection idle for at least `threshold`.
    pub fn evict_idle(&mut self, now: Instant, threshold: Duration) -> Vec<RemovedConnection> {
        let idle: Vec<ConnectionId> = self
            .connections
            .values()
            .filter(|c| c.is_idle(now, threshold))
            .map(Connection::id)
            .collect();

        self.close_and_remove(&idle, CLOSE_GOING_AWAY, "idle timeout")
    }

    /// Close and remove every connection.
    pub fn close_all(&mut self, code: u16, reason: &str) -> Vec<RemovedConnection> {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        self.close_and_remove(&ids, code, reason)
    }

    fn close_and_remove(
        &mut self,
        ids: &[ConnectionId],
        code: u16,
        reason: &str,
    ) -> Vec<RemovedConnection> {
        ids.iter()
            .filter_map(|id| {
                let removed = self.remove(*id)?;
                // Best effort: a full or closed queue still gets dropped below.
                let _ = removed.connection.socket().close(code, reason);
                Some(removed)
            })
            .collect()
    }
}

fn optional_string(key: &str, value: Value) -> Result<Option<String>, SwitchyardError> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s)),
        _ => Err(SwitchyardError::Validation(format!("{key} must be a string"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn register(
        registry: &mut ConnectionRegistry,
    ) -> (ConnectionId, mpsc::Receiver<OutboundFrame>) {
        let id = registry.allocate_id();
        let (socket, rx) = SocketHandle::channel(8);
        registry.add(id, socket, ConnectionInit::default()).unwrap();
        (id, rx)
    }

    #[test]
    fn test_allocate_id_is_monotonic() {
        let mut registry = ConnectionRegistry::new();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert!(b > a);
    }

    #[test]
    fn test_add_rejects_duplicate_id() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = register(&mut registry);
        let (socket, _rx2) = SocketHandle::channel(8);

        let result = registry.add(id, socket, ConnectionInit::default());
        assert!(matches!(result, Err(SwitchyardError::Conflict(_))));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_add_with_explicit_id_keeps_allocation_monotonic() {
        let mut registry = ConnectionRegistry::new();
        let (socket, _rx) = SocketHandle::channel(8);
        registry
            .add(ConnectionId::new(10), socket, ConnectionInit::default())
            .unwrap();

        assert_eq!(registry.allocate_id(), ConnectionId::new(11));
    }

    #[test]
    fn test_get_and_remove() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = register(&mut registry);

        assert!(registry.get(id).is_some());
        let removed = registry.remove(id).unwrap();
        assert_eq!(removed.connection.id(), id);
        assert!(registry.get(id).is_none());
        assert!(registry.remove(id).is_none());
    }

    #[test]
    fn test_remove_cascades_to_rooms() {
        let mut registry = ConnectionRegistry::new();
        let (a, _rx_a) = register(&mut registry);
        let (b, _rx_b) = register(&mut registry);

        registry.join_room(a, "lobby").unwrap();
        registry.join_room(b, "lobby").unwrap();
        registry.join_room(a, "solo").unwrap();

        let removed = registry.remove(a).unwrap();
        assert_eq!(removed.emptied_rooms, vec!["solo".to_string()]);
        assert!(!registry.rooms().is_local_member(a, "lobby"));
        assert!(registry.rooms().is_local_member(b, "lobby"));
    }

    #[test]
    fn test_join_unknown_connection_fails() {
        let mut registry = ConnectionRegistry::new();
        let result = registry.join_room(ConnectionId::new(99), "lobby");
        assert!(matches!(result, Err(SwitchyardError::ConnectionNotFound(_))));
        assert_eq!(registry.rooms().room_count(), 0);
    }

    #[test]
    fn test_update_field_identity_and_metadata() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = register(&mut registry);

        registry.update_field(id, "user_id", json!("alice")).unwrap();
        registry.update_field(id, "user_type", json!("member")).unwrap();
        registry.update_field(id, "locale", json!("en-GB")).unwrap();

        let conn = registry.get(id).unwrap();
        assert_eq!(conn.user_id(), Some("alice"));
        assert_eq!(conn.user_type(), Some("member"));
        assert_eq!(conn.metadata("locale"), Some(&json!("en-GB")));

        registry.update_field(id, "user_id", Value::Null).unwrap();
        assert_eq!(registry.get(id).unwrap().user_id(), None);
    }

    #[test]
    fn test_update_field_rejects_non_string_identity() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = register(&mut registry);

        let result = registry.update_field(id, "user_id", json!(42));
        assert!(matches!(result, Err(SwitchyardError::Validation(_))));

        let result = registry.update_field(ConnectionId::new(77), "x", json!(1));
        assert!(matches!(result, Err(SwitchyardError::ConnectionNotFound(_))));
    }

    #[test]
    fn test_find_and_list_in_insertion_order() {
        let mut registry = ConnectionRegistry::new();
        let (a, _rx_a) = register(&mut registry);
        let (b, _rx_b) = register(&mut registry);
        let (c, _rx_c) = register(&mut registry);
        registry.update_field(b, "user_id", json!("bob")).unwrap();
        registry.update_field(c, "user_id", json!("bob")).unwrap();

        let ids: Vec<_> = registry.list().map(Connection::id).collect();
        assert_eq!(ids, vec![a, b, c]);

        let found = registry.find(|conn| conn.user_id() == Some("bob")).unwrap();
        assert_eq!(found.id(), b);

        let bobs = registry.list_where(|conn| conn.user_id() == Some("bob"));
        assert_eq!(bobs.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_closes_and_removes() {
        let mut registry = ConnectionRegistry::new();
        let (stale, mut stale_rx) = register(&mut registry);
        registry.join_room(stale, "lobby").unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        let (fresh, _fresh_rx) = register(&mut registry);

        let evicted = registry.evict_idle(Instant::now(), Duration::from_secs(30));
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted.first().unwrap().connection.id(), stale);
        assert_eq!(evicted.first().unwrap().emptied_rooms, vec!["lobby".to_string()]);
        assert!(registry.contains(fresh));
        assert!(!registry.contains(stale));

        assert_eq!(
            stale_rx.recv().await,
            Some(OutboundFrame::Close {
                code: CLOSE_GOING_AWAY,
                reason: "idle timeout".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_defers_eviction() {
        let mut registry = ConnectionRegistry::new();
        let (id, _rx) = register(&mut registry);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(registry.touch(id, Instant::now()));
        tokio::time::advance(Duration::from_secs(20)).await;

        let evicted = registry.evict_idle(Instant::now(), Duration::from_secs(30));
        assert!(evicted.is_empty());
        assert!(!registry.touch(ConnectionId::new(500), Instant::now()));
    }

    #[test]
    fn test_close_all_empties_registry_and_rooms() {
        let mut registry = ConnectionRegistry::new();
        let (a, _rx_a) = register(&mut registry);
        let (_b, _rx_b) = register(&mut registry);
        registry.join_room(a, "lobby").unwrap();

        let removed = registry.close_all(CLOSE_GOING_AWAY, "server shutting down");
        assert_eq!(removed.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.rooms().room_count(), 0);
    }
}
