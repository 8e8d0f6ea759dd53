//! Broadcast envelopes and their pub/sub channel names.

use crate::registry::ConnectionId;
use crate::routing::WireMessage;
use serde::{Deserialize, Serialize};
use std::collections::{HashSet, VecDeque};
use uuid::Uuid;

/// Number of envelope ids remembered for de-duplication.
pub const DEFAULT_DEDUPE_WINDOW: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "name", rename_all = "snake_case")]
pub enum BroadcastScope {
    /// Every connection on every worker.
    All,
    /// Local members of the named room on every worker.
    Room(String),
    /// Connections accepted by the named custom scope filter.
    Custom(String),
}

impl BroadcastScope {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            BroadcastScope::All => "all",
            BroadcastScope::Room(_) => "room",
            BroadcastScope::Custom(_) => "custom",
        }
    }
}

/// A broadcast as published on the bus.
///
/// Published once per logical broadcast; every subscribed worker, the origin
/// included, delivers it to its own local connections only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastEnvelope {
    pub id: Uuid,
    pub scope: BroadcastScope,
    pub payload: WireMessage,
    pub origin_worker_id: String,
    /// Origin-local connection to skip (usually the sender).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub except: Option<ConnectionId>,
}

impl BroadcastEnvelope {
    pub fn new(scope: BroadcastScope, payload: WireMessage, origin_worker_id: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            scope,
            payload,
            origin_worker_id: origin_worker_id.to_string(),
            except: None,
        }
    }

    #[must_use]
    pub fn excluding(mut self, connection_id: ConnectionId) -> Self {
        self.except = Some(connection_id);
        self
    }

    /// Whether `connection_id` on `worker_id` must be skipped.
    ///
    /// Connection ids are process-local, so `except` only applies on the
    /// origin worker.
    pub fn excludes(&self, worker_id: &str, connection_id: ConnectionId) -> bool {
        self.except == Some(connection_id) && self.origin_worker_id == worker_id
    }
}

/// Channel naming under a shared prefix.
#[derive(Debug, Clone)]
pub struct ChannelNames {
    prefix: String,
}

impl ChannelNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn all(&self) -> String {
        format!("{}broadcast-all", self.prefix)
    }

    pub fn room(&self, room: &str) -> String {
        format!("{}room:{room}", self.prefix)
    }

    pub fn custom(&self, scope: &str) -> String {
        format!("{}custom:{scope}", self.prefix)
    }

    pub fn for_scope(&self, scope: &BroadcastScope) -> String {
        match scope {
            BroadcastScope::All => self.all(),
            BroadcastScope::Room(room) => self.room(room),
            BroadcastScope::Custom(name) => self.custom(name),
        }
    }
}

/// Bounded memory of recently delivered envelope ids.
#[derive(Debug)]
pub struct RecentEnvelopes {
    order: VecDeque<Uuid>,
    seen: HashSet<Uuid>,
    capacity: usize,
}

impl RecentEnvelopes {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns true the first time `id` is seen within the window.
    pub fn first_sighting(&mut self, id: Uuid) -> bool {
        if !self.seen.insert(id) {
            return false;
        }
        self.order.push_back(id);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}
