use std::collections::HashSet;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::mpsc;

use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};

/// Outbound handle for one live connection. The gateway's writer task drains
/// the receiving end into the socket.
pub type EventSender = mpsc::UnboundedSender<ServerEvent>;

struct SessionEntry {
    user_id: UserId,
    sender: EventSender,
    #[allow(dead_code)]
    connected_at: DateTime<Utc>,
}

/// In-memory map of which users are reachable on which connections.
///
/// This is the single source of truth for "is this user reachable right
/// now". Pure map state: no I/O, cannot fail. A connection id belongs to at
/// most one user; the per-user session set is only ever mutated here.
#[derive(Default)]
pub struct SessionRegistry {
    by_user: DashMap<UserId, HashSet<ConnectionId>>,
    by_connection: DashMap<ConnectionId, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a connection to the user's session set. Idempotent; if the
    /// connection was previously registered to a different user it is moved.
    pub fn register(&self, user_id: UserId, connection_id: ConnectionId, sender: EventSender) {
        if let Some(previous) = self.by_connection.insert(
            connection_id,
            SessionEntry {
                user_id,
                sender,
                connected_at: Utc::now(),
            },
        ) {
            if previous.user_id != user_id {
                self.remove_from_user(previous.user_id, connection_id);
            }
        }
        self.by_user
            .entry(user_id)
            .or_default()
            .insert(connection_id);
    }

    /// Removes a connection. Returns the owning user and how many of their
    /// sessions remain, or `None` if the connection was not registered
    /// (double-unregister is a no-op).
    pub fn unregister(&self, connection_id: ConnectionId) -> Option<(UserId, usize)> {
        let (_, entry) = self.by_connection.remove(&connection_id)?;
        let remaining = self.remove_from_user(entry.user_id, connection_id);
        Some((entry.user_id, remaining))
    }

    pub fn sessions_for(&self, user_id: UserId) -> Vec<(ConnectionId, EventSender)> {
        let Some(connections) = self.by_user.get(&user_id) else {
            return Vec::new();
        };
        connections
            .iter()
            .filter_map(|connection_id| {
                self.by_connection
                    .get(connection_id)
                    .map(|entry| (*connection_id, entry.sender.clone()))
            })
            .collect()
    }

    pub fn owner_of(&self, connection_id: ConnectionId) -> Option<UserId> {
        self.by_connection
            .get(&connection_id)
            .map(|entry| entry.user_id)
    }

    pub fn session_count(&self, user_id: UserId) -> usize {
        self.by_user
            .get(&user_id)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    fn remove_from_user(&self, user_id: UserId, connection_id: ConnectionId) -> usize {
        let mut remaining = 0;
        let mut drop_user = false;
        if let Some(mut connections) = self.by_user.get_mut(&user_id) {
            connections.remove(&connection_id);
            remaining = connections.len();
            drop_user = connections.is_empty();
        }
        if drop_user {
            self.by_user.remove_if(&user_id, |_, set| set.is_empty());
        }
        remaining
    }
}
