use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::ids::ConnectionId;

/// A registered user as it appears in `userList` frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub user_id: String,
    pub display_name: String,
    pub connection_id: ConnectionId,
}

#[derive(Debug)]
struct Entry {
    user: User,
    seq: u64,
}

/// Result of [`Registry::register`].
#[derive(Debug)]
pub struct Registration {
    /// Connection that held this user id before, if it was a different one.
    /// It stays connected but is no longer reachable by user id.
    pub orphaned: Option<ConnectionId>,
    pub users: Vec<User>,
}

/// Transient directory of who is online, queryable by user id and by connection.
#[derive(Debug, Default)]
pub struct Registry {
    by_connection: HashMap<ConnectionId, Entry>,
    by_user: HashMap<String, ConnectionId>,
    next_seq: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `user_id` to `connection_id`, replacing any previous binding of
    /// either. Never fails so that reconnecting clients can simply re-register.
    pub fn register(
        &mut self,
        connection_id: ConnectionId,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Registration {
        let user_id = user_id.into();

        let orphaned = self
            .by_user
            .remove(&user_id)
            .filter(|previous| *previous != connection_id);
        if let Some(previous) = orphaned {
            self.by_connection.remove(&previous);
        }

        // A connection speaks for at most one user.
        if let Some(old) = self.by_connection.remove(&connection_id) {
            if old.user.user_id != user_id {
                self.by_user.remove(&old.user.user_id);
            }
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.by_user.insert(user_id.clone(), connection_id);
        self.by_connection.insert(
            connection_id,
            Entry {
                user: User {
                    user_id,
                    display_name: display_name.into(),
                    connection_id,
                },
                seq,
            },
        );

        Registration {
            orphaned,
            users: self.users(),
        }
    }

    pub fn lookup_by_user_id(&self, user_id: &str) -> Option<ConnectionId> {
        self.by_user.get(user_id).copied()
    }

    pub fn lookup_by_connection_id(&self, connection_id: ConnectionId) -> Option<&User> {
        self.by_connection.get(&connection_id).map(|entry| &entry.user)
    }

    /// Drops whatever user the connection registered. Idempotent.
    pub fn remove(&mut self, connection_id: ConnectionId) -> Option<User> {
        let entry = self.by_connection.remove(&connection_id)?;
        self.by_user.remove(&entry.user.user_id);
        Some(entry.user)
    }

    /// Current users in registration order.
    pub fn users(&self) -> Vec<User> {
        let mut entries: Vec<&Entry> = self.by_connection.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.user.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_connection.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_connection.clear();
        self.by_user.clear();
    }
}
