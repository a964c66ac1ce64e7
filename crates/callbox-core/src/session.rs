use std::collections::HashMap;

use thiserror::Error;
use uuid::Uuid;

use crate::ids::ConnectionId;
use crate::negotiation::{CallSession, CallState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("connection {0} is already in a call")]
    AlreadyInCall(ConnectionId),
}

/// Live calls, reachable from either participant's connection.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: HashMap<Uuid, CallSession>,
    by_connection: HashMap<ConnectionId, Uuid>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session` unless either participant already has a call.
    /// The caller is checked first so its error wins when both are busy.
    pub fn insert(&mut self, session: CallSession) -> Result<&mut CallSession, SessionError> {
        let initiator = session.initiator();
        let responder = session.responder();
        for connection in [initiator, responder] {
            if self.by_connection.contains_key(&connection) {
                return Err(SessionError::AlreadyInCall(connection));
            }
        }

        let call_id = Uuid::new_v4();
        self.by_connection.insert(initiator, call_id);
        self.by_connection.insert(responder, call_id);
        Ok(self.sessions.entry(call_id).or_insert(session))
    }

    pub fn is_busy(&self, connection: ConnectionId) -> bool {
        self.by_connection.contains_key(&connection)
    }

    pub fn get(&self, connection: ConnectionId) -> Option<&CallSession> {
        let call_id = self.by_connection.get(&connection)?;
        self.sessions.get(call_id)
    }

    pub fn get_mut(&mut self, connection: ConnectionId) -> Option<&mut CallSession> {
        let call_id = self.by_connection.get(&connection)?;
        self.sessions.get_mut(call_id)
    }

    /// Removes the call `connection` takes part in, unlinking both participants.
    pub fn remove(&mut self, connection: ConnectionId) -> Option<CallSession> {
        let call_id = self.by_connection.remove(&connection)?;
        let session = self.sessions.remove(&call_id)?;
        self.by_connection.remove(&session.initiator());
        self.by_connection.remove(&session.responder());
        Some(session)
    }

    /// Takes every call out of the table.
    pub fn drain(&mut self) -> Vec<CallSession> {
        self.by_connection.clear();
        self.sessions.drain().map(|(_, session)| session).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn count_in(&self, state: CallState) -> usize {
        self.sessions
            .values()
            .filter(|session| session.state() == state)
            .count()
    }
}
