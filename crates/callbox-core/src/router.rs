//! Single dispatch point for everything a connection says or does.
//!
//! All shared state (live connections, registry, call table) sits behind one
//! mutex that each entry point holds for the whole dispatch, so no handler can
//! observe a half-applied change. Outbound frames are handed to [`Outbound`]
//! while the lock is held; that only enqueues, which keeps per-recipient order
//! identical to processing order.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::ids::ConnectionId;
use crate::negotiation::{
    CallSession, CallState, EndReason, NegotiationError, Transition,
    DEFAULT_MAX_PENDING_CANDIDATES,
};
use crate::outbound::{DeliveryError, Outbound};
use crate::protocol::{ClientMessage, ServerMessage, SessionDescription, SignalPayload};
use crate::registry::{Registry, User};
use crate::session::{SessionError, SessionTable};

#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Candidates held per direction while a call is ringing.
    pub max_pending_candidates: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            max_pending_candidates: DEFAULT_MAX_PENDING_CANDIDATES,
        }
    }
}

/// How the router disposed of one event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Handled,
    /// Refused; the sender got an `error` frame.
    Rejected(SignalError),
    /// Refused; only logged.
    Dropped(SignalError),
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub connections: usize,
    pub registered_users: usize,
    pub calls_offering: usize,
    pub calls_connected: usize,
}

#[derive(Default)]
struct SignalingState {
    connections: HashSet<ConnectionId>,
    registry: Registry,
    sessions: SessionTable,
}

pub struct Router {
    state: Mutex<SignalingState>,
    outbound: Arc<dyn Outbound>,
    config: RouterConfig,
}

impl Router {
    pub fn new(config: RouterConfig, outbound: Arc<dyn Outbound>) -> Self {
        Self {
            state: Mutex::new(SignalingState::default()),
            outbound,
            config,
        }
    }

    /// Tracks a freshly opened connection and tells it its id.
    pub fn on_connect(&self, connection: ConnectionId) -> Outcome {
        let mut state = self.state.lock();
        if !state.connections.insert(connection) {
            return Outcome::Ignored;
        }
        counter!("callbox_connections_total", 1);
        gauge!("callbox_connections_active", state.connections.len() as f64);
        debug!(connection_id = %connection, "connection opened");

        let _ = self.send(
            connection,
            ServerMessage::Identity {
                connection_id: connection,
            },
        );
        Outcome::Handled
    }

    /// Decodes and dispatches one text frame.
    pub fn on_text(&self, connection: ConnectionId, text: &str) -> Outcome {
        match ClientMessage::decode(text) {
            Ok(message) => self.on_message(connection, message),
            Err(err) if err.is_unknown_kind() => {
                counter!("callbox_messages_total", 1, "kind" => "unknown");
                warn!(connection_id = %connection, error = %err, "ignoring unknown message type");
                Outcome::Ignored
            }
            Err(err) => {
                let err = SignalError::MalformedMessage {
                    reason: err.to_string(),
                };
                self.settle(connection, "malformed", Err(err))
            }
        }
    }

    pub fn on_message(&self, connection: ConnectionId, message: ClientMessage) -> Outcome {
        let kind = message.kind();
        counter!("callbox_messages_total", 1, "kind" => kind);

        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.connections.contains(&connection) {
            return self.settle(
                connection,
                kind,
                Err(SignalError::invalid_transition("disconnected", kind)),
            );
        }

        let result = match message {
            ClientMessage::Register {
                user_id,
                display_name,
            } => {
                self.register(state, connection, user_id, display_name);
                Ok(())
            }
            ClientMessage::GetUsers => {
                let users = state.registry.users();
                let _ = self.send(connection, ServerMessage::UserList { users });
                Ok(())
            }
            ClientMessage::InitiateCall {
                target_user_id,
                offer,
                display_name,
            } => self.initiate_call(state, connection, target_user_id, offer, display_name),
            ClientMessage::AnswerCall { to, answer } => self.negotiate(
                state,
                connection,
                to.as_deref(),
                SignalPayload::Answer(answer),
            ),
            ClientMessage::Signal { to, candidate } => self.negotiate(
                state,
                connection,
                to.as_deref(),
                SignalPayload::Candidate(candidate),
            ),
            ClientMessage::LeaveCall { to } => self.leave_call(state, connection, to.as_deref()),
        };

        self.settle(connection, kind, result)
    }

    /// Forgets the connection, ending its call and updating everyone's user list.
    pub fn on_disconnect(&self, connection: ConnectionId) -> Outcome {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if !state.connections.remove(&connection) {
            return Outcome::Ignored;
        }
        gauge!("callbox_connections_active", state.connections.len() as f64);

        if let Some(mut session) = state.sessions.remove(connection) {
            match session.hang_up(connection, EndReason::PeerDisconnected) {
                Ok(notice) => {
                    counter!(
                        "callbox_calls_ended_total",
                        1,
                        "reason" => EndReason::PeerDisconnected.as_str()
                    );
                    info!(
                        connection_id = %connection,
                        peer = %notice.to,
                        duration_ms = session.age().as_millis() as u64,
                        "call ended by disconnect"
                    );
                    let _ = self.send(notice.to, notice.message);
                }
                Err(err) => debug!(connection_id = %connection, error = %err, "stale call dropped"),
            }
        }

        if let Some(user) = state.registry.remove(connection) {
            info!(connection_id = %connection, user_id = %user.user_id, "user went offline");
            gauge!("callbox_registered_users", state.registry.len() as f64);
            let users = state.registry.users();
            self.broadcast_users(state, users);
        }

        debug!(connection_id = %connection, "connection closed");
        Outcome::Handled
    }

    /// Ends every call (notifying both sides) and forgets all connections.
    /// Returns how many calls were cut.
    pub fn shutdown(&self) -> usize {
        let mut state = self.state.lock();
        let sessions = state.sessions.drain();
        let ended = sessions.len();
        for mut session in sessions {
            for notice in session.terminate(EndReason::Shutdown) {
                let _ = self.send(notice.to, notice.message);
            }
        }
        if ended > 0 {
            counter!(
                "callbox_calls_ended_total",
                ended as u64,
                "reason" => EndReason::Shutdown.as_str()
            );
        }
        state.registry.clear();
        state.connections.clear();
        gauge!("callbox_connections_active", 0.0);
        gauge!("callbox_registered_users", 0.0);
        info!(calls_ended = ended, "signaling state torn down");
        ended
    }

    pub fn users(&self) -> Vec<User> {
        self.state.lock().registry.users()
    }

    pub fn stats(&self) -> RouterStats {
        let state = self.state.lock();
        RouterStats {
            connections: state.connections.len(),
            registered_users: state.registry.len(),
            calls_offering: state.sessions.count_in(CallState::Offering),
            calls_connected: state.sessions.count_in(CallState::Connected),
        }
    }

    fn register(
        &self,
        state: &mut SignalingState,
        connection: ConnectionId,
        user_id: String,
        display_name: String,
    ) {
        info!(
            connection_id = %connection,
            user_id = %user_id,
            display_name = %display_name,
            "registering user"
        );
        let registration = state.registry.register(connection, user_id, display_name);
        if let Some(orphaned) = registration.orphaned {
            info!(
                connection_id = %connection,
                previous_connection = %orphaned,
                "user id moved to a new connection"
            );
        }
        gauge!("callbox_registered_users", state.registry.len() as f64);
        self.broadcast_users(state, registration.users);
    }

    fn initiate_call(
        &self,
        state: &mut SignalingState,
        connection: ConnectionId,
        target_user_id: String,
        offer: SessionDescription,
        display_name: Option<String>,
    ) -> Result<(), SignalError> {
        if state.sessions.is_busy(connection) {
            return Err(SignalError::AlreadyInCall { connection });
        }
        let target = state
            .registry
            .lookup_by_user_id(&target_user_id)
            .filter(|target| *target != connection)
            .ok_or_else(|| SignalError::target_not_found(target_user_id.as_str()))?;

        let (caller_name, caller_user_id) = match state.registry.lookup_by_connection_id(connection)
        {
            Some(user) => (user.display_name.clone(), Some(user.user_id.clone())),
            None => (display_name.unwrap_or_default(), None),
        };

        let (session, ring) = CallSession::open(
            connection,
            target,
            offer,
            caller_name,
            caller_user_id,
            self.config.max_pending_candidates,
        );
        let session = state
            .sessions
            .insert(session)
            .map_err(|SessionError::AlreadyInCall(busy)| SignalError::AlreadyInCall {
                connection: busy,
            })?;

        if self.send(ring.to, ring.message).is_err() {
            let _ = session.reject();
            state.sessions.remove(connection);
            counter!(
                "callbox_calls_ended_total",
                1,
                "reason" => EndReason::Unreachable.as_str()
            );
            warn!(
                connection_id = %connection,
                target = %target,
                "callee unreachable; call rejected"
            );
            return Err(SignalError::target_not_found(target_user_id));
        }

        counter!("callbox_calls_started_total", 1);
        info!(
            connection_id = %connection,
            target = %target,
            target_user_id = %target_user_id,
            "call ringing"
        );
        Ok(())
    }

    fn negotiate(
        &self,
        state: &mut SignalingState,
        connection: ConnectionId,
        to: Option<&str>,
        payload: SignalPayload,
    ) -> Result<(), SignalError> {
        let event = payload.name();
        let Some(session) = state.sessions.get_mut(connection) else {
            // A candidate with no call to attach to is reported, never buffered.
            if matches!(payload, SignalPayload::Candidate(_)) {
                return Err(SignalError::target_not_found(to.unwrap_or("call")));
            }
            return Err(missing_session(
                &state.registry,
                &state.connections,
                to,
                event,
            ));
        };

        if let Some(to) = to {
            match resolve_target(&state.registry, &state.connections, to) {
                None => return Err(SignalError::target_not_found(to)),
                Some(addressed) if Some(addressed) != session.counterpart(connection) => {
                    return Err(SignalError::invalid_transition(
                        session.state().as_str(),
                        format!("{event} addressed to `{to}`"),
                    ));
                }
                Some(_) => {}
            }
        }

        match session.apply(connection, payload) {
            Ok(Transition::Forward(deliveries)) => {
                let released = deliveries.len().saturating_sub(1);
                let mut deliveries = deliveries.into_iter();
                if event == "answer" {
                    let caller = session.initiator();
                    // First delivery is always call-accepted.
                    if let Some(accepted) = deliveries.next() {
                        if self.send(accepted.to, accepted.message).is_err() {
                            warn!(
                                connection_id = %connection,
                                peer = %caller,
                                "caller unreachable for call-accepted; ending call"
                            );
                            let notice = session.hang_up(caller, EndReason::Unreachable)?;
                            state.sessions.remove(connection);
                            counter!(
                                "callbox_calls_ended_total",
                                1,
                                "reason" => EndReason::Unreachable.as_str()
                            );
                            let _ = self.send(notice.to, notice.message);
                            return Ok(());
                        }
                    }
                    info!(
                        connection_id = %connection,
                        peer = %caller,
                        released,
                        "call connected"
                    );
                }
                for delivery in deliveries {
                    let _ = self.send(delivery.to, delivery.message);
                }
                Ok(())
            }
            Ok(Transition::Queued { for_role, depth }) => {
                counter!("callbox_candidates_queued_total", 1);
                debug!(
                    connection_id = %connection,
                    for_role = ?for_role,
                    depth,
                    "candidate held until answer"
                );
                Ok(())
            }
            Err(err @ NegotiationError::QueueFull { .. }) => {
                counter!("callbox_candidates_dropped_total", 1);
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn leave_call(
        &self,
        state: &mut SignalingState,
        connection: ConnectionId,
        to: Option<&str>,
    ) -> Result<(), SignalError> {
        let Some(session) = state.sessions.get_mut(connection) else {
            return Err(missing_session(
                &state.registry,
                &state.connections,
                to,
                "leave-call",
            ));
        };

        // Hanging up must always work, even with a stale `to`.
        if let Some(to) = to {
            let addressed = resolve_target(&state.registry, &state.connections, to);
            if addressed != session.counterpart(connection) {
                warn!(
                    connection_id = %connection,
                    to = %to,
                    "leave-call addressed to someone else; ending current call anyway"
                );
            }
        }

        let notice = session.hang_up(connection, EndReason::HangUp)?;
        let duration_ms = session.age().as_millis() as u64;
        state.sessions.remove(connection);
        counter!(
            "callbox_calls_ended_total",
            1,
            "reason" => EndReason::HangUp.as_str()
        );
        info!(
            connection_id = %connection,
            peer = %notice.to,
            duration_ms,
            "call ended by hang-up"
        );
        let _ = self.send(notice.to, notice.message);
        Ok(())
    }

    fn broadcast_users(&self, state: &SignalingState, users: Vec<User>) {
        for connection in &state.connections {
            let _ = self.send(
                *connection,
                ServerMessage::UserList {
                    users: users.clone(),
                },
            );
        }
    }

    fn settle(
        &self,
        connection: ConnectionId,
        kind: &'static str,
        result: Result<(), SignalError>,
    ) -> Outcome {
        let err = match result {
            Ok(()) => return Outcome::Handled,
            Err(err) => err,
        };
        counter!(
            "callbox_signal_errors_total",
            1,
            "kind" => err.kind().as_str()
        );

        if err.surfaces_to_client() {
            info!(connection_id = %connection, message = kind, error = %err, "request refused");
            let _ = self.send(
                connection,
                ServerMessage::Error {
                    kind: err.kind(),
                    message: err.to_string(),
                },
            );
            Outcome::Rejected(err)
        } else {
            warn!(connection_id = %connection, message = kind, error = %err, "message dropped");
            Outcome::Dropped(err)
        }
    }

    fn send(&self, to: ConnectionId, message: ServerMessage) -> Result<(), DeliveryError> {
        let kind = message.kind();
        self.outbound.deliver(to, message).map_err(|err| {
            counter!(
                "callbox_delivery_failures_total",
                1,
                "reason" => err.metric_label()
            );
            warn!(connection_id = %to, message = kind, error = %err, "failed to deliver frame");
            err
        })
    }
}

/// Accepts either a connection id or a registered user id.
fn resolve_target(
    registry: &Registry,
    connections: &HashSet<ConnectionId>,
    to: &str,
) -> Option<ConnectionId> {
    if let Ok(connection) = to.parse::<ConnectionId>() {
        if connections.contains(&connection) {
            return Some(connection);
        }
    }
    registry.lookup_by_user_id(to)
}

fn missing_session(
    registry: &Registry,
    connections: &HashSet<ConnectionId>,
    to: Option<&str>,
    event: &str,
) -> SignalError {
    match to {
        Some(to) if resolve_target(registry, connections, to).is_some() => {
            SignalError::invalid_transition("idle", event)
        }
        Some(to) => SignalError::target_not_found(to),
        None => SignalError::target_not_found("call"),
    }
}
