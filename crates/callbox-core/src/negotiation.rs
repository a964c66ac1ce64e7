//! Per-call negotiation state machine.
//!
//! A call starts in `Offering` as soon as the caller's offer has been accepted
//! for delivery, moves to `Connected` when the callee answers, and finishes in
//! `Ended` (hang-up or disconnect) or `Rejected` (the callee could not be
//! reached). There is no explicit `Idle` state: a connection with no
//! [`CallSession`] is idle.
//!
//! Candidates that arrive while the call is still `Offering` are held per
//! direction and released, in arrival order, right after the answer is
//! forwarded. Neither side can apply a candidate before it has both
//! descriptions: the caller lacks the answer and the callee has not accepted
//! the offer yet.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SignalError;
use crate::ids::ConnectionId;
use crate::protocol::{IceCandidate, ServerMessage, SessionDescription, SignalPayload};

pub const DEFAULT_MAX_PENDING_CANDIDATES: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Offering,
    Connected,
    Ended,
    Rejected,
}

impl CallState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Offering => "offering",
            CallState::Connected => "connected",
            CallState::Ended => "ended",
            CallState::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CallState::Ended | CallState::Rejected)
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Initiator,
    Responder,
}

/// Why a call stopped, as reported in `call-ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    HangUp,
    PeerDisconnected,
    Unreachable,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::HangUp => "hang_up",
            EndReason::PeerDisconnected => "peer_disconnected",
            EndReason::Unreachable => "unreachable",
            EndReason::Shutdown => "shutdown",
        }
    }
}

/// A frame the state machine wants sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub to: ConnectionId,
    pub message: ServerMessage,
}

/// What applying a payload did to the call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Frames to send, in order.
    Forward(Vec<Delivery>),
    /// The candidate is parked until the answer arrives.
    Queued { for_role: Role, depth: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error("connection {connection} is not part of this call")]
    NotParticipant { connection: ConnectionId },
    #[error("connection {connection} is not the callee of this call")]
    NotResponder { connection: ConnectionId },
    #[error("`{event}` is not valid while the call is {state}")]
    InvalidTransition { state: CallState, event: &'static str },
    #[error("candidate queue for {to} is full ({limit} pending)")]
    QueueFull { to: ConnectionId, limit: usize },
}

impl From<NegotiationError> for SignalError {
    fn from(err: NegotiationError) -> Self {
        match err {
            NegotiationError::InvalidTransition { state, event } => {
                SignalError::invalid_transition(state.as_str(), event)
            }
            NegotiationError::NotParticipant { .. } => {
                SignalError::invalid_transition("unrelated", "signal")
            }
            NegotiationError::NotResponder { .. } => {
                SignalError::invalid_transition(CallState::Offering.as_str(), "answer from caller")
            }
            NegotiationError::QueueFull { .. } => {
                SignalError::invalid_transition(CallState::Offering.as_str(), "candidate overflow")
            }
        }
    }
}

#[derive(Debug, Default)]
struct PendingCandidates {
    to_initiator: VecDeque<IceCandidate>,
    to_responder: VecDeque<IceCandidate>,
}

impl PendingCandidates {
    fn queue_for(&mut self, role: Role) -> &mut VecDeque<IceCandidate> {
        match role {
            Role::Initiator => &mut self.to_initiator,
            Role::Responder => &mut self.to_responder,
        }
    }

    fn clear(&mut self) {
        self.to_initiator.clear();
        self.to_responder.clear();
    }
}

/// One two-party call and its negotiation progress.
#[derive(Debug)]
pub struct CallSession {
    initiator: ConnectionId,
    responder: ConnectionId,
    state: CallState,
    pending: PendingCandidates,
    max_pending: usize,
    started_at: Instant,
}

impl CallSession {
    /// Starts a call in `Offering` and returns the `incoming-call` frame for the callee.
    pub fn open(
        initiator: ConnectionId,
        responder: ConnectionId,
        offer: SessionDescription,
        caller_name: String,
        caller_user_id: Option<String>,
        max_pending: usize,
    ) -> (Self, Delivery) {
        let session = Self {
            initiator,
            responder,
            state: CallState::Offering,
            pending: PendingCandidates::default(),
            max_pending,
            started_at: Instant::now(),
        };
        let ring = Delivery {
            to: responder,
            message: ServerMessage::IncomingCall {
                signal: offer,
                from: initiator,
                display_name: caller_name,
                user_id: caller_user_id,
            },
        };
        (session, ring)
    }

    pub fn initiator(&self) -> ConnectionId {
        self.initiator
    }

    pub fn responder(&self) -> ConnectionId {
        self.responder
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn role_of(&self, connection: ConnectionId) -> Option<Role> {
        if connection == self.initiator {
            Some(Role::Initiator)
        } else if connection == self.responder {
            Some(Role::Responder)
        } else {
            None
        }
    }

    pub fn counterpart(&self, connection: ConnectionId) -> Option<ConnectionId> {
        match self.role_of(connection)? {
            Role::Initiator => Some(self.responder),
            Role::Responder => Some(self.initiator),
        }
    }

    fn connection_for(&self, role: Role) -> ConnectionId {
        match role {
            Role::Initiator => self.initiator,
            Role::Responder => self.responder,
        }
    }

    pub fn pending_for(&self, role: Role) -> usize {
        match role {
            Role::Initiator => self.pending.to_initiator.len(),
            Role::Responder => self.pending.to_responder.len(),
        }
    }

    /// Feeds one negotiation payload from `sender` into the call.
    pub fn apply(
        &mut self,
        sender: ConnectionId,
        payload: SignalPayload,
    ) -> Result<Transition, NegotiationError> {
        let sender_role = self
            .role_of(sender)
            .ok_or(NegotiationError::NotParticipant { connection: sender })?;

        match payload {
            SignalPayload::Offer(_) => Err(NegotiationError::InvalidTransition {
                state: self.state,
                event: "offer",
            }),
            SignalPayload::Answer(answer) => self.accept(sender_role, sender, answer),
            SignalPayload::Candidate(candidate) => self.relay_candidate(sender_role, candidate),
        }
    }

    fn accept(
        &mut self,
        sender_role: Role,
        sender: ConnectionId,
        answer: SessionDescription,
    ) -> Result<Transition, NegotiationError> {
        if self.state != CallState::Offering {
            return Err(NegotiationError::InvalidTransition {
                state: self.state,
                event: "answer",
            });
        }
        if sender_role != Role::Responder {
            return Err(NegotiationError::NotResponder { connection: sender });
        }

        self.state = CallState::Connected;

        let mut deliveries = Vec::with_capacity(
            1 + self.pending.to_initiator.len() + self.pending.to_responder.len(),
        );
        deliveries.push(Delivery {
            to: self.initiator,
            message: ServerMessage::CallAccepted {
                signal: answer,
                from: self.responder,
            },
        });
        for candidate in self.pending.to_initiator.drain(..) {
            deliveries.push(Delivery {
                to: self.initiator,
                message: ServerMessage::IceCandidate {
                    from: self.responder,
                    candidate,
                },
            });
        }
        for candidate in self.pending.to_responder.drain(..) {
            deliveries.push(Delivery {
                to: self.responder,
                message: ServerMessage::IceCandidate {
                    from: self.initiator,
                    candidate,
                },
            });
        }
        Ok(Transition::Forward(deliveries))
    }

    fn relay_candidate(
        &mut self,
        sender_role: Role,
        candidate: IceCandidate,
    ) -> Result<Transition, NegotiationError> {
        let receiver_role = match sender_role {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        };
        let from = self.connection_for(sender_role);
        let to = self.connection_for(receiver_role);

        match self.state {
            CallState::Offering => {
                let limit = self.max_pending;
                let queue = self.pending.queue_for(receiver_role);
                if queue.len() >= limit {
                    return Err(NegotiationError::QueueFull { to, limit });
                }
                queue.push_back(candidate);
                Ok(Transition::Queued {
                    for_role: receiver_role,
                    depth: queue.len(),
                })
            }
            CallState::Connected => Ok(Transition::Forward(vec![Delivery {
                to,
                message: ServerMessage::IceCandidate { from, candidate },
            }])),
            state @ (CallState::Ended | CallState::Rejected) => {
                Err(NegotiationError::InvalidTransition {
                    state,
                    event: "candidate",
                })
            }
        }
    }

    /// Ends the call on behalf of `by` and returns the notice for the other side.
    pub fn hang_up(
        &mut self,
        by: ConnectionId,
        reason: EndReason,
    ) -> Result<Delivery, NegotiationError> {
        let counterpart = self
            .counterpart(by)
            .ok_or(NegotiationError::NotParticipant { connection: by })?;
        if self.state.is_terminal() {
            return Err(NegotiationError::InvalidTransition {
                state: self.state,
                event: "leave-call",
            });
        }

        self.state = CallState::Ended;
        self.pending.clear();
        Ok(Delivery {
            to: counterpart,
            message: ServerMessage::CallEnded { from: by, reason },
        })
    }

    /// The callee could not be rung; nobody is left to notify.
    pub fn reject(&mut self) -> Result<(), NegotiationError> {
        if self.state != CallState::Offering {
            return Err(NegotiationError::InvalidTransition {
                state: self.state,
                event: "reject",
            });
        }
        self.state = CallState::Rejected;
        self.pending.clear();
        Ok(())
    }

    /// Ends a live call from the relay's side, notifying both participants.
    pub fn terminate(&mut self, reason: EndReason) -> Vec<Delivery> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        self.state = CallState::Ended;
        self.pending.clear();
        vec![
            Delivery {
                to: self.initiator,
                message: ServerMessage::CallEnded {
                    from: self.responder,
                    reason,
                },
            },
            Delivery {
                to: self.responder,
                message: ServerMessage::CallEnded {
                    from: self.initiator,
                    reason,
                },
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offering() -> (CallSession, ConnectionId, ConnectionId) {
        let caller = ConnectionId::new();
        let callee = ConnectionId::new();
        let (session, _) = CallSession::open(
            caller,
            callee,
            SessionDescription::new("O"),
            "Alice".into(),
            Some("u1".into()),
            DEFAULT_MAX_PENDING_CANDIDATES,
        );
        (session, caller, callee)
    }

    fn candidate(n: usize) -> SignalPayload {
        SignalPayload::Candidate(IceCandidate::new(format!("candidate-{n}")))
    }

    fn candidate_names(deliveries: &[Delivery], to: ConnectionId) -> Vec<String> {
        deliveries
            .iter()
            .filter(|delivery| delivery.to == to)
            .filter_map(|delivery| match &delivery.message {
                ServerMessage::IceCandidate { candidate, .. } => Some(candidate.candidate.clone()),
                _ => None,
            })
            .collect()
    }

    #[test_timeout::timeout]
    fn open_rings_the_callee_with_the_offer() {
        let caller = ConnectionId::new();
        let callee = ConnectionId::new();
        let (session, ring) = CallSession::open(
            caller,
            callee,
            SessionDescription::new("O"),
            "Alice".into(),
            None,
            4,
        );
        assert_eq!(session.state(), CallState::Offering);
        assert_eq!(ring.to, callee);
        assert_eq!(
            ring.message,
            ServerMessage::IncomingCall {
                signal: SessionDescription::new("O"),
                from: caller,
                display_name: "Alice".into(),
                user_id: None,
            }
        );
    }

    #[test_timeout::timeout]
    fn answer_from_callee_connects_and_flushes_queues_in_order() {
        let (mut session, caller, callee) = offering();

        for n in 0..3 {
            let queued = session.apply(caller, candidate(n)).expect("queue candidate");
            assert_eq!(
                queued,
                Transition::Queued {
                    for_role: Role::Responder,
                    depth: n + 1
                }
            );
        }
        session
            .apply(callee, candidate(10))
            .expect("queue callee candidate");

        let Transition::Forward(deliveries) = session
            .apply(callee, SignalPayload::Answer(SessionDescription::new("A")))
            .expect("answer")
        else {
            panic!("answer should forward");
        };

        assert_eq!(session.state(), CallState::Connected);
        assert_eq!(deliveries[0].to, caller);
        assert!(matches!(
            deliveries[0].message,
            ServerMessage::CallAccepted { ref signal, from } if signal.sdp == "A" && from == callee
        ));
        assert_eq!(candidate_names(&deliveries, caller), vec!["candidate-10"]);
        assert_eq!(
            candidate_names(&deliveries, callee),
            vec!["candidate-0", "candidate-1", "candidate-2"]
        );
        assert_eq!(session.pending_for(Role::Responder), 0);
        assert_eq!(session.pending_for(Role::Initiator), 0);
    }

    #[test_timeout::timeout]
    fn candidates_after_connect_forward_immediately() {
        let (mut session, caller, callee) = offering();
        session
            .apply(callee, SignalPayload::Answer(SessionDescription::new("A")))
            .expect("answer");

        let transition = session.apply(caller, candidate(7)).expect("forward");
        assert_eq!(
            transition,
            Transition::Forward(vec![Delivery {
                to: callee,
                message: ServerMessage::IceCandidate {
                    from: caller,
                    candidate: IceCandidate::new("candidate-7"),
                },
            }])
        );
    }

    #[test_timeout::timeout]
    fn answer_from_caller_is_refused_without_state_change() {
        let (mut session, caller, _) = offering();
        let err = session
            .apply(caller, SignalPayload::Answer(SessionDescription::new("A")))
            .unwrap_err();
        assert_eq!(err, NegotiationError::NotResponder { connection: caller });
        assert_eq!(session.state(), CallState::Offering);
    }

    #[test_timeout::timeout]
    fn duplicate_answer_is_an_invalid_transition() {
        let (mut session, _, callee) = offering();
        let answer = SignalPayload::Answer(SessionDescription::new("A"));
        session.apply(callee, answer.clone()).expect("first answer");
        let err = session.apply(callee, answer).unwrap_err();
        assert_eq!(
            err,
            NegotiationError::InvalidTransition {
                state: CallState::Connected,
                event: "answer"
            }
        );
    }

    #[test_timeout::timeout]
    fn outsiders_and_renegotiation_are_refused() {
        let (mut session, caller, _) = offering();
        let stranger = ConnectionId::new();
        assert_eq!(
            session.apply(stranger, candidate(0)).unwrap_err(),
            NegotiationError::NotParticipant {
                connection: stranger
            }
        );
        assert!(matches!(
            session.apply(caller, SignalPayload::Offer(SessionDescription::new("O2"))),
            Err(NegotiationError::InvalidTransition { event: "offer", .. })
        ));
    }

    #[test_timeout::timeout]
    fn queue_overflow_keeps_earlier_candidates() {
        let caller = ConnectionId::new();
        let callee = ConnectionId::new();
        let (mut session, _) = CallSession::open(
            caller,
            callee,
            SessionDescription::new("O"),
            "Alice".into(),
            None,
            2,
        );
        session.apply(caller, candidate(0)).expect("first");
        session.apply(caller, candidate(1)).expect("second");
        assert_eq!(
            session.apply(caller, candidate(2)).unwrap_err(),
            NegotiationError::QueueFull {
                to: callee,
                limit: 2
            }
        );

        let Transition::Forward(deliveries) = session
            .apply(callee, SignalPayload::Answer(SessionDescription::new("A")))
            .expect("answer")
        else {
            panic!("answer should forward");
        };
        assert_eq!(
            candidate_names(&deliveries, callee),
            vec!["candidate-0", "candidate-1"]
        );
    }

    #[test_timeout::timeout]
    fn hang_up_during_ring_or_call_ends_and_notifies_counterpart() {
        let (mut ringing, caller, callee) = offering();
        let notice = ringing.hang_up(caller, EndReason::HangUp).expect("hang up");
        assert_eq!(ringing.state(), CallState::Ended);
        assert_eq!(notice.to, callee);

        let (mut connected, caller, callee) = offering();
        connected
            .apply(callee, SignalPayload::Answer(SessionDescription::new("A")))
            .expect("answer");
        let notice = connected
            .hang_up(callee, EndReason::PeerDisconnected)
            .expect("hang up");
        assert_eq!(
            notice,
            Delivery {
                to: caller,
                message: ServerMessage::CallEnded {
                    from: callee,
                    reason: EndReason::PeerDisconnected,
                },
            }
        );
        assert!(connected.hang_up(caller, EndReason::HangUp).is_err());
        assert!(connected.apply(caller, candidate(1)).is_err());
    }

    #[test_timeout::timeout]
    fn reject_only_from_offering() {
        let (mut session, _, callee) = offering();
        session.reject().expect("reject");
        assert_eq!(session.state(), CallState::Rejected);
        assert!(session.reject().is_err());
        assert!(session
            .apply(callee, SignalPayload::Answer(SessionDescription::new("A")))
            .is_err());
    }

    #[test_timeout::timeout]
    fn terminate_notifies_both_sides_once() {
        let (mut session, caller, callee) = offering();
        let notices = session.terminate(EndReason::Shutdown);
        let recipients: Vec<ConnectionId> = notices.iter().map(|d| d.to).collect();
        assert_eq!(recipients, vec![caller, callee]);
        assert!(session.terminate(EndReason::Shutdown).is_empty());
    }
}
