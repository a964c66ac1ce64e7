//! JSON frames exchanged between clients and the relay.
//!
//! Every frame is an object carrying a `type` discriminator. Inbound frames are
//! decoded in two steps so that an unrecognised `type` (ignored for forward
//! compatibility) can be told apart from a recognised one with bad fields
//! (dropped as malformed).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ErrorKind;
use crate::ids::ConnectionId;
use crate::negotiation::EndReason;
use crate::registry::User;

/// Every `type` value a client may send.
pub const CLIENT_MESSAGE_KINDS: &[&str] = &[
    "register",
    "get-users",
    "initiate-call",
    "answer-call",
    "signal",
    "ice-candidate",
    "leave-call",
];

/// Offer or answer body. The relay never looks inside `sdp`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self {
            kind: None,
            sdp: sdp.into(),
        }
    }
}

/// Network-reachability candidate, carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u32>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Negotiation payload fed into a call's state machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalPayload {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

impl SignalPayload {
    pub fn name(&self) -> &'static str {
        match self {
            SignalPayload::Offer(_) => "offer",
            SignalPayload::Answer(_) => "answer",
            SignalPayload::Candidate(_) => "candidate",
        }
    }
}

/// Messages sent from a client to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Claim a user id on this connection, replacing any older claim.
    #[serde(rename_all = "camelCase")]
    Register {
        user_id: String,
        display_name: String,
    },
    /// Ask for the current user list without registering.
    GetUsers,
    /// Ring another user with an offer.
    #[serde(rename_all = "camelCase")]
    InitiateCall {
        target_user_id: String,
        offer: SessionDescription,
        /// Only used when the caller never registered.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        display_name: Option<String>,
    },
    /// Accept the ringing call with an answer.
    AnswerCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        answer: SessionDescription,
    },
    #[serde(alias = "ice-candidate")]
    Signal {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
        #[serde(flatten)]
        candidate: IceCandidate,
    },
    /// Hang up (or cancel the outgoing ring).
    LeaveCall {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<String>,
    },
}

impl ClientMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientMessage::Register { .. } => "register",
            ClientMessage::GetUsers => "get-users",
            ClientMessage::InitiateCall { .. } => "initiate-call",
            ClientMessage::AnswerCall { .. } => "answer-call",
            ClientMessage::Signal { .. } => "signal",
            ClientMessage::LeaveCall { .. } => "leave-call",
        }
    }

    /// Decodes one text frame.
    pub fn decode(text: &str) -> Result<Self, DecodeError> {
        let value: Value =
            serde_json::from_str(text).map_err(|err| DecodeError::NotJson(err.to_string()))?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(DecodeError::MissingKind)?
            .to_string();
        if !CLIENT_MESSAGE_KINDS.contains(&kind.as_str()) {
            return Err(DecodeError::UnknownKind(kind));
        }

        let message: ClientMessage =
            serde_json::from_value(value).map_err(|err| DecodeError::InvalidFields {
                kind: kind.clone(),
                reason: err.to_string(),
            })?;
        message
            .validate()
            .map_err(|reason| DecodeError::InvalidFields { kind, reason })?;
        Ok(message)
    }

    fn validate(&self) -> Result<(), String> {
        match self {
            ClientMessage::Register {
                user_id,
                display_name,
            } => {
                require("userId", user_id)?;
                require("displayName", display_name)
            }
            ClientMessage::InitiateCall { target_user_id, .. } => {
                require("targetUserId", target_user_id)
            }
            // An empty candidate string marks end-of-candidates and is relayed as is.
            ClientMessage::GetUsers
            | ClientMessage::Signal { .. }
            | ClientMessage::AnswerCall { .. }
            | ClientMessage::LeaveCall { .. } => Ok(()),
        }
    }
}

fn require(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        Err(format!("`{field}` must not be empty"))
    } else {
        Ok(())
    }
}

/// Why an inbound frame could not be turned into a [`ClientMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame is not valid JSON: {0}")]
    NotJson(String),
    #[error("frame has no string `type` field")]
    MissingKind,
    #[error("unknown message type `{0}`")]
    UnknownKind(String),
    #[error("invalid `{kind}` message: {reason}")]
    InvalidFields { kind: String, reason: String },
}

impl DecodeError {
    pub fn is_unknown_kind(&self) -> bool {
        matches!(self, DecodeError::UnknownKind(_))
    }
}

/// Messages sent from the relay to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First frame on every connection.
    #[serde(rename_all = "camelCase")]
    Identity { connection_id: ConnectionId },
    #[serde(rename = "userList")]
    UserList { users: Vec<User> },
    #[serde(rename_all = "camelCase")]
    IncomingCall {
        signal: SessionDescription,
        from: ConnectionId,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    CallAccepted {
        signal: SessionDescription,
        from: ConnectionId,
    },
    IceCandidate {
        from: ConnectionId,
        candidate: IceCandidate,
    },
    CallEnded {
        from: ConnectionId,
        reason: EndReason,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Identity { .. } => "identity",
            ServerMessage::UserList { .. } => "userList",
            ServerMessage::IncomingCall { .. } => "incoming-call",
            ServerMessage::CallAccepted { .. } => "call-accepted",
            ServerMessage::IceCandidate { .. } => "ice-candidate",
            ServerMessage::CallEnded { .. } => "call-ended",
            ServerMessage::Error { .. } => "error",
        }
    }
}
