use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ConnectionId;

/// Error category reported to clients in `error` frames and used as a metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    TargetNotFound,
    AlreadyInCall,
    InvalidTransition,
    MalformedMessage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TargetNotFound => "target_not_found",
            ErrorKind::AlreadyInCall => "already_in_call",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::MalformedMessage => "malformed_message",
        }
    }
}

/// Everything the router can refuse. None of these are fatal to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("target `{target}` is not connected")]
    TargetNotFound { target: String },
    #[error("connection {connection} is already in a call")]
    AlreadyInCall { connection: ConnectionId },
    #[error("`{event}` is not valid while the call is {state}")]
    InvalidTransition { state: String, event: String },
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },
}

impl SignalError {
    pub fn target_not_found(target: impl Into<String>) -> Self {
        SignalError::TargetNotFound {
            target: target.into(),
        }
    }

    pub fn invalid_transition(state: impl Into<String>, event: impl Into<String>) -> Self {
        SignalError::InvalidTransition {
            state: state.into(),
            event: event.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::TargetNotFound { .. } => ErrorKind::TargetNotFound,
            SignalError::AlreadyInCall { .. } => ErrorKind::AlreadyInCall,
            SignalError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            SignalError::MalformedMessage { .. } => ErrorKind::MalformedMessage,
        }
    }

    /// Stale retransmissions and malformed frames are only logged; the caller
    /// hears about missing targets and busy peers.
    pub fn surfaces_to_client(&self) -> bool {
        matches!(
            self,
            SignalError::TargetNotFound { .. } | SignalError::AlreadyInCall { .. }
        )
    }
}
