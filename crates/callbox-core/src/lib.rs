//! Signaling coordination core for the Callbox relay.
//!
//! Two clients set up a direct audio/video call by exchanging offers, answers
//! and ICE candidates through the relay. This crate owns everything between a
//! decoded inbound frame and the outbound frames it produces: the user
//! registry, the call session table, the per-call negotiation state machine
//! and the router that ties them together. It never touches sockets; the
//! network-facing process plugs in through [`Outbound`].

pub mod error;
pub mod ids;
pub mod negotiation;
pub mod outbound;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod session;

pub use error::{ErrorKind, SignalError};
pub use ids::ConnectionId;
pub use negotiation::{CallSession, CallState, EndReason, NegotiationError, Role};
pub use outbound::{DeliveryError, Outbound};
pub use protocol::{
    ClientMessage, DecodeError, IceCandidate, ServerMessage, SessionDescription, SignalPayload,
};
pub use registry::{Registry, User};
pub use router::{Outcome, Router, RouterConfig, RouterStats};
pub use session::{SessionError, SessionTable};
