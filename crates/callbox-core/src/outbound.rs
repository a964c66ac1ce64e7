use thiserror::Error;

use crate::ids::ConnectionId;
use crate::protocol::ServerMessage;

/// Hands a frame to a connection's writer.
///
/// Called while the router holds its state lock, so implementations must not
/// block or perform socket I/O; enqueue and return.
pub trait Outbound: Send + Sync {
    fn deliver(&self, to: ConnectionId, message: ServerMessage) -> Result<(), DeliveryError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    #[error("connection is closed")]
    Closed,
    #[error("outbound buffer is full")]
    Full,
}

impl DeliveryError {
    pub fn metric_label(&self) -> &'static str {
        match self {
            DeliveryError::Closed => "closed",
            DeliveryError::Full => "full",
        }
    }
}
