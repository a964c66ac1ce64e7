//! Per-connection outbound channels.
//!
//! The router hands frames to the hub while it holds its state lock, so
//! delivery is a `try_send` into a bounded channel. Each connection's writer
//! task drains its channel onto the socket.

use std::sync::Arc;

use callbox_core::{ConnectionId, DeliveryError, Outbound, ServerMessage};
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};

#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    senders: DashMap<ConnectionId, mpsc::Sender<ServerMessage>>,
    buffer: usize,
}

impl ConnectionHub {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                senders: DashMap::new(),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Opens a channel for a new connection and returns its id with the
    /// receiving end for the writer task.
    pub fn attach(&self) -> (ConnectionId, mpsc::Receiver<ServerMessage>) {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let connection_id = ConnectionId::new();
        self.inner.senders.insert(connection_id, tx);
        (connection_id, rx)
    }

    /// Drops the sender; the writer finishes once queued frames are flushed.
    pub fn detach(&self, connection_id: ConnectionId) -> bool {
        self.inner.senders.remove(&connection_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.senders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.senders.is_empty()
    }
}

impl Outbound for ConnectionHub {
    fn deliver(&self, to: ConnectionId, message: ServerMessage) -> Result<(), DeliveryError> {
        let sender = self
            .inner
            .senders
            .get(&to)
            .ok_or(DeliveryError::Closed)?;
        sender.try_send(message).map_err(|err| match err {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(connection_id: ConnectionId) -> ServerMessage {
        ServerMessage::Identity { connection_id }
    }

    #[test_timeout::timeout]
    fn delivers_to_attached_connection() {
        let hub = ConnectionHub::new(4);
        let (id, mut rx) = hub.attach();

        hub.deliver(id, identity(id)).expect("deliver");
        assert_eq!(rx.try_recv().ok(), Some(identity(id)));
        assert_eq!(hub.len(), 1);
    }

    #[test_timeout::timeout]
    fn unknown_or_detached_connection_is_closed() {
        let hub = ConnectionHub::new(4);
        let stranger = ConnectionId::new();
        assert_eq!(
            hub.deliver(stranger, identity(stranger)),
            Err(DeliveryError::Closed)
        );

        let (id, _rx) = hub.attach();
        assert!(hub.detach(id));
        assert!(!hub.detach(id));
        assert_eq!(hub.deliver(id, identity(id)), Err(DeliveryError::Closed));
        assert!(hub.is_empty());
    }

    #[test_timeout::timeout]
    fn full_buffer_and_dropped_writer_are_reported() {
        let hub = ConnectionHub::new(1);
        let (id, rx) = hub.attach();

        hub.deliver(id, identity(id)).expect("first frame fits");
        assert_eq!(hub.deliver(id, identity(id)), Err(DeliveryError::Full));

        drop(rx);
        assert_eq!(hub.deliver(id, identity(id)), Err(DeliveryError::Closed));
    }
}
