//! Fan-out dispatcher for Beam.
//!
//! The dispatcher owns the map from connection ids to outbound frame
//! queues. Delivery is best-effort and non-blocking: each connection has
//! its own unbounded queue drained by its own writer task, so a slow or
//! broken recipient can never stall delivery to the others.

use beam_protocol::ServerFrame;
use dashmap::DashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Create a new connection ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        Self(format!("conn_{:x}", timestamp))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Outbound frame queue for one connection.
pub type OutboundSender = mpsc::UnboundedSender<ServerFrame>;

/// Delivers frames to connections: unicast, session broadcast, and the
/// opaque signaling relay.
#[derive(Debug, Default)]
pub struct Dispatcher {
    sinks: DashMap<ConnectionId, OutboundSender>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of attached connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sinks.len()
    }

    /// Attach a connection's outbound queue.
    pub fn attach(&self, conn: ConnectionId, sender: OutboundSender) {
        debug!(connection = %conn, "Connection attached");
        self.sinks.insert(conn, sender);
    }

    /// Detach a connection. Idempotent.
    pub fn detach(&self, conn: &ConnectionId) {
        if self.sinks.remove(conn).is_some() {
            debug!(connection = %conn, "Connection detached");
        }
    }

    /// Unicast one frame to one connection.
    ///
    /// Returns `false` if the connection is unknown or its queue is closed;
    /// the failure is logged and isolated, never propagated.
    pub fn send(&self, conn: &ConnectionId, frame: ServerFrame) -> bool {
        match self.sinks.get(conn) {
            Some(sink) => {
                if sink.send(frame).is_err() {
                    warn!(connection = %conn, "Delivery failed: outbound queue closed");
                    false
                } else {
                    true
                }
            }
            None => {
                trace!(connection = %conn, "Delivery skipped: connection not attached");
                false
            }
        }
    }

    /// Deliver one frame to every recipient, best-effort.
    ///
    /// Returns the number of successful deliveries. A failed recipient
    /// never blocks or fails delivery to the others.
    pub fn broadcast<'a, I>(&self, recipients: I, frame: &ServerFrame) -> usize
    where
        I: IntoIterator<Item = &'a ConnectionId>,
    {
        let mut delivered = 0;
        for conn in recipients {
            if self.send(conn, frame.clone()) {
                delivered += 1;
            }
        }
        trace!(recipients = delivered, kind = frame.name(), "Broadcast");
        delivered
    }

    /// Relay an opaque signaling frame to a target connection.
    ///
    /// Pure pass-through: the payload is never interpreted.
    pub fn forward(&self, target: &ConnectionId, frame: ServerFrame) -> bool {
        trace!(target = %target, "Forwarding signaling frame");
        self.send(target, frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attach(dispatcher: &Dispatcher, id: &str) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        dispatcher.attach(ConnectionId::from(id), tx);
        rx
    }

    #[test]
    fn test_unicast() {
        let dispatcher = Dispatcher::new();
        let mut rx = attach(&dispatcher, "conn-1");

        assert!(dispatcher.send(&ConnectionId::from("conn-1"), ServerFrame::MemberCount { count: 3 }));
        assert_eq!(rx.try_recv().unwrap(), ServerFrame::MemberCount { count: 3 });
    }

    #[test]
    fn test_unknown_connection_is_isolated() {
        let dispatcher = Dispatcher::new();
        assert!(!dispatcher.send(&ConnectionId::from("ghost"), ServerFrame::MemberCount { count: 0 }));
    }

    #[test]
    fn test_broadcast_counts_only_live_recipients() {
        let dispatcher = Dispatcher::new();
        let mut rx1 = attach(&dispatcher, "conn-1");
        let rx2 = attach(&dispatcher, "conn-2");
        // conn-2's reader is gone; its queue is closed.
        drop(rx2);

        let recipients = vec![
            ConnectionId::from("conn-1"),
            ConnectionId::from("conn-2"),
            ConnectionId::from("ghost"),
        ];
        let frame = ServerFrame::MemberCount { count: 2 };
        let delivered = dispatcher.broadcast(recipients.iter(), &frame);

        assert_eq!(delivered, 1);
        assert_eq!(rx1.try_recv().unwrap(), frame);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let dispatcher = Dispatcher::new();
        let _rx = attach(&dispatcher, "conn-1");
        assert_eq!(dispatcher.connection_count(), 1);

        let conn = ConnectionId::from("conn-1");
        dispatcher.detach(&conn);
        dispatcher.detach(&conn);
        assert_eq!(dispatcher.connection_count(), 0);
    }

    #[test]
    fn test_per_connection_order_preserved() {
        let dispatcher = Dispatcher::new();
        let mut rx = attach(&dispatcher, "conn-1");
        let conn = ConnectionId::from("conn-1");

        for count in 0..5 {
            dispatcher.send(&conn, ServerFrame::MemberCount { count });
        }
        for count in 0..5 {
            assert_eq!(rx.try_recv().unwrap(), ServerFrame::MemberCount { count });
        }
    }
}
