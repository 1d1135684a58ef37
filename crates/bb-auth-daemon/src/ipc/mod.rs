//! Local-socket IPC layer.
//!
//! The transport is a Unix stream socket carrying newline-delimited UTF-8
//! JSON objects, one message per line, at most
//! [`MAX_MESSAGE_SIZE`](bb_auth_core::constants::MAX_MESSAGE_SIZE) bytes
//! each. The layer is split into:
//!
//! - [`codec`]: the [`LineCodec`] frame decoder/encoder
//! - [`server`]: listener, per-connection reader/writer tasks, peer
//!   credentials
//!
//! Connections surface to the rest of the daemon only as opaque
//! [`ClientId`] handles; the engine never touches a socket directly. Each
//! connection owns a send queue of [`OutboundFrame`]s drained by its writer
//! task, and every flattened frame is wiped once the write completes, so
//! replies that carry a password get the wipe without a special path.

pub mod codec;
pub mod server;

use std::collections::HashMap;

use serde_json::Value;
use tokio::sync::mpsc;
use zeroize::Zeroizing;

pub use codec::LineCodec;
pub use server::IpcServer;

/// Opaque handle for one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// A serialized outbound line, wiped on drop.
pub struct OutboundFrame(pub Zeroizing<Vec<u8>>);

/// Serializes a JSON value into a newline-terminated frame.
#[must_use]
pub fn encode_frame(value: &Value) -> OutboundFrame {
    let mut buf = serde_json::to_vec(value).unwrap_or_default();
    buf.push(b'\n');
    OutboundFrame(Zeroizing::new(buf))
}

/// Send queues for all live connections, keyed by [`ClientId`].
///
/// The agent owns the outbox; reader/writer tasks own the other ends of
/// the queues. A send to a detached or closed queue is silently dropped,
/// which is the correct behavior for every call site: disconnection
/// cleanup is driven separately by the `ClientDisconnected` event.
#[derive(Default)]
pub struct Outbox {
    clients: HashMap<ClientId, mpsc::UnboundedSender<OutboundFrame>>,
}

impl Outbox {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection's send queue.
    pub fn attach(&mut self, id: ClientId, tx: mpsc::UnboundedSender<OutboundFrame>) {
        self.clients.insert(id, tx);
    }

    /// Drops a connection's send queue.
    pub fn detach(&mut self, id: ClientId) {
        self.clients.remove(&id);
    }

    /// Queues one JSON message for `id`. Returns whether it was accepted.
    pub fn send(&self, id: ClientId, value: &Value) -> bool {
        match self.clients.get(&id) {
            Some(tx) => tx.send(encode_frame(value)).is_ok(),
            None => false,
        }
    }

    /// Whether `id` still has a live writer.
    #[must_use]
    pub fn is_connected(&self, id: ClientId) -> bool {
        self.clients.get(&id).is_some_and(|tx| !tx.is_closed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn encode_appends_newline() {
        let frame = encode_frame(&json!({ "type": "ok" }));
        assert_eq!(frame.0.last(), Some(&b'\n'));
        assert!(frame.0.starts_with(b"{"));
    }

    #[test]
    fn outbox_send_and_detach() {
        let mut outbox = Outbox::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = ClientId(1);

        outbox.attach(id, tx);
        assert!(outbox.is_connected(id));
        assert!(outbox.send(id, &json!({ "type": "pong" })));
        assert!(rx.try_recv().is_ok());

        outbox.detach(id);
        assert!(!outbox.is_connected(id));
        assert!(!outbox.send(id, &json!({ "type": "pong" })));
    }

    #[test]
    fn outbox_detects_closed_receiver() {
        let mut outbox = Outbox::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ClientId(2);
        outbox.attach(id, tx);

        drop(rx);
        assert!(!outbox.is_connected(id));
    }
}
