//! Frame transport seam and the in-memory implementation.
//!
//! The broadcaster encodes control messages into opaque frames; a
//! [`Transport`] moves a frame to one node. Production deployments plug a
//! gossip or HTTP transport in here. [`MemoryTransport`] routes frames
//! through a shared registry instead — multi-node tests and
//! single-process demo clusters go through the exact same frame codec and
//! dispatch as the real thing.

use std::sync::Arc;

use dashmap::DashMap;

use tessera_core::broadcast::{decode_frame, encode_frame};
use tessera_core::{Broadcaster, CoreError, Message, Node};

use crate::error::ServerError;

/// Receiving side of the transport: every node interprets the decoded
/// control messages itself.
pub trait MessageHandler: Send + Sync {
    fn receive_message(&self, msg: Message) -> Result<(), ServerError>;
}

/// Moves one opaque frame to one node.
pub trait Transport: Send + Sync {
    fn deliver(&self, node: &Node, frame: &[u8]) -> Result<(), ServerError>;
}

// ─────────────────────────────────────────────
// MemoryTransport
// ─────────────────────────────────────────────

/// In-process transport: a registry of handlers keyed by node URI.
#[derive(Default)]
pub struct MemoryTransport {
    handlers: DashMap<String, Arc<dyn MessageHandler>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, uri: &str, handler: Arc<dyn MessageHandler>) {
        self.handlers.insert(uri.to_string(), handler);
    }

    /// Simulate a node failure: frames to this URI start failing.
    pub fn deregister(&self, uri: &str) {
        self.handlers.remove(uri);
    }
}

impl Transport for MemoryTransport {
    fn deliver(&self, node: &Node, frame: &[u8]) -> Result<(), ServerError> {
        let handler = self
            .handlers
            .get(&node.uri.to_string())
            .map(|h| h.clone())
            .ok_or_else(|| ServerError::Unreachable(node.uri.to_string()))?;
        let msg = decode_frame(frame)?;
        handler.receive_message(msg)
    }
}

// ─────────────────────────────────────────────
// TransportBroadcaster
// ─────────────────────────────────────────────

/// [`Broadcaster`] implementation over a [`Transport`]: fan-out to every
/// non-self cluster member, all-or-fail for `send_sync`.
pub struct TransportBroadcaster {
    transport: Arc<dyn Transport>,
    cluster: Arc<tessera_cluster::Cluster>,
    local: Node,
}

impl TransportBroadcaster {
    pub fn new(
        transport: Arc<dyn Transport>,
        cluster: Arc<tessera_cluster::Cluster>,
        local: Node,
    ) -> Self {
        Self {
            transport,
            cluster,
            local,
        }
    }

    fn fan_out(&self, msg: &Message, must_ack: bool) -> Result<(), CoreError> {
        let frame = encode_frame(msg)?;
        for node in self.cluster.nodes() {
            if node.uri == self.local.uri {
                continue;
            }
            if let Err(e) = self.transport.deliver(&node, &frame) {
                if must_ack {
                    return Err(CoreError::Broadcast(format!(
                        "{} rejected {}: {e}",
                        node.id,
                        msg.tag()
                    )));
                }
                tracing::debug!(node = %node.id, tag = msg.tag(), error = %e, "async send dropped");
            }
        }
        Ok(())
    }
}

impl Broadcaster for TransportBroadcaster {
    fn send_sync(&self, msg: &Message) -> Result<(), CoreError> {
        self.fan_out(msg, true)
    }

    fn send_async(&self, msg: &Message) -> Result<(), CoreError> {
        self.fan_out(msg, false)
    }

    fn send_to(&self, node: &Node, msg: &Message) -> Result<(), CoreError> {
        let frame = encode_frame(msg)?;
        self.transport
            .deliver(node, &frame)
            .map_err(|e| CoreError::Broadcast(format!("{}: {e}", node.id)))
    }
}

// ─────────────────────────────────────────────
// BroadcastRelay
// ─────────────────────────────────────────────

/// Construction-order shim: the holder and cluster need a broadcaster
/// before the transport broadcaster (which needs the cluster) can exist.
/// The relay is injected first and wired once at the end of assembly;
/// until then it behaves like a nop broadcaster.
#[derive(Default)]
pub struct BroadcastRelay {
    inner: std::sync::OnceLock<Arc<dyn Broadcaster>>,
}

impl BroadcastRelay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn wire(&self, broadcaster: Arc<dyn Broadcaster>) {
        let _ = self.inner.set(broadcaster);
    }
}

impl Broadcaster for BroadcastRelay {
    fn send_sync(&self, msg: &Message) -> Result<(), CoreError> {
        match self.inner.get() {
            Some(b) => b.send_sync(msg),
            None => Ok(()),
        }
    }

    fn send_async(&self, msg: &Message) -> Result<(), CoreError> {
        match self.inner.get() {
            Some(b) => b.send_async(msg),
            None => Ok(()),
        }
    }

    fn send_to(&self, node: &Node, msg: &Message) -> Result<(), CoreError> {
        match self.inner.get() {
            Some(b) => b.send_to(node, msg),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tessera_core::Uri;

    struct Recorder {
        got: Mutex<Vec<Message>>,
    }

    impl MessageHandler for Recorder {
        fn receive_message(&self, msg: Message) -> Result<(), ServerError> {
            self.got.lock().unwrap_or_else(|e| e.into_inner()).push(msg);
            Ok(())
        }
    }

    #[test]
    fn frames_reach_registered_handlers() {
        let transport = MemoryTransport::new();
        let recorder = Arc::new(Recorder {
            got: Mutex::new(Vec::new()),
        });
        transport.register("http://a:1", recorder.clone());

        let node = Node::new("aa", Uri::parse("http://a:1").unwrap());
        let frame = encode_frame(&Message::RecalculateCaches).unwrap();
        transport.deliver(&node, &frame).unwrap();

        assert_eq!(
            *recorder.got.lock().unwrap(),
            vec![Message::RecalculateCaches]
        );
    }

    #[test]
    fn unregistered_nodes_are_unreachable() {
        let transport = MemoryTransport::new();
        let node = Node::new("aa", Uri::parse("http://a:1").unwrap());
        let frame = encode_frame(&Message::RecalculateCaches).unwrap();
        assert!(matches!(
            transport.deliver(&node, &frame),
            Err(ServerError::Unreachable(_))
        ));
    }

    #[test]
    fn unwired_relay_swallows_messages() {
        let relay = BroadcastRelay::new();
        assert!(relay.send_sync(&Message::RecalculateCaches).is_ok());
    }
}
