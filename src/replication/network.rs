//! Replica transport
//!
//! [`RaftTransport`] carries opaque frames (CBOR [`Envelope`]s) between
//! replicas. [`SimNetwork`] is an in-process implementation used by tests
//! and the cluster demo; links between nodes can be cut and restored to
//! simulate partitions.
//!
//! [`Envelope`]: super::message::Envelope

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use super::NodeId;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Node {0} is unreachable")]
    Unreachable(NodeId),

    #[error("Transport disconnected")]
    Disconnected,
}

#[async_trait]
pub trait RaftTransport: Send + Sync {
    fn local_id(&self) -> NodeId;

    /// Best-effort delivery; Raft tolerates lost frames.
    async fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Next frame addressed to this node.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;
}

/// The simulated medium shared by all endpoints.
#[derive(Default)]
pub struct SimNetwork {
    inboxes: RwLock<HashMap<NodeId, mpsc::UnboundedSender<Vec<u8>>>>,
    /// Directed links that currently drop frames.
    blocked: RwLock<BTreeSet<(NodeId, NodeId)>>,
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node. Replaces any earlier endpoint with the same id.
    pub fn endpoint(self: &Arc<Self>, id: NodeId) -> SimEndpoint {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.inboxes.write() {
            Ok(mut inboxes) => {
                inboxes.insert(id, tx);
            }
            Err(e) => log::error!("sim network lock poisoned: {e}"),
        }
        SimEndpoint {
            id,
            network: Arc::clone(self),
            rx: Mutex::new(rx),
        }
    }

    /// Drop all frames between `a` and `b`, both directions.
    pub fn partition(&self, a: NodeId, b: NodeId) {
        if let Ok(mut blocked) = self.blocked.write() {
            blocked.insert((a, b));
            blocked.insert((b, a));
        }
    }

    pub fn heal(&self, a: NodeId, b: NodeId) {
        if let Ok(mut blocked) = self.blocked.write() {
            blocked.remove(&(a, b));
            blocked.remove(&(b, a));
        }
    }

    /// Cut `node` off from every other attached node.
    pub fn isolate(&self, node: NodeId) {
        for other in self.node_ids() {
            if other != node {
                self.partition(node, other);
            }
        }
    }

    pub fn heal_all(&self) {
        if let Ok(mut blocked) = self.blocked.write() {
            blocked.clear();
        }
    }

    pub fn node_ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .inboxes
            .read()
            .map(|inboxes| inboxes.keys().copied().collect())
            .unwrap_or_default();
        ids.sort_unstable();
        ids
    }

    fn is_blocked(&self, from: NodeId, to: NodeId) -> bool {
        self.blocked
            .read()
            .map(|blocked| blocked.contains(&(from, to)))
            .unwrap_or(true)
    }

    fn deliver(&self, from: NodeId, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        if self.is_blocked(from, to) {
            log::trace!("sim network: dropping frame {from} -> {to}");
            return Ok(());
        }
        let inboxes = self
            .inboxes
            .read()
            .map_err(|_| TransportError::Disconnected)?;
        let inbox = inboxes.get(&to).ok_or(TransportError::Unreachable(to))?;
        inbox.send(frame).map_err(|_| TransportError::Unreachable(to))
    }
}

/// One node's view of a [`SimNetwork`].
pub struct SimEndpoint {
    id: NodeId,
    network: Arc<SimNetwork>,
    rx: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl RaftTransport for SimEndpoint {
    fn local_id(&self) -> NodeId {
        self.id
    }

    async fn send(&self, to: NodeId, frame: Vec<u8>) -> Result<(), TransportError> {
        self.network.deliver(self.id, to, frame)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut rx = self.rx.lock().await;
        rx.recv().await.ok_or(TransportError::Disconnected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_reach_their_target() {
        let network = SimNetwork::new();
        let a = network.endpoint(1);
        let b = network.endpoint(2);

        a.send(2, b"hello".to_vec()).await.unwrap();
        assert_eq!(b.recv().await.unwrap(), b"hello".to_vec());
        assert_eq!(a.local_id(), 1);
    }

    #[tokio::test]
    async fn partitions_drop_frames_until_healed() {
        let network = SimNetwork::new();
        let a = network.endpoint(1);
        let b = network.endpoint(2);

        network.isolate(1);
        a.send(2, b"lost".to_vec()).await.unwrap();
        network.heal_all();
        a.send(2, b"kept".to_vec()).await.unwrap();

        assert_eq!(b.recv().await.unwrap(), b"kept".to_vec());
    }

    #[tokio::test]
    async fn unknown_nodes_are_unreachable() {
        let network = SimNetwork::new();
        let a = network.endpoint(1);
        assert_eq!(
            a.send(9, vec![]).await,
            Err(TransportError::Unreachable(9))
        );
    }
}
