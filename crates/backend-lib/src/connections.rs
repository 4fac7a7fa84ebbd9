// ============================
// meshroom-backend/src/connections.rs
// ============================
//! Outbound channels of every live connection, keyed by peer id.
use dashmap::DashMap;
use meshroom_common::{PeerId, ServerMessage};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Sender half feeding one connection's socket writer
pub type ClientTx = mpsc::UnboundedSender<ServerMessage>;

/// Shared directory of connected peers
#[derive(Clone, Default)]
pub struct ConnectionMap {
    peers: Arc<DashMap<PeerId, ClientTx>>,
}

impl ConnectionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under its peer id
    pub fn register(&self, peer_id: PeerId, tx: ClientTx) {
        self.peers.insert(peer_id, tx);
    }

    pub fn unregister(&self, peer_id: &str) {
        self.peers.remove(peer_id);
    }

    pub fn is_connected(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Queue a message for one peer. Returns `false` when the peer is gone.
    pub fn send_to(&self, peer_id: &str, msg: ServerMessage) -> bool {
        // Clone the sender so no map guard is held while sending
        let tx = self.peers.get(peer_id).map(|entry| entry.value().clone());
        match tx {
            Some(tx) => tx.send(msg).is_ok(),
            None => false,
        }
    }

    /// Queue a message for each listed peer; returns how many were reached
    pub fn send_to_many<'a, I>(&self, peer_ids: I, msg: &ServerMessage) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        peer_ids
            .into_iter()
            .filter(|peer_id| self.send_to(peer_id, msg.clone()))
            .count()
    }
}
