// ============================
// meshroom-backend/src/relay.rs
// ============================
//! 1:1 forwarding of negotiation payloads between peers.
//!
//! Payloads are never inspected. The target is not checked against the
//! sender's room; delivery is at-most-once and a vanished target is dropped
//! without telling the sender.
use crate::connections::ConnectionMap;
use crate::metrics::{SIGNAL_DROPPED, SIGNAL_RELAYED};
use meshroom_common::ServerMessage;
use metrics::counter;
use serde_json::Value;
use std::fmt;
use tracing::debug;

/// The three relayed payload kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalKind::Offer => write!(f, "offer"),
            SignalKind::Answer => write!(f, "answer"),
            SignalKind::IceCandidate => write!(f, "ice-candidate"),
        }
    }
}

#[derive(Clone)]
pub struct SignalRelay {
    connections: ConnectionMap,
}

impl SignalRelay {
    pub fn new(connections: ConnectionMap) -> Self {
        Self { connections }
    }

    /// Wrap `payload` as `{from, payload}` and queue it for `target`.
    /// Returns whether the target was still connected.
    pub fn forward(&self, kind: SignalKind, from: &str, target: &str, payload: Value) -> bool {
        let from = from.to_string();
        let msg = match kind {
            SignalKind::Offer => ServerMessage::Offer { from, payload },
            SignalKind::Answer => ServerMessage::Answer { from, payload },
            SignalKind::IceCandidate => ServerMessage::IceCandidate { from, payload },
        };

        let delivered = self.connections.send_to(target, msg);
        if delivered {
            counter!(SIGNAL_RELAYED, "kind" => kind.to_string()).increment(1);
            debug!(%kind, %target, "relayed signal");
        } else {
            counter!(SIGNAL_DROPPED, "kind" => kind.to_string()).increment(1);
            debug!(%kind, %target, "target gone, signal dropped");
        }
        delivered
    }
}
