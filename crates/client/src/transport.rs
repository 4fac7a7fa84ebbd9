// ============================
// meshroom-client/src/transport.rs
// ============================
//! Seam between the negotiation state machine and the platform's
//! peer-connection primitives (description and candidate generation,
//! codec negotiation, media senders).
use crate::error::NegotiationError;
use async_trait::async_trait;
use meshroom_common::PeerId;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Session description as exchanged through the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

/// A network endpoint proposed for connectivity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrackKind {
    Audio,
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

/// A locally captured track, identified by the platform's track id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    pub source: TrackSource,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: TrackKind, source: TrackSource) -> Self {
        Self { id: id.into(), kind, source }
    }
}

/// Aggregate connectivity as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A candidate was gathered locally and must reach the remote peer
    LocalCandidate(IceCandidate),
    StateChanged(TransportState),
    /// Remote media arrived
    RemoteTrack(TrackKind),
}

/// A transport event tagged with the session it belongs to
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedTransportEvent {
    pub peer_id: PeerId,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Handed to each transport so platform callbacks can report back.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    peer_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<TaggedTransportEvent>,
}

impl TransportEvents {
    pub fn new(
        peer_id: PeerId,
        generation: u64,
        tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    ) -> Self {
        Self { peer_id, generation, tx }
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the mesh is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send(TaggedTransportEvent {
                peer_id: self.peer_id.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}

/// One direct connection to one remote peer
#[async_trait]
pub trait PeerTransport: Send {
    async fn create_offer(&mut self, ice_restart: bool) -> Result<SessionDescription, NegotiationError>;

    async fn create_answer(&mut self) -> Result<SessionDescription, NegotiationError>;

    async fn set_local_description(&mut self, desc: SessionDescription) -> Result<(), NegotiationError>;

    async fn set_remote_description(&mut self, desc: SessionDescription) -> Result<(), NegotiationError>;

    /// Abandon an outstanding local offer
    async fn rollback(&mut self) -> Result<(), NegotiationError>;

    async fn add_ice_candidate(&mut self, candidate: IceCandidate) -> Result<(), NegotiationError>;

    /// Create the sender for `kind`, optionally with a source attached
    async fn add_sender(&mut self, kind: TrackKind, track: Option<LocalTrack>) -> Result<(), NegotiationError>;

    /// Swap the source of the existing sender for `kind`, no renegotiation
    async fn replace_track(&mut self, kind: TrackKind, track: Option<LocalTrack>) -> Result<(), NegotiationError>;

    async fn close(&mut self);
}

/// Builds transports for new sessions
pub trait TransportFactory: Send {
    type Transport: PeerTransport;

    fn create(&mut self, events: TransportEvents) -> Result<Self::Transport, NegotiationError>;
}
