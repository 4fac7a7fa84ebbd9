// ============================
// meshroom-client/src/session.rs
// ============================
//! Negotiation state machine for one direct connection.
//!
//! ```text
//! Idle ─► Negotiating(Offerer|Answerer) ─► Connected ─► Degraded
//!                 ▲                            │            │
//!                 └──────── ICE restart ◄──────┴────────────┘
//! any ─► Failed (transport gave up, owner recreates)
//! any ─► Closed (terminal)
//! ```
//!
//! An answer is applied only while an own offer is outstanding. Remote
//! candidates need a remote description first and are dropped otherwise.
//! Source changes on a sender never renegotiate.
use crate::error::{ClientError, NegotiationError};
use crate::retry::RetryPolicy;
use crate::signaling::SignalSink;
use crate::transport::{
    IceCandidate, LocalTrack, PeerTransport, SdpType, SessionDescription, TrackKind,
    TransportState,
};
use meshroom_common::{ClientMessage, PeerId};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Offerer,
    Answerer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating(Role),
    Connected,
    Degraded,
    Failed,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Negotiating(Role::Offerer) => write!(f, "negotiating(offerer)"),
            SessionState::Negotiating(Role::Answerer) => write!(f, "negotiating(answerer)"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Degraded => write!(f, "degraded"),
            SessionState::Failed => write!(f, "failed"),
            SessionState::Closed => write!(f, "closed"),
        }
    }
}

/// Offer/answer position of the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
}

/// Follow-up the owner has to schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionAction {
    /// Check connectivity again after `delay`, restarting if still down
    ScheduleRecovery {
        episode: u32,
        attempt: u32,
        delay: Duration,
    },
    /// The transport is gone; replace the session
    Failed,
}

pub struct PeerConnectionSession<T: PeerTransport> {
    remote_peer_id: PeerId,
    generation: u64,
    transport: T,
    state: SessionState,
    phase: SignalingPhase,
    transport_state: TransportState,
    has_remote_description: bool,
    track_bindings: BTreeMap<TrackKind, Option<LocalTrack>>,
    retry: RetryPolicy,
    /// Bumped on every Connected -> Degraded transition
    recovery_episode: u32,
    restart_attempts: u32,
    recreations: u32,
    dropped_candidates: u64,
}

impl<T: PeerTransport> PeerConnectionSession<T> {
    pub fn new(
        remote_peer_id: PeerId,
        generation: u64,
        transport: T,
        retry: RetryPolicy,
        recreations: u32,
    ) -> Self {
        Self {
            remote_peer_id,
            generation,
            transport,
            state: SessionState::Idle,
            phase: SignalingPhase::Stable,
            transport_state: TransportState::New,
            has_remote_description: false,
            track_bindings: BTreeMap::new(),
            retry,
            recovery_episode: 0,
            restart_attempts: 0,
            recreations,
            dropped_candidates: 0,
        }
    }

    pub fn remote_peer_id(&self) -> &str {
        &self.remote_peer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn transport_state(&self) -> TransportState {
        self.transport_state
    }

    pub fn has_remote_description(&self) -> bool {
        self.has_remote_description
    }

    pub fn restart_attempts(&self) -> u32 {
        self.restart_attempts
    }

    /// Consecutive recreations that led to this session
    pub fn recreations(&self) -> u32 {
        self.recreations
    }

    /// Remote candidates discarded for arriving before a remote description
    pub fn dropped_candidates(&self) -> u64 {
        self.dropped_candidates
    }

    /// Source currently bound to the sender for `kind`
    pub fn bound_track(&self, kind: TrackKind) -> Option<&LocalTrack> {
        self.track_bindings.get(&kind).and_then(Option::as_ref)
    }

    /// Neither failed nor closed
    pub fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Failed | SessionState::Closed)
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            debug!(peer_id = %self.remote_peer_id, "session {} -> {}", self.state, next);
            self.state = next;
        }
    }

    /// Finish negotiation if the transport is already up
    fn settle(&mut self) {
        if self.phase == SignalingPhase::Stable
            && self.transport_state == TransportState::Connected
            && matches!(self.state, SessionState::Negotiating(_) | SessionState::Degraded)
        {
            self.transition(SessionState::Connected);
        }
    }

    /// Create the sender for `kind`. Only replaces the source if one exists.
    pub async fn add_sender(&mut self, kind: TrackKind, track: Option<LocalTrack>) -> Result<(), ClientError> {
        if self.track_bindings.contains_key(&kind) {
            self.replace_track(kind, track).await?;
            return Ok(());
        }
        self.transport.add_sender(kind, track.clone()).await?;
        self.track_bindings.insert(kind, track);
        Ok(())
    }

    /// Swap the source on the existing sender. Returns false if there is no
    /// sender for `kind` or the session is no longer live.
    pub async fn replace_track(&mut self, kind: TrackKind, track: Option<LocalTrack>) -> Result<bool, ClientError> {
        if !self.is_live() || !self.track_bindings.contains_key(&kind) {
            return Ok(false);
        }
        self.transport.replace_track(kind, track.clone()).await?;
        self.track_bindings.insert(kind, track);
        Ok(true)
    }

    /// Generate, commit and send an offer
    pub async fn start_offer<S: SignalSink>(&mut self, ice_restart: bool, sink: &S) -> Result<(), ClientError> {
        if !self.is_live() || self.phase == SignalingPhase::HaveRemoteOffer {
            return Err(NegotiationError::InvalidTransition {
                state: self.state,
                action: "offer",
            }
            .into());
        }

        let offer = self.transport.create_offer(ice_restart).await?;
        self.transport.set_local_description(offer.clone()).await?;
        self.phase = SignalingPhase::HaveLocalOffer;
        self.transition(SessionState::Negotiating(Role::Offerer));

        debug!(peer_id = %self.remote_peer_id, ice_restart, "sending offer");
        sink.send(ClientMessage::Offer {
            target_id: self.remote_peer_id.clone(),
            payload: serde_json::to_value(&offer)?,
        })
    }

    /// Commit a remote offer and answer it.
    ///
    /// With an own offer outstanding (glare) the lower peer id keeps its
    /// offer: returns `Ok(false)` and leaves everything untouched. The higher
    /// id rolls back and answers.
    pub async fn handle_remote_offer<S: SignalSink>(
        &mut self,
        payload: Value,
        local_peer_id: &str,
        sink: &S,
    ) -> Result<bool, ClientError> {
        let offer = parse_description(payload, SdpType::Offer)?;
        if !self.is_live() {
            return Err(NegotiationError::InvalidTransition {
                state: self.state,
                action: "answer",
            }
            .into());
        }

        if self.phase == SignalingPhase::HaveLocalOffer {
            if local_peer_id < self.remote_peer_id.as_str() {
                info!(peer_id = %self.remote_peer_id, "offer collision, keeping local offer");
                return Ok(false);
            }
            info!(peer_id = %self.remote_peer_id, "offer collision, yielding to remote offer");
            self.transport.rollback().await?;
            self.phase = SignalingPhase::Stable;
        }

        self.transport.set_remote_description(offer).await?;
        self.has_remote_description = true;
        self.phase = SignalingPhase::HaveRemoteOffer;
        self.transition(SessionState::Negotiating(Role::Answerer));

        let answer = self.transport.create_answer().await?;
        self.transport.set_local_description(answer.clone()).await?;
        self.phase = SignalingPhase::Stable;

        debug!(peer_id = %self.remote_peer_id, "sending answer");
        sink.send(ClientMessage::Answer {
            target_id: self.remote_peer_id.clone(),
            payload: serde_json::to_value(&answer)?,
        })?;
        self.settle();
        Ok(true)
    }

    /// Apply an answer to the outstanding local offer.
    /// Any other state rejects it and stays unchanged.
    pub async fn handle_remote_answer(&mut self, payload: Value) -> Result<(), ClientError> {
        let answer = parse_description(payload, SdpType::Answer)?;
        if self.state != SessionState::Negotiating(Role::Offerer)
            || self.phase != SignalingPhase::HaveLocalOffer
        {
            return Err(NegotiationError::OutOfWindow {
                kind: "answer",
                state: self.state,
            }
            .into());
        }

        self.transport.set_remote_description(answer).await?;
        self.has_remote_description = true;
        self.phase = SignalingPhase::Stable;
        self.settle();
        Ok(())
    }

    /// Apply a remote candidate. Returns false when it was dropped.
    pub async fn handle_remote_candidate(&mut self, payload: Value) -> Result<bool, ClientError> {
        let candidate: IceCandidate =
            serde_json::from_value(payload).map_err(|e| NegotiationError::MalformedPayload {
                kind: "ice-candidate",
                reason: e.to_string(),
            })?;

        if !self.is_live() {
            debug!(peer_id = %self.remote_peer_id, "candidate for dead session dropped");
            return Ok(false);
        }
        if !self.has_remote_description {
            self.dropped_candidates += 1;
            warn!(
                peer_id = %self.remote_peer_id,
                dropped = self.dropped_candidates,
                "candidate before remote description, dropped"
            );
            return Ok(false);
        }

        self.transport.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Send a locally gathered candidate right away, whatever the negotiation state
    pub fn forward_local_candidate<S: SignalSink>(&self, candidate: &IceCandidate, sink: &S) -> Result<bool, ClientError> {
        if self.state == SessionState::Closed {
            return Ok(false);
        }
        sink.send(ClientMessage::IceCandidate {
            target_id: self.remote_peer_id.clone(),
            payload: serde_json::to_value(candidate)?,
        })?;
        Ok(true)
    }

    /// React to a connectivity change reported by the transport
    pub async fn handle_transport_state(&mut self, new: TransportState) -> Option<SessionAction> {
        self.transport_state = new;
        if !self.is_live() {
            return None;
        }

        match new {
            TransportState::Connected => {
                self.restart_attempts = 0;
                self.recreations = 0;
                self.settle();
                if self.state == SessionState::Connected {
                    info!(peer_id = %self.remote_peer_id, "peer connected");
                }
                None
            },
            TransportState::Disconnected => {
                if self.state != SessionState::Connected {
                    return None;
                }
                self.transition(SessionState::Degraded);
                self.recovery_episode += 1;
                match self.retry.delay_for(1) {
                    Some(delay) => {
                        info!(peer_id = %self.remote_peer_id, ?delay, "connection degraded, recovery scheduled");
                        Some(SessionAction::ScheduleRecovery {
                            episode: self.recovery_episode,
                            attempt: 1,
                            delay,
                        })
                    },
                    None => {
                        self.fail().await;
                        Some(SessionAction::Failed)
                    },
                }
            },
            TransportState::Failed => {
                warn!(peer_id = %self.remote_peer_id, "connection failed");
                self.fail().await;
                Some(SessionAction::Failed)
            },
            TransportState::New | TransportState::Connecting | TransportState::Closed => None,
        }
    }

    /// Recovery timer fired. Restarts negotiation if still down, and arms the
    /// next check; once attempts are exhausted the session fails.
    pub async fn on_recovery_timer<S: SignalSink>(
        &mut self,
        episode: u32,
        attempt: u32,
        sink: &S,
    ) -> Result<Option<SessionAction>, ClientError> {
        if episode != self.recovery_episode
            || !matches!(self.state, SessionState::Degraded | SessionState::Negotiating(_))
            || self.transport_state == TransportState::Connected
        {
            return Ok(None);
        }

        if attempt > self.retry.max_attempts {
            warn!(peer_id = %self.remote_peer_id, attempts = self.restart_attempts, "recovery exhausted");
            self.fail().await;
            return Ok(Some(SessionAction::Failed));
        }

        self.restart_attempts = attempt;
        info!(peer_id = %self.remote_peer_id, attempt, "restarting ICE");
        match self.start_offer(true, sink).await {
            Ok(()) => {},
            Err(ClientError::Negotiation(e)) => {
                warn!(peer_id = %self.remote_peer_id, "ICE restart failed: {e}");
            },
            Err(e) => return Err(e),
        }

        Ok(Some(SessionAction::ScheduleRecovery {
            episode,
            attempt: attempt + 1,
            delay: self.retry.backoff(attempt + 1),
        }))
    }

    async fn fail(&mut self) {
        self.transport.close().await;
        self.transition(SessionState::Failed);
    }

    /// Tear down for good. Idempotent.
    pub async fn close(&mut self) {
        match self.state {
            SessionState::Closed => {},
            // transport already closed on failure
            SessionState::Failed => self.transition(SessionState::Closed),
            _ => {
                self.transport.close().await;
                self.transition(SessionState::Closed);
            },
        }
    }
}

fn parse_description(payload: Value, expected: SdpType) -> Result<SessionDescription, NegotiationError> {
    let kind = match expected {
        SdpType::Offer => "offer",
        SdpType::Answer => "answer",
    };
    let desc: SessionDescription =
        serde_json::from_value(payload).map_err(|e| NegotiationError::MalformedPayload {
            kind,
            reason: e.to_string(),
        })?;
    if desc.sdp_type != expected {
        return Err(NegotiationError::MalformedPayload {
            kind,
            reason: format!("description type is {:?}", desc.sdp_type),
        });
    }
    Ok(desc)
}
