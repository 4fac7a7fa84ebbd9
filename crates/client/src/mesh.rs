// ============================
// meshroom-client/src/mesh.rs
// ============================
//! Full-mesh orchestration: one `PeerConnectionSession` per remote participant.
//!
//! The mesh reacts to three inputs, all delivered by the owner's event loop:
//! server messages, transport events and its own timers. Timers and transport
//! events carry the session generation they were created for; anything
//! addressed to an older generation is ignored.
use crate::error::ClientError;
use crate::media::{acquire_screen, LocalMedia, MediaDevices};
use crate::retry::RetryPolicy;
use crate::session::{PeerConnectionSession, SessionAction, SessionState};
use crate::signaling::SignalSink;
use crate::transport::{
    LocalTrack, TaggedTransportEvent, TrackKind, TransportEvent, TransportEvents, TransportFactory,
};
use meshroom_common::{ClientMessage, PeerId, PeerRecord, RoomId, ServerMessage};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TRACK_KINDS: [TrackKind; 2] = [TrackKind::Audio, TrackKind::Video];

/// Which side of a pair sends the first offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OfferPolicy {
    /// The lexicographically lower peer id offers
    #[default]
    LowerIdOffers,
    /// Members already in the room offer to newcomers
    ExistingMemberOffers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshConfig {
    /// Wait before offering to a newly joined peer
    pub new_peer_delay: Duration,
    /// Wait before rebuilding a failed session
    pub recreate_delay: Duration,
    pub retry: RetryPolicy,
    /// Consecutive rebuilds before a peer is given up
    pub max_recreations: u32,
    pub offer_policy: OfferPolicy,
    /// Bound for each capture request
    pub media_timeout: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            new_peer_delay: Duration::from_secs(1),
            recreate_delay: Duration::from_secs(2),
            retry: RetryPolicy::default(),
            max_recreations: 3,
            offer_policy: OfferPolicy::default(),
            media_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    ConnectNewPeer,
    Recovery { episode: u32, attempt: u32 },
    Recreate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerEvent {
    pub peer_id: PeerId,
    pub generation: u64,
    pub kind: TimerKind,
}

/// Receivers the owner's event loop must drain into the mesh
pub struct MeshEvents {
    pub transport: mpsc::UnboundedReceiver<TaggedTransportEvent>,
    pub timers: mpsc::UnboundedReceiver<TimerEvent>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct LocalPeer {
    peer_id: PeerId,
    room_id: RoomId,
    is_admin: bool,
}

pub struct MeshTopology<F: TransportFactory, S: SignalSink> {
    config: MeshConfig,
    factory: F,
    sink: S,
    media: LocalMedia,
    local: Option<LocalPeer>,
    roster: Vec<PeerRecord>,
    sessions: HashMap<PeerId, PeerConnectionSession<F::Transport>>,
    next_generation: u64,
    transport_tx: mpsc::UnboundedSender<TaggedTransportEvent>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
}

/// Negotiation errors are logged and swallowed, everything else propagates
fn absorb<T>(peer_id: &str, result: Result<T, ClientError>) -> Result<Option<T>, ClientError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(ClientError::Negotiation(e)) => {
            warn!(%peer_id, "negotiation: {e}");
            Ok(None)
        },
        Err(e) => Err(e),
    }
}

impl<F: TransportFactory, S: SignalSink> MeshTopology<F, S> {
    pub fn new(config: MeshConfig, factory: F, sink: S, media: LocalMedia) -> (Self, MeshEvents) {
        let (transport_tx, transport) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        let mesh = Self {
            config,
            factory,
            sink,
            media,
            local: None,
            roster: Vec::new(),
            sessions: HashMap::new(),
            next_generation: 1,
            transport_tx,
            timer_tx,
        };
        (mesh, MeshEvents { transport, timers })
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    pub fn local_peer_id(&self) -> Option<&str> {
        self.local.as_ref().map(|l| l.peer_id.as_str())
    }

    pub fn room_id(&self) -> Option<&str> {
        self.local.as_ref().map(|l| l.room_id.as_str())
    }

    pub fn is_admin(&self) -> bool {
        self.local.as_ref().is_some_and(|l| l.is_admin)
    }

    /// Everyone in the room, self included, in join order
    pub fn roster(&self) -> &[PeerRecord] {
        &self.roster
    }

    pub fn media(&self) -> &LocalMedia {
        &self.media
    }

    pub fn session(&self, peer_id: &str) -> Option<&PeerConnectionSession<F::Transport>> {
        self.sessions.get(peer_id)
    }

    pub fn session_state(&self, peer_id: &str) -> Option<SessionState> {
        self.sessions.get(peer_id).map(PeerConnectionSession::state)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Whether the local side sends the first offer to `remote`
    fn local_offers_to(&self, remote: &str, remote_is_newcomer: bool) -> bool {
        let Some(local) = &self.local else {
            return false;
        };
        match self.config.offer_policy {
            OfferPolicy::LowerIdOffers => local.peer_id.as_str() < remote,
            OfferPolicy::ExistingMemberOffers => remote_is_newcomer,
        }
    }

    fn schedule(&self, delay: Duration, event: TimerEvent) {
        let tx = self.timer_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(event);
        });
    }

    /// Build a session for `peer_id` with senders for the current local
    /// media, replacing (and closing) any previous one.
    async fn open_session(&mut self, peer_id: &str, recreations: u32) -> Result<u64, ClientError> {
        let generation = self.next_generation;
        self.next_generation += 1;

        let events = TransportEvents::new(peer_id.to_string(), generation, self.transport_tx.clone());
        let transport = self.factory.create(events)?;
        let mut session = PeerConnectionSession::new(
            peer_id.to_string(),
            generation,
            transport,
            self.config.retry,
            recreations,
        );
        for kind in TRACK_KINDS {
            session.add_sender(kind, self.media.outgoing_track(kind)).await?;
        }

        if let Some(mut old) = self.sessions.insert(peer_id.to_string(), session) {
            old.close().await;
        }
        debug!(%peer_id, generation, "session opened");
        Ok(generation)
    }

    async fn offer_to(&mut self, peer_id: &str) -> Result<(), ClientError> {
        if let Some(session) = self.sessions.get_mut(peer_id) {
            absorb(peer_id, session.start_offer(false, &self.sink).await)?;
        }
        Ok(())
    }

    async fn evict(&mut self, peer_id: &str) {
        if let Some(mut session) = self.sessions.remove(peer_id) {
            session.close().await;
            debug!(%peer_id, "session evicted");
        }
    }

    async fn close_all(&mut self) {
        for (_, mut session) in self.sessions.drain() {
            session.close().await;
        }
    }

    pub async fn handle_server_message(&mut self, msg: ServerMessage) -> Result<(), ClientError> {
        match msg {
            ServerMessage::RoomJoined { room_id, peer_id, is_admin, participants, .. } => {
                self.on_room_joined(room_id, peer_id, is_admin, participants).await
            },
            ServerMessage::JoinRejected { reason } => {
                warn!(?reason, "join rejected");
                Ok(())
            },
            ServerMessage::UserConnected(record) => self.on_user_connected(record).await,
            ServerMessage::UserDisconnected { peer_id } => {
                info!(%peer_id, "peer left");
                self.roster.retain(|p| p.id != peer_id);
                self.evict(&peer_id).await;
                Ok(())
            },
            ServerMessage::AdminChanged { new_admin_id } => {
                for peer in &mut self.roster {
                    peer.is_admin = peer.id == new_admin_id;
                }
                if let Some(local) = &mut self.local {
                    local.is_admin = local.peer_id == new_admin_id;
                }
                info!(%new_admin_id, "admin changed");
                Ok(())
            },
            ServerMessage::UserMediaStatus { peer_id, audio_enabled, video_enabled } => {
                if let Some(peer) = self.roster.iter_mut().find(|p| p.id == peer_id) {
                    peer.audio_enabled = audio_enabled;
                    peer.video_enabled = video_enabled;
                }
                Ok(())
            },
            ServerMessage::UserScreenShare { peer_id, is_sharing } => {
                if let Some(peer) = self.roster.iter_mut().find(|p| p.id == peer_id) {
                    peer.screen_sharing = is_sharing;
                }
                Ok(())
            },
            ServerMessage::NewMessage(message) => {
                debug!(sender_id = %message.sender_id, "chat message");
                Ok(())
            },
            ServerMessage::Offer { from, payload } => self.on_remote_offer(from, payload).await,
            ServerMessage::Answer { from, payload } => {
                let Some(session) = self.sessions.get_mut(&from) else {
                    debug!(%from, "answer for unknown peer dropped");
                    return Ok(());
                };
                absorb(&from, session.handle_remote_answer(payload).await)?;
                Ok(())
            },
            ServerMessage::IceCandidate { from, payload } => {
                let Some(session) = self.sessions.get_mut(&from) else {
                    debug!(%from, "candidate for unknown peer dropped");
                    return Ok(());
                };
                absorb(&from, session.handle_remote_candidate(payload).await)?;
                Ok(())
            },
            ServerMessage::MalformedMessage { err_msg } => {
                warn!("server could not parse our message: {err_msg}");
                Ok(())
            },
            ServerMessage::Error { code, message } => {
                warn!(%code, "server error: {message}");
                Ok(())
            },
        }
    }

    async fn on_room_joined(
        &mut self,
        room_id: RoomId,
        peer_id: PeerId,
        is_admin: bool,
        participants: Vec<PeerRecord>,
    ) -> Result<(), ClientError> {
        if self.local.is_some() {
            self.close_all().await;
        }
        info!(%room_id, %peer_id, is_admin, members = participants.len(), "joined room");
        self.local = Some(LocalPeer { peer_id: peer_id.clone(), room_id, is_admin });
        self.roster = participants;
        self.announce_media()?;

        let remotes: Vec<PeerId> = self
            .roster
            .iter()
            .filter(|p| p.id != peer_id)
            .map(|p| p.id.clone())
            .collect();
        for remote in remotes {
            if absorb(&remote, self.open_session(&remote, 0).await)?.is_none() {
                continue;
            }
            if self.local_offers_to(&remote, false) {
                self.offer_to(&remote).await?;
            }
        }
        Ok(())
    }

    async fn on_user_connected(&mut self, record: PeerRecord) -> Result<(), ClientError> {
        if self.local_peer_id().map_or(true, |local| local == record.id) {
            return Ok(());
        }
        info!(peer_id = %record.id, display_name = %record.display_name, "peer joined");
        let peer_id = record.id.clone();
        match self.roster.iter_mut().find(|p| p.id == peer_id) {
            Some(existing) => *existing = record,
            None => self.roster.push(record),
        }

        if self.sessions.get(&peer_id).is_some_and(PeerConnectionSession::is_live) {
            return Ok(());
        }
        let Some(generation) = absorb(&peer_id, self.open_session(&peer_id, 0).await)? else {
            return Ok(());
        };
        if self.local_offers_to(&peer_id, true) {
            self.schedule(
                self.config.new_peer_delay,
                TimerEvent { peer_id, generation, kind: TimerKind::ConnectNewPeer },
            );
        }
        Ok(())
    }

    async fn on_remote_offer(&mut self, from: PeerId, payload: Value) -> Result<(), ClientError> {
        let Some(local_id) = self.local_peer_id().map(str::to_string) else {
            debug!(%from, "offer outside a room dropped");
            return Ok(());
        };

        let existing = self.sessions.get(&from);
        if existing.map_or(true, |s| !s.is_live()) {
            let recreations = existing.map_or(0, PeerConnectionSession::recreations);
            if absorb(&from, self.open_session(&from, recreations).await)?.is_none() {
                return Ok(());
            }
        }

        if let Some(session) = self.sessions.get_mut(&from) {
            absorb(&from, session.handle_remote_offer(payload, &local_id, &self.sink).await)?;
        }
        Ok(())
    }

    pub async fn handle_transport_event(&mut self, event: TaggedTransportEvent) -> Result<(), ClientError> {
        let TaggedTransportEvent { peer_id, generation, event } = event;
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            debug!(%peer_id, "transport event for unknown peer");
            return Ok(());
        };
        if session.generation() != generation {
            debug!(%peer_id, generation, "stale transport event ignored");
            return Ok(());
        }

        let action = match event {
            TransportEvent::LocalCandidate(candidate) => {
                absorb(&peer_id, session.forward_local_candidate(&candidate, &self.sink))?;
                None
            },
            TransportEvent::StateChanged(state) => session.handle_transport_state(state).await,
            TransportEvent::RemoteTrack(kind) => {
                info!(%peer_id, %kind, "remote track");
                None
            },
        };

        if let Some(action) = action {
            self.apply(&peer_id, generation, action).await;
        }
        Ok(())
    }

    async fn apply(&mut self, peer_id: &str, generation: u64, action: SessionAction) {
        match action {
            SessionAction::ScheduleRecovery { episode, attempt, delay } => {
                self.schedule(
                    delay,
                    TimerEvent {
                        peer_id: peer_id.to_string(),
                        generation,
                        kind: TimerKind::Recovery { episode, attempt },
                    },
                );
            },
            SessionAction::Failed => {
                let recreations = self
                    .sessions
                    .get(peer_id)
                    .map_or(0, PeerConnectionSession::recreations);
                if recreations >= self.config.max_recreations {
                    warn!(%peer_id, recreations, "giving up on peer");
                    self.evict(peer_id).await;
                } else {
                    self.schedule(
                        self.config.recreate_delay,
                        TimerEvent {
                            peer_id: peer_id.to_string(),
                            generation,
                            kind: TimerKind::Recreate,
                        },
                    );
                }
            },
        }
    }

    pub async fn handle_timer(&mut self, timer: TimerEvent) -> Result<(), ClientError> {
        let TimerEvent { peer_id, generation, kind } = timer;
        let Some(session) = self.sessions.get_mut(&peer_id) else {
            debug!(%peer_id, ?kind, "timer for departed peer ignored");
            return Ok(());
        };
        if session.generation() != generation {
            debug!(%peer_id, ?kind, "stale timer ignored");
            return Ok(());
        }

        match kind {
            TimerKind::ConnectNewPeer => {
                if session.state() == SessionState::Idle {
                    absorb(&peer_id, session.start_offer(false, &self.sink).await)?;
                }
            },
            TimerKind::Recovery { episode, attempt } => {
                let action = absorb(
                    &peer_id,
                    session.on_recovery_timer(episode, attempt, &self.sink).await,
                )?
                .flatten();
                if let Some(action) = action {
                    self.apply(&peer_id, generation, action).await;
                }
            },
            TimerKind::Recreate => {
                if session.state() == SessionState::Failed {
                    let recreations = session.recreations() + 1;
                    info!(%peer_id, recreations, "recreating session");
                    if absorb(&peer_id, self.open_session(&peer_id, recreations).await)?.is_some() {
                        self.offer_to(&peer_id).await?;
                    }
                }
            },
        }
        Ok(())
    }

    fn announce_media(&mut self) -> Result<(), ClientError> {
        let Some(local) = &self.local else {
            return Ok(());
        };
        let (audio_enabled, video_enabled) = (self.media.audio_enabled(), self.media.video_enabled());
        if let Some(me) = self.roster.iter_mut().find(|p| p.id == local.peer_id) {
            me.audio_enabled = audio_enabled;
            me.video_enabled = video_enabled;
        }
        self.sink.send(ClientMessage::MediaStatus { audio_enabled, video_enabled })
    }

    /// Put the current source for `kind` on every live session's sender
    async fn push_track(&mut self, kind: TrackKind) -> Result<(), ClientError> {
        let track = self.media.outgoing_track(kind);
        for (peer_id, session) in &mut self.sessions {
            absorb(peer_id, session.replace_track(kind, track.clone()).await)?;
        }
        Ok(())
    }

    /// Mute or unmute. Returns false if there is no microphone.
    pub async fn set_audio_enabled(&mut self, enabled: bool) -> Result<bool, ClientError> {
        if !self.media.set_audio_enabled(enabled) {
            return Ok(false);
        }
        self.push_track(TrackKind::Audio).await?;
        self.announce_media()?;
        Ok(true)
    }

    /// Camera on/off. Returns false if there is no camera.
    pub async fn set_video_enabled(&mut self, enabled: bool) -> Result<bool, ClientError> {
        if !self.media.set_video_enabled(enabled) {
            return Ok(false);
        }
        self.push_track(TrackKind::Video).await?;
        self.announce_media()?;
        Ok(true)
    }

    pub async fn start_screen_share(&mut self, track: LocalTrack) -> Result<(), ClientError> {
        self.media.start_screen(track);
        self.push_track(TrackKind::Video).await?;
        self.set_own_screen_flag(true);
        if self.local.is_some() {
            self.sink.send(ClientMessage::ScreenSharingStart)?;
        }
        Ok(())
    }

    /// Let the user pick a screen through `devices` and share it. A refused
    /// or timed-out picker leaves the current video source in place.
    pub async fn share_screen<D: MediaDevices>(&mut self, devices: &mut D) -> Result<(), ClientError> {
        let track = acquire_screen(devices, self.config.media_timeout).await?;
        self.start_screen_share(track).await
    }

    /// Returns false if nothing was being shared
    pub async fn stop_screen_share(&mut self) -> Result<bool, ClientError> {
        if self.media.stop_screen().is_none() {
            return Ok(false);
        }
        self.push_track(TrackKind::Video).await?;
        self.set_own_screen_flag(false);
        if self.local.is_some() {
            self.sink.send(ClientMessage::ScreenSharingStop)?;
        }
        Ok(true)
    }

    fn set_own_screen_flag(&mut self, sharing: bool) {
        if let Some(local) = &self.local {
            if let Some(me) = self.roster.iter_mut().find(|p| p.id == local.peer_id) {
                me.screen_sharing = sharing;
            }
        }
    }

    /// Swap in freshly acquired media
    pub async fn set_local_media(&mut self, media: LocalMedia) -> Result<(), ClientError> {
        self.media = media;
        for kind in TRACK_KINDS {
            self.push_track(kind).await?;
        }
        self.announce_media()
    }

    /// Tear down every session, stop local media and tell the server
    pub async fn leave(&mut self) -> Result<(), ClientError> {
        if let Some(room_id) = self.shutdown().await {
            info!(%room_id, "left room");
            self.sink.send(ClientMessage::LeaveRoom)?;
        }
        Ok(())
    }

    /// Local teardown only, for when the server is already gone.
    /// Returns the room that was left.
    pub async fn shutdown(&mut self) -> Option<RoomId> {
        self.close_all().await;
        self.roster.clear();
        self.media.stop();
        self.local.take().map(|local| local.room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::{Call, FakeFactory};
    use crate::transport::{SdpType, TrackSource, TransportState};
    use serde_json::json;

    type Sink = mpsc::UnboundedSender<ClientMessage>;
    type Mesh = MeshTopology<FakeFactory, Sink>;

    struct Harness {
        mesh: Mesh,
        events: MeshEvents,
        factory: FakeFactory,
        outbox: mpsc::UnboundedReceiver<ClientMessage>,
    }

    fn mic() -> LocalTrack {
        LocalTrack::new("mic", TrackKind::Audio, TrackSource::Microphone)
    }

    fn cam() -> LocalTrack {
        LocalTrack::new("cam", TrackKind::Video, TrackSource::Camera)
    }

    fn harness(policy: OfferPolicy) -> Harness {
        let factory = FakeFactory::default();
        let (sink, outbox) = mpsc::unbounded_channel();
        let config = MeshConfig { offer_policy: policy, ..MeshConfig::default() };
        let (mesh, events) = MeshTopology::new(
            config,
            factory.clone(),
            sink,
            LocalMedia::from_tracks(vec![mic(), cam()]),
        );
        Harness { mesh, events, factory, outbox }
    }

    fn joined(local: &str, members: &[&str]) -> ServerMessage {
        ServerMessage::RoomJoined {
            room_id: "abc12".to_string(),
            peer_id: local.to_string(),
            is_admin: members.first() == Some(&local),
            participants: members
                .iter()
                .map(|id| PeerRecord::new(*id, id.to_uppercase()))
                .collect(),
            messages: vec![],
        }
    }

    fn drain(outbox: &mut mpsc::UnboundedReceiver<ClientMessage>) -> Vec<ClientMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = outbox.try_recv() {
            out.push(msg);
        }
        out
    }

    fn offer_targets(msgs: &[ClientMessage]) -> Vec<String> {
        msgs.iter()
            .filter_map(|m| match m {
                ClientMessage::Offer { target_id, .. } => Some(target_id.clone()),
                _ => None,
            })
            .collect()
    }

    fn generation(mesh: &Mesh, peer: &str) -> u64 {
        mesh.session(peer).unwrap().generation()
    }

    async fn transport_state(mesh: &mut Mesh, peer: &str, state: TransportState) {
        let generation = generation(mesh, peer);
        mesh.handle_transport_event(TaggedTransportEvent {
            peer_id: peer.to_string(),
            generation,
            event: TransportEvent::StateChanged(state),
        })
        .await
        .unwrap();
    }

    async fn next_timer(events: &mut MeshEvents) -> TimerEvent {
        events.timers.recv().await.unwrap()
    }

    fn assert_elapsed(start: tokio::time::Instant, expected: Duration) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= expected && elapsed < expected + Duration::from_millis(50),
            "elapsed {elapsed:?}, expected {expected:?}"
        );
    }

    #[tokio::test]
    async fn test_join_offers_to_higher_ids_only() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b", "c"])).await.unwrap();

        let sent = drain(&mut h.outbox);
        assert_eq!(
            sent[0],
            ClientMessage::MediaStatus { audio_enabled: true, video_enabled: true }
        );
        assert_eq!(offer_targets(&sent), vec!["c".to_string()]);
        assert_eq!(h.mesh.session_state("a"), Some(SessionState::Idle));
        assert_eq!(
            h.mesh.session_state("c"),
            Some(SessionState::Negotiating(crate::session::Role::Offerer))
        );
        assert_eq!(h.mesh.session_count(), 2);
        assert!(!h.mesh.is_admin());

        // Senders carry the current local sources
        let log = h.factory.log_for("c");
        assert!(log.contains(&Call::AddSender(TrackKind::Audio, Some("mic".to_string()))));
        assert!(log.contains(&Call::AddSender(TrackKind::Video, Some("cam".to_string()))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_peer_offered_after_delay() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("a", &["a"])).await.unwrap();
        drain(&mut h.outbox);

        h.mesh
            .handle_server_message(ServerMessage::UserConnected(PeerRecord::new("b", "B")))
            .await
            .unwrap();
        assert_eq!(h.mesh.session_state("b"), Some(SessionState::Idle));
        assert!(drain(&mut h.outbox).is_empty());
        assert_eq!(h.mesh.roster().len(), 2);

        let start = tokio::time::Instant::now();
        let timer = next_timer(&mut h.events).await;
        assert_elapsed(start, Duration::from_secs(1));
        assert_eq!(timer.kind, TimerKind::ConnectNewPeer);

        h.mesh.handle_timer(timer).await.unwrap();
        assert_eq!(offer_targets(&drain(&mut h.outbox)), vec!["b".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lower_newcomer_is_not_offered_to() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("m", &["m"])).await.unwrap();
        h.mesh
            .handle_server_message(ServerMessage::UserConnected(PeerRecord::new("a", "A")))
            .await
            .unwrap();

        assert!(tokio::time::timeout(Duration::from_secs(5), h.events.timers.recv())
            .await
            .is_err());
        assert_eq!(h.mesh.session_state("a"), Some(SessionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_existing_member_policy_offers_to_newcomer() {
        let mut h = harness(OfferPolicy::ExistingMemberOffers);
        h.mesh.handle_server_message(joined("z", &["z"])).await.unwrap();
        h.mesh
            .handle_server_message(ServerMessage::UserConnected(PeerRecord::new("a", "A")))
            .await
            .unwrap();
        drain(&mut h.outbox);

        let timer = next_timer(&mut h.events).await;
        h.mesh.handle_timer(timer).await.unwrap();
        assert_eq!(offer_targets(&drain(&mut h.outbox)), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_member_policy_joiner_waits() {
        let mut h = harness(OfferPolicy::ExistingMemberOffers);
        h.mesh.handle_server_message(joined("a", &["y", "z", "a"])).await.unwrap();
        assert!(offer_targets(&drain(&mut h.outbox)).is_empty());
        assert_eq!(h.mesh.session_count(), 2);
    }

    /// Relay everything one mesh sent to the other, as the server would
    async fn relay(from: &str, outbox: &mut mpsc::UnboundedReceiver<ClientMessage>, to: &mut Mesh) -> usize {
        let mut offers = 0;
        for msg in drain(outbox) {
            let inbound = match msg {
                ClientMessage::Offer { payload, .. } => {
                    offers += 1;
                    ServerMessage::Offer { from: from.to_string(), payload }
                },
                ClientMessage::Answer { payload, .. } => {
                    ServerMessage::Answer { from: from.to_string(), payload }
                },
                ClientMessage::IceCandidate { payload, .. } => {
                    ServerMessage::IceCandidate { from: from.to_string(), payload }
                },
                _ => continue,
            };
            to.handle_server_message(inbound).await.unwrap();
        }
        offers
    }

    #[tokio::test(start_paused = true)]
    async fn test_pair_negotiates_with_single_offerer() {
        for policy in [OfferPolicy::LowerIdOffers, OfferPolicy::ExistingMemberOffers] {
            let mut a = harness(policy);
            let mut b = harness(policy);
            a.mesh.handle_server_message(joined("a", &["a"])).await.unwrap();

            // b joins; a hears about it
            b.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();
            a.mesh
                .handle_server_message(ServerMessage::UserConnected(PeerRecord::new("b", "B")))
                .await
                .unwrap();

            let timer = next_timer(&mut a.events).await;
            a.mesh.handle_timer(timer).await.unwrap();

            let offers_from_b = relay("b", &mut b.outbox, &mut a.mesh).await;
            let offers_from_a = relay("a", &mut a.outbox, &mut b.mesh).await;
            relay("b", &mut b.outbox, &mut a.mesh).await;

            assert_eq!(offers_from_a + offers_from_b, 1, "{policy:?}");
            assert_eq!(a.mesh.session("b").unwrap().phase(), crate::session::SignalingPhase::Stable);
            assert!(b.mesh.session("a").unwrap().has_remote_description());

            transport_state(&mut a.mesh, "b", TransportState::Connected).await;
            transport_state(&mut b.mesh, "a", TransportState::Connected).await;
            assert_eq!(a.mesh.session_state("b"), Some(SessionState::Connected));
            assert_eq!(b.mesh.session_state("a"), Some(SessionState::Connected));
        }
    }

    #[tokio::test]
    async fn test_offer_from_unknown_peer_is_answered() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("a", &["a"])).await.unwrap();
        drain(&mut h.outbox);

        h.mesh
            .handle_server_message(ServerMessage::Offer {
                from: "q".to_string(),
                payload: json!({ "type": "offer", "sdp": "v=0" }),
            })
            .await
            .unwrap();

        let sent = drain(&mut h.outbox);
        assert!(matches!(&sent[..], [ClientMessage::Answer { target_id, .. }] if target_id == "q"));
    }

    #[tokio::test]
    async fn test_signals_before_join_are_dropped() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh
            .handle_server_message(ServerMessage::Offer {
                from: "q".to_string(),
                payload: json!({ "type": "offer", "sdp": "v=0" }),
            })
            .await
            .unwrap();
        assert_eq!(h.mesh.session_count(), 0);
        assert!(drain(&mut h.outbox).is_empty());
    }

    #[tokio::test]
    async fn test_stray_answer_is_discarded() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();

        h.mesh
            .handle_server_message(ServerMessage::Answer {
                from: "a".to_string(),
                payload: json!({ "type": "answer", "sdp": "v=0" }),
            })
            .await
            .unwrap();
        assert_eq!(h.mesh.session_state("a"), Some(SessionState::Idle));
        assert!(!h.factory.log_for("a").contains(&Call::SetRemote(SdpType::Answer)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_departed_peer_timer_is_stale() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("a", &["a"])).await.unwrap();
        h.mesh
            .handle_server_message(ServerMessage::UserConnected(PeerRecord::new("b", "B")))
            .await
            .unwrap();
        h.mesh
            .handle_server_message(ServerMessage::UserDisconnected { peer_id: "b".to_string() })
            .await
            .unwrap();
        assert!(h.factory.log_for("b").contains(&Call::Close));
        drain(&mut h.outbox);

        let timer = next_timer(&mut h.events).await;
        h.mesh.handle_timer(timer).await.unwrap();
        assert!(drain(&mut h.outbox).is_empty());
        assert_eq!(h.mesh.session_count(), 0);
        assert_eq!(h.mesh.roster().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejoined_peer_ignores_old_generation() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("a", &["a"])).await.unwrap();
        let b = PeerRecord::new("b", "B");
        h.mesh.handle_server_message(ServerMessage::UserConnected(b.clone())).await.unwrap();
        let old = generation(&h.mesh, "b");
        h.mesh
            .handle_server_message(ServerMessage::UserDisconnected { peer_id: "b".to_string() })
            .await
            .unwrap();
        h.mesh.handle_server_message(ServerMessage::UserConnected(b)).await.unwrap();
        drain(&mut h.outbox);

        h.mesh
            .handle_timer(TimerEvent { peer_id: "b".to_string(), generation: old, kind: TimerKind::ConnectNewPeer })
            .await
            .unwrap();
        assert!(drain(&mut h.outbox).is_empty());

        h.mesh
            .handle_transport_event(TaggedTransportEvent {
                peer_id: "b".to_string(),
                generation: old,
                event: TransportEvent::StateChanged(TransportState::Failed),
            })
            .await
            .unwrap();
        assert_eq!(h.mesh.session_state("b"), Some(SessionState::Idle));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_session_recreated_then_abandoned() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("a", &["a", "b"])).await.unwrap();
        drain(&mut h.outbox);

        for round in 1..=3 {
            transport_state(&mut h.mesh, "b", TransportState::Failed).await;
            assert_eq!(h.mesh.session_state("b"), Some(SessionState::Failed));

            let start = tokio::time::Instant::now();
            let timer = next_timer(&mut h.events).await;
            assert_elapsed(start, Duration::from_secs(2));
            assert_eq!(timer.kind, TimerKind::Recreate);
            h.mesh.handle_timer(timer).await.unwrap();

            let session = h.mesh.session("b").unwrap();
            assert_eq!(session.recreations(), round);
            assert_eq!(
                session.state(),
                SessionState::Negotiating(crate::session::Role::Offerer)
            );
            assert_eq!(offer_targets(&drain(&mut h.outbox)), vec!["b".to_string()]);
        }
        assert_eq!(h.factory.created_for("b"), 4);

        transport_state(&mut h.mesh, "b", TransportState::Failed).await;
        assert_eq!(h.mesh.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resets_recreations() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("a", &["a", "b"])).await.unwrap();

        transport_state(&mut h.mesh, "b", TransportState::Failed).await;
        let timer = next_timer(&mut h.events).await;
        h.mesh.handle_timer(timer).await.unwrap();
        assert_eq!(h.mesh.session("b").unwrap().recreations(), 1);

        transport_state(&mut h.mesh, "b", TransportState::Connected).await;
        assert_eq!(h.mesh.session("b").unwrap().recreations(), 0);
    }

    #[tokio::test]
    async fn test_offer_to_failed_session_builds_fresh_one() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();
        transport_state(&mut h.mesh, "a", TransportState::Failed).await;
        let failed_generation = generation(&h.mesh, "a");
        drain(&mut h.outbox);

        h.mesh
            .handle_server_message(ServerMessage::Offer {
                from: "a".to_string(),
                payload: json!({ "type": "offer", "sdp": "v=0" }),
            })
            .await
            .unwrap();

        assert_eq!(h.factory.created_for("a"), 2);
        assert_ne!(generation(&h.mesh, "a"), failed_generation);
        assert_eq!(
            h.mesh.session_state("a"),
            Some(SessionState::Negotiating(crate::session::Role::Answerer))
        );
        assert!(matches!(&drain(&mut h.outbox)[..], [ClientMessage::Answer { .. }]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_recovery_restarts_ice() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();
        h.mesh
            .handle_server_message(ServerMessage::Offer {
                from: "a".to_string(),
                payload: json!({ "type": "offer", "sdp": "v=0" }),
            })
            .await
            .unwrap();
        transport_state(&mut h.mesh, "a", TransportState::Connected).await;
        transport_state(&mut h.mesh, "a", TransportState::Disconnected).await;
        assert_eq!(h.mesh.session_state("a"), Some(SessionState::Degraded));
        drain(&mut h.outbox);

        let start = tokio::time::Instant::now();
        let timer = next_timer(&mut h.events).await;
        assert_elapsed(start, Duration::from_secs(3));
        h.mesh.handle_timer(timer).await.unwrap();

        assert!(h.factory.log_for("a").contains(&Call::CreateOffer { ice_restart: true }));
        assert_eq!(offer_targets(&drain(&mut h.outbox)), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_local_candidates_forwarded() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();
        drain(&mut h.outbox);

        let generation = generation(&h.mesh, "a");
        h.mesh
            .handle_transport_event(TaggedTransportEvent {
                peer_id: "a".to_string(),
                generation,
                event: TransportEvent::LocalCandidate(crate::transport::IceCandidate {
                    candidate: "candidate:1".to_string(),
                    sdp_mid: Some("0".to_string()),
                    sdp_m_line_index: Some(0),
                }),
            })
            .await
            .unwrap();

        assert!(matches!(
            &drain(&mut h.outbox)[..],
            [ClientMessage::IceCandidate { target_id, .. }] if target_id == "a"
        ));
    }

    #[tokio::test]
    async fn test_mute_swaps_source_everywhere() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b", "c"])).await.unwrap();
        drain(&mut h.outbox);

        assert!(h.mesh.set_audio_enabled(false).await.unwrap());
        for peer in ["a", "c"] {
            assert!(h
                .factory
                .log_for(peer)
                .contains(&Call::ReplaceTrack(TrackKind::Audio, None)));
        }
        let sent = drain(&mut h.outbox);
        assert_eq!(
            sent,
            vec![ClientMessage::MediaStatus { audio_enabled: false, video_enabled: true }]
        );
        assert!(offer_targets(&sent).is_empty());
        let me = h.mesh.roster().iter().find(|p| p.id == "b").unwrap();
        assert!(!me.audio_enabled);
    }

    #[tokio::test]
    async fn test_screen_share_replaces_video() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();
        drain(&mut h.outbox);

        let screen = LocalTrack::new("screen", TrackKind::Video, TrackSource::Screen);
        h.mesh.start_screen_share(screen).await.unwrap();
        assert_eq!(drain(&mut h.outbox), vec![ClientMessage::ScreenSharingStart]);
        assert_eq!(
            h.mesh.session("a").unwrap().bound_track(TrackKind::Video).map(|t| t.id.as_str()),
            Some("screen")
        );

        assert!(h.mesh.stop_screen_share().await.unwrap());
        assert_eq!(drain(&mut h.outbox), vec![ClientMessage::ScreenSharingStop]);
        assert_eq!(
            h.mesh.session("a").unwrap().bound_track(TrackKind::Video).map(|t| t.id.as_str()),
            Some("cam")
        );
        assert!(!h.mesh.stop_screen_share().await.unwrap());
    }

    struct ScreenPicker(Option<LocalTrack>);

    #[async_trait::async_trait]
    impl MediaDevices for ScreenPicker {
        async fn get_user_media(
            &mut self,
            _constraints: crate::media::MediaConstraints,
        ) -> Result<Vec<LocalTrack>, crate::error::MediaAccessError> {
            Ok(vec![])
        }

        async fn get_display_media(&mut self) -> Result<LocalTrack, crate::error::MediaAccessError> {
            self.0.clone().ok_or(crate::error::MediaAccessError::Denied)
        }
    }

    #[tokio::test]
    async fn test_share_screen_through_picker() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();
        drain(&mut h.outbox);

        let err = h.mesh.share_screen(&mut ScreenPicker(None)).await.unwrap_err();
        assert!(matches!(err, ClientError::Media(_)));
        assert!(drain(&mut h.outbox).is_empty());
        assert!(!h.mesh.media().is_screen_sharing());

        let screen = LocalTrack::new("screen", TrackKind::Video, TrackSource::Screen);
        h.mesh.share_screen(&mut ScreenPicker(Some(screen))).await.unwrap();
        assert_eq!(drain(&mut h.outbox), vec![ClientMessage::ScreenSharingStart]);
        assert_eq!(
            h.mesh.session("a").unwrap().bound_track(TrackKind::Video).map(|t| t.id.as_str()),
            Some("screen")
        );
    }

    #[tokio::test]
    async fn test_roster_tracks_server_events() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b"])).await.unwrap();

        h.mesh
            .handle_server_message(ServerMessage::UserMediaStatus {
                peer_id: "a".to_string(),
                audio_enabled: false,
                video_enabled: true,
            })
            .await
            .unwrap();
        h.mesh
            .handle_server_message(ServerMessage::UserScreenShare { peer_id: "a".to_string(), is_sharing: true })
            .await
            .unwrap();
        h.mesh
            .handle_server_message(ServerMessage::AdminChanged { new_admin_id: "b".to_string() })
            .await
            .unwrap();

        let a = &h.mesh.roster()[0];
        assert!(!a.audio_enabled && a.screen_sharing && !a.is_admin);
        assert!(h.mesh.roster()[1].is_admin);
        assert!(h.mesh.is_admin());
    }

    #[tokio::test]
    async fn test_leave_tears_everything_down() {
        let mut h = harness(OfferPolicy::LowerIdOffers);
        h.mesh.handle_server_message(joined("b", &["a", "b", "c"])).await.unwrap();
        drain(&mut h.outbox);

        h.mesh.leave().await.unwrap();
        assert_eq!(h.mesh.session_count(), 0);
        assert!(h.mesh.roster().is_empty());
        assert!(h.mesh.local_peer_id().is_none());
        assert_eq!(h.mesh.media().profile(), crate::media::MediaProfile::ReceiveOnly);
        assert!(h.factory.log_for("a").contains(&Call::Close));
        assert!(h.factory.log_for("c").contains(&Call::Close));
        assert_eq!(drain(&mut h.outbox), vec![ClientMessage::LeaveRoom]);

        // Late answer after teardown goes nowhere
        h.mesh
            .handle_server_message(ServerMessage::Answer {
                from: "c".to_string(),
                payload: json!({ "type": "answer", "sdp": "v=0" }),
            })
            .await
            .unwrap();
        assert_eq!(h.mesh.session_count(), 0);
    }
}
