// ============================
// meshroom-backend/src/room_actor.rs
// ============================
//! One task per room. The actor owns the [`Room`] and is the only writer, so
//! membership changes, admin hand-off and history eviction are applied in a
//! single order, and each change is fanned out before the next command runs.
use crate::auth::RoomSecret;
use crate::connections::ConnectionMap;
use crate::error::AppError;
use crate::metrics::{CHAT_MESSAGE, ROOM_JOINED};
use crate::room::{Departure, Room};
use meshroom_common::{ChatMessage, PeerId, PeerRecord, RoomId, RoomInfo, RoomSummary, ServerMessage};
use metrics::counter;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

/// Message sent *into* the actor
#[derive(Debug)]
pub enum RoomCmd {
    /// Admission has already been checked against the room password
    Join {
        peer: PeerRecord,
        resp_tx: oneshot::Sender<bool>,
    },
    Leave {
        peer_id: PeerId,
        resp_tx: oneshot::Sender<Option<Departure>>,
    },
    MediaStatus {
        peer_id: PeerId,
        audio_enabled: bool,
        video_enabled: bool,
        resp_tx: oneshot::Sender<Result<(), AppError>>,
    },
    ScreenSharing {
        peer_id: PeerId,
        sharing: bool,
        resp_tx: oneshot::Sender<Result<(), AppError>>,
    },
    Chat {
        peer_id: PeerId,
        content: String,
        resp_tx: oneshot::Sender<Result<ChatMessage, AppError>>,
    },
    Summary {
        resp_tx: oneshot::Sender<RoomSummary>,
    },
    Info {
        resp_tx: oneshot::Sender<RoomInfo>,
    },
}

/// Handle that other components keep: the actor's command channel and the
/// room's password, which is fixed at creation
#[derive(Clone, Debug)]
pub struct RoomHandle {
    room_id: RoomId,
    secret: Option<RoomSecret>,
    cmd_tx: mpsc::UnboundedSender<RoomCmd>,
}

impl RoomHandle {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Both handles talk to the same actor
    pub fn same_actor(&self, other: &RoomHandle) -> bool {
        self.cmd_tx.same_channel(&other.cmd_tx)
    }

    /// Check `password` against the room's gate without involving the actor.
    /// Open rooms admit any password, or none.
    pub async fn admits(&self, password: Option<&str>) -> bool {
        match (&self.secret, password) {
            (None, _) => true,
            (Some(secret), Some(candidate)) => secret.verify(candidate.to_string()).await,
            (Some(_), None) => false,
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCmd,
    ) -> Result<T, AppError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        // Either failure means the actor emptied and stopped
        self.cmd_tx
            .send(make(resp_tx))
            .map_err(|_| AppError::RoomClosed(self.room_id.clone()))?;
        resp_rx
            .await
            .map_err(|_| AppError::RoomClosed(self.room_id.clone()))
    }

    /// Add an already admitted peer. `Ok(false)` means it was a member already.
    pub async fn join(&self, peer: PeerRecord) -> Result<bool, AppError> {
        self.request(|resp_tx| RoomCmd::Join { peer, resp_tx }).await
    }

    pub async fn leave(&self, peer_id: PeerId) -> Result<Option<Departure>, AppError> {
        self.request(|resp_tx| RoomCmd::Leave { peer_id, resp_tx }).await
    }

    pub async fn set_media_status(
        &self,
        peer_id: PeerId,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Result<(), AppError> {
        self.request(|resp_tx| RoomCmd::MediaStatus {
            peer_id,
            audio_enabled,
            video_enabled,
            resp_tx,
        })
        .await?
    }

    pub async fn set_screen_sharing(&self, peer_id: PeerId, sharing: bool) -> Result<(), AppError> {
        self.request(|resp_tx| RoomCmd::ScreenSharing { peer_id, sharing, resp_tx })
            .await?
    }

    pub async fn send_chat(&self, peer_id: PeerId, content: String) -> Result<ChatMessage, AppError> {
        self.request(|resp_tx| RoomCmd::Chat { peer_id, content, resp_tx })
            .await?
    }

    pub async fn summary(&self) -> Result<RoomSummary, AppError> {
        self.request(|resp_tx| RoomCmd::Summary { resp_tx }).await
    }

    pub async fn info(&self) -> Result<RoomInfo, AppError> {
        self.request(|resp_tx| RoomCmd::Info { resp_tx }).await
    }
}

pub struct RoomActor {
    room: Room,
    connections: ConnectionMap,
}

impl RoomActor {
    pub fn new(room: Room, connections: ConnectionMap) -> Self {
        Self { room, connections }
    }

    /// Returns false when `peer` was already a member; it then only gets a
    /// fresh snapshot and nobody else is told.
    pub fn handle_join(&mut self, peer: PeerRecord) -> bool {
        let peer_id = peer.id.clone();
        let added = self.room.admit(peer);

        // The joiner's snapshot is queued before any later broadcast can reach it
        self.connections
            .send_to(&peer_id, self.room.joined_view(&peer_id));

        if !added {
            debug!(room_id = %self.room.id(), %peer_id, "already a member, snapshot resent");
            return false;
        }

        if let Some(record) = self.room.members().iter().find(|m| m.id == peer_id) {
            let notice = ServerMessage::UserConnected(record.clone());
            let others = self.room.others(&peer_id);
            self.connections
                .send_to_many(others.iter().map(String::as_str), &notice);
        }

        counter!(ROOM_JOINED).increment(1);
        info!(
            room_id = %self.room.id(),
            %peer_id,
            members = self.room.len(),
            "peer joined room"
        );
        true
    }

    pub fn handle_leave(&mut self, peer_id: &str) -> Option<Departure> {
        let departure = self.room.remove(peer_id)?;
        let remaining = departure.remaining.iter().map(String::as_str);

        self.connections.send_to_many(
            remaining.clone(),
            &ServerMessage::UserDisconnected {
                peer_id: peer_id.to_string(),
            },
        );

        if let Some(new_admin_id) = &departure.new_admin {
            info!(room_id = %self.room.id(), %new_admin_id, "admin changed");
            self.connections.send_to_many(
                remaining,
                &ServerMessage::AdminChanged {
                    new_admin_id: new_admin_id.clone(),
                },
            );
        }

        info!(
            room_id = %self.room.id(),
            %peer_id,
            members = self.room.len(),
            "peer left room"
        );
        Some(departure)
    }

    pub fn handle_media_status(
        &mut self,
        peer_id: &str,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Result<(), AppError> {
        self.room
            .set_media_status(peer_id, audio_enabled, video_enabled)?;
        let notice = ServerMessage::UserMediaStatus {
            peer_id: peer_id.to_string(),
            audio_enabled,
            video_enabled,
        };
        let others = self.room.others(peer_id);
        self.connections
            .send_to_many(others.iter().map(String::as_str), &notice);
        Ok(())
    }

    pub fn handle_screen_sharing(&mut self, peer_id: &str, sharing: bool) -> Result<(), AppError> {
        self.room.set_screen_sharing(peer_id, sharing)?;
        let notice = ServerMessage::UserScreenShare {
            peer_id: peer_id.to_string(),
            is_sharing: sharing,
        };
        let others = self.room.others(peer_id);
        self.connections
            .send_to_many(others.iter().map(String::as_str), &notice);
        Ok(())
    }

    pub fn handle_chat(&mut self, peer_id: &str, content: String) -> Result<ChatMessage, AppError> {
        let message = self.room.post_message(peer_id, content)?;
        // Chat goes to everyone, sender included
        let members = self.room.member_ids();
        self.connections.send_to_many(
            members.iter().map(String::as_str),
            &ServerMessage::NewMessage(message.clone()),
        );
        counter!(CHAT_MESSAGE).increment(1);
        debug!(room_id = %self.room.id(), %peer_id, message_id = %message.id, "chat message");
        Ok(message)
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RoomCmd>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                RoomCmd::Join { peer, resp_tx } => {
                    let added = self.handle_join(peer);
                    let _ = resp_tx.send(added);
                },
                RoomCmd::Leave { peer_id, resp_tx } => {
                    let departure = self.handle_leave(&peer_id);
                    let _ = resp_tx.send(departure);
                },
                RoomCmd::MediaStatus { peer_id, audio_enabled, video_enabled, resp_tx } => {
                    let result = self.handle_media_status(&peer_id, audio_enabled, video_enabled);
                    let _ = resp_tx.send(result);
                },
                RoomCmd::ScreenSharing { peer_id, sharing, resp_tx } => {
                    let result = self.handle_screen_sharing(&peer_id, sharing);
                    let _ = resp_tx.send(result);
                },
                RoomCmd::Chat { peer_id, content, resp_tx } => {
                    let result = self.handle_chat(&peer_id, content);
                    let _ = resp_tx.send(result);
                },
                RoomCmd::Summary { resp_tx } => {
                    let _ = resp_tx.send(self.room.summary());
                },
                RoomCmd::Info { resp_tx } => {
                    let _ = resp_tx.send(self.room.info());
                },
            }

            if self.room.is_empty() {
                break;
            }
        }

        // Commands still queued are dropped; their callers see `RoomClosed`
        debug!(room_id = %self.room.id(), "room actor stopped");
    }
}

/// Spawn a room actor and return its handle
pub fn spawn_room_actor(room: Room, connections: ConnectionMap) -> RoomHandle {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = RoomHandle {
        room_id: room.id().to_string(),
        secret: room.secret().cloned(),
        cmd_tx,
    };
    let actor = RoomActor::new(room, connections);

    tokio::spawn(async move {
        actor.run(cmd_rx).await;
    });

    handle
}
