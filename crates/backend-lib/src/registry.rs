// ============================
// meshroom-backend/src/registry.rs
// ============================
//! Room registry and actor coordination.
use crate::auth::{RoomPasswordHasher, RoomSecret};
use crate::connections::ConnectionMap;
use crate::error::AppError;
use crate::metrics::{ROOM_ACTIVE, ROOM_CLOSED, ROOM_CREATED, ROOM_JOINED, ROOM_JOIN_REJECTED};
use crate::room::{Departure, Room};
use crate::room_actor::{spawn_room_actor, RoomHandle};
use dashmap::{mapref::entry::Entry, DashMap};
use meshroom_common::{ChatMessage, PeerRecord, RoomId, RoomInfo, RoomSummary};
use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Owns every live room. Entries appear on the first join and disappear
/// when the last member leaves.
#[derive(Clone)]
pub struct SessionRegistry {
    rooms: Arc<DashMap<RoomId, RoomHandle>>,
    connections: ConnectionMap,
    hasher: RoomPasswordHasher,
    history_capacity: usize,
}

impl SessionRegistry {
    pub fn new(
        connections: ConnectionMap,
        hasher: RoomPasswordHasher,
        history_capacity: usize,
    ) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            connections,
            hasher,
            history_capacity,
        }
    }

    /// Join `room_id`, creating it with `peer` as admin if it does not exist.
    ///
    /// On success the `room-joined` snapshot has already been queued to the
    /// joiner and existing members have been told about the arrival. A wrong
    /// password fails with `IncorrectPassword` before the room is touched.
    pub async fn join_room(
        &self,
        room_id: &str,
        peer: PeerRecord,
        password: Option<String>,
    ) -> Result<(), AppError> {
        let password = password.filter(|p| !p.is_empty());
        loop {
            let handle = match self.handle(room_id) {
                Some(handle) => handle,
                None => {
                    // Hash before taking the entry; no shard lock is held meanwhile
                    let secret = match &password {
                        Some(plain) => Some(self.hasher.hash(plain.clone()).await?),
                        None => None,
                    };
                    match self.rooms.entry(room_id.to_string()) {
                        Entry::Vacant(entry) => {
                            self.create_room(entry, peer, secret);
                            return Ok(());
                        },
                        // Created by someone else while we were hashing
                        Entry::Occupied(entry) => entry.get().clone(),
                    }
                },
            };

            if !handle.admits(password.as_deref()).await {
                counter!(ROOM_JOIN_REJECTED).increment(1);
                warn!(%room_id, peer_id = %peer.id, "join rejected: incorrect password");
                return Err(AppError::IncorrectPassword);
            }

            match handle.join(peer.clone()).await {
                Ok(_) => return Ok(()),
                Err(AppError::RoomClosed(_)) => {
                    // The room emptied under us; forget the stale actor and retry
                    self.forget(&handle);
                },
                Err(e) => return Err(e),
            }
        }
    }

    fn create_room(
        &self,
        entry: dashmap::mapref::entry::VacantEntry<'_, RoomId, RoomHandle>,
        peer: PeerRecord,
        secret: Option<RoomSecret>,
    ) {
        let room_id = entry.key().clone();
        let peer_id = peer.id.clone();
        let room = Room::create(room_id.clone(), peer, secret, self.history_capacity);
        let protected = room.is_password_protected();
        self.connections.send_to(&peer_id, room.joined_view(&peer_id));

        entry.insert(spawn_room_actor(room, self.connections.clone()));

        counter!(ROOM_CREATED).increment(1);
        counter!(ROOM_JOINED).increment(1);
        gauge!(ROOM_ACTIVE).set(self.rooms.len() as f64);
        info!(%room_id, admin = %peer_id, protected, "created room");
    }

    /// Remove `peer_id` from `room_id`; destroys the room when it empties
    pub async fn leave_room(&self, room_id: &str, peer_id: &str) -> Result<Option<Departure>, AppError> {
        let Some(handle) = self.handle(room_id) else {
            return Ok(None);
        };

        let departure = match handle.leave(peer_id.to_string()).await {
            Ok(departure) => departure,
            Err(AppError::RoomClosed(_)) => {
                self.forget(&handle);
                return Ok(None);
            },
            Err(e) => return Err(e),
        };

        if departure.as_ref().is_some_and(Departure::emptied_room) {
            self.forget(&handle);
            counter!(ROOM_CLOSED).increment(1);
            info!(%room_id, "room is now empty, cleaning up");
        }
        Ok(departure)
    }

    pub async fn set_media_status(
        &self,
        room_id: &str,
        peer_id: &str,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Result<(), AppError> {
        self.require(room_id)?
            .set_media_status(peer_id.to_string(), audio_enabled, video_enabled)
            .await
    }

    pub async fn set_screen_sharing(&self, room_id: &str, peer_id: &str, sharing: bool) -> Result<(), AppError> {
        self.require(room_id)?
            .set_screen_sharing(peer_id.to_string(), sharing)
            .await
    }

    pub async fn send_chat(&self, room_id: &str, peer_id: &str, content: String) -> Result<ChatMessage, AppError> {
        self.require(room_id)?
            .send_chat(peer_id.to_string(), content)
            .await
    }

    /// Public listing: counts and flags only, never passwords or members
    pub async fn list_rooms(&self) -> Vec<RoomSummary> {
        // Collect handles first so no map guard is held across an await
        let handles: Vec<RoomHandle> = self.rooms.iter().map(|e| e.value().clone()).collect();

        let mut summaries = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.summary().await {
                Ok(summary) => summaries.push(summary),
                Err(_) => debug!(room_id = %handle.room_id(), "skipping closed room"),
            }
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Existence and password flag for one room
    pub async fn room_info(&self, room_id: &str) -> RoomInfo {
        match self.handle(room_id) {
            Some(handle) => handle.info().await.unwrap_or(RoomInfo::MISSING),
            None => RoomInfo::MISSING,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn handle(&self, room_id: &str) -> Option<RoomHandle> {
        self.rooms.get(room_id).map(|entry| entry.value().clone())
    }

    fn require(&self, room_id: &str) -> Result<RoomHandle, AppError> {
        self.handle(room_id)
            .ok_or_else(|| AppError::RoomNotFound(room_id.to_string()))
    }

    /// Drop the map entry only if it still points at this actor
    fn forget(&self, handle: &RoomHandle) {
        if self
            .rooms
            .remove_if(handle.room_id(), |_, current| current.same_actor(handle))
            .is_some()
        {
            gauge!(ROOM_ACTIVE).set(self.rooms.len() as f64);
        }
    }
}
