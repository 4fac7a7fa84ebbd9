// ============================
// meshroom-backend/src/room.rs
// ============================
//! Authoritative state of a single room.
//!
//! `Room` is plain data with synchronous transitions. It is owned by exactly one
//! room actor (see [`crate::room_actor`]), which serializes every mutation.
//!
//! Invariants upheld by every method:
//! - while `members` is non-empty exactly one member has `is_admin` set, and it is `admin_id`
//! - `messages` never holds more than `history_capacity` entries, oldest evicted first
//! - admitting a peer that is already a member changes nothing
//!
//! The password gate is checked before a join reaches the room (see
//! [`crate::room_actor::RoomHandle::admits`]).

use crate::auth::RoomSecret;
use crate::error::AppError;
use chrono::{DateTime, Utc};
use meshroom_common::{ChatMessage, PeerId, PeerRecord, RoomId, RoomInfo, RoomSummary, ServerMessage};
use std::collections::VecDeque;
use uuid::Uuid;

/// Result of removing a member
#[derive(Debug, Clone, PartialEq)]
pub struct Departure {
    pub departed: PeerRecord,
    /// Set when the departing member was admin and someone was promoted
    pub new_admin: Option<PeerId>,
    /// Members left behind, in join order
    pub remaining: Vec<PeerId>,
}

impl Departure {
    /// The room has no members left and must be destroyed
    pub fn emptied_room(&self) -> bool {
        self.remaining.is_empty()
    }
}

#[derive(Debug)]
pub struct Room {
    id: RoomId,
    secret: Option<RoomSecret>,
    admin_id: PeerId,
    members: Vec<PeerRecord>,
    messages: VecDeque<ChatMessage>,
    history_capacity: usize,
    created_at: DateTime<Utc>,
}

impl Room {
    /// Create a room with `creator` as its first member and admin
    pub fn create(
        id: RoomId,
        mut creator: PeerRecord,
        secret: Option<RoomSecret>,
        history_capacity: usize,
    ) -> Self {
        creator.is_admin = true;
        Self {
            id,
            secret,
            admin_id: creator.id.clone(),
            members: vec![creator],
            messages: VecDeque::with_capacity(history_capacity),
            history_capacity,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn admin_id(&self) -> &str {
        &self.admin_id
    }

    pub fn members(&self) -> &[PeerRecord] {
        &self.members
    }

    pub fn messages(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_password_protected(&self) -> bool {
        self.secret.is_some()
    }

    pub fn secret(&self) -> Option<&RoomSecret> {
        self.secret.as_ref()
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.members.iter().any(|m| m.id == peer_id)
    }

    /// Ids of every member except `peer_id`, in join order
    pub fn others(&self, peer_id: &str) -> Vec<PeerId> {
        self.members
            .iter()
            .filter(|m| m.id != peer_id)
            .map(|m| m.id.clone())
            .collect()
    }

    pub fn member_ids(&self) -> Vec<PeerId> {
        self.members.iter().map(|m| m.id.clone()).collect()
    }

    /// Append a new member. Returns false if `peer` was already a member.
    pub fn admit(&mut self, mut peer: PeerRecord) -> bool {
        if self.contains(&peer.id) {
            return false;
        }

        peer.is_admin = false;
        self.members.push(peer);
        true
    }

    /// The `room-joined` view sent to `peer_id`
    pub fn joined_view(&self, peer_id: &str) -> ServerMessage {
        ServerMessage::RoomJoined {
            room_id: self.id.clone(),
            peer_id: peer_id.to_string(),
            is_admin: self.admin_id == peer_id,
            participants: self.members.clone(),
            messages: self.messages.iter().cloned().collect(),
        }
    }

    /// Remove a member, promoting the earliest-joined remaining member if the admin left
    pub fn remove(&mut self, peer_id: &str) -> Option<Departure> {
        let index = self.members.iter().position(|m| m.id == peer_id)?;
        let departed = self.members.remove(index);

        let mut new_admin = None;
        if departed.is_admin {
            if let Some(successor) = self.members.first_mut() {
                successor.is_admin = true;
                self.admin_id = successor.id.clone();
                new_admin = Some(successor.id.clone());
            }
        }

        Some(Departure {
            departed,
            new_admin,
            remaining: self.member_ids(),
        })
    }

    fn member_mut(&mut self, peer_id: &str) -> Result<&mut PeerRecord, AppError> {
        let room_id = &self.id;
        self.members
            .iter_mut()
            .find(|m| m.id == peer_id)
            .ok_or_else(|| AppError::NotAMember {
                peer_id: peer_id.to_string(),
                room_id: room_id.clone(),
            })
    }

    pub fn set_media_status(
        &mut self,
        peer_id: &str,
        audio_enabled: bool,
        video_enabled: bool,
    ) -> Result<(), AppError> {
        let member = self.member_mut(peer_id)?;
        member.audio_enabled = audio_enabled;
        member.video_enabled = video_enabled;
        Ok(())
    }

    pub fn set_screen_sharing(&mut self, peer_id: &str, sharing: bool) -> Result<(), AppError> {
        self.member_mut(peer_id)?.screen_sharing = sharing;
        Ok(())
    }

    /// Append a chat message from `sender_id`, evicting the oldest past capacity
    pub fn post_message(&mut self, sender_id: &str, content: String) -> Result<ChatMessage, AppError> {
        let sender_name = self.member_mut(sender_id)?.display_name.clone();

        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.to_string(),
            sender_name,
            content,
            // wall clock may step backwards
            timestamp: Utc::now().max(self.created_at),
        };

        self.messages.push_back(message.clone());
        while self.messages.len() > self.history_capacity {
            self.messages.pop_front();
        }

        Ok(message)
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            id: self.id.clone(),
            user_count: self.members.len(),
            created_at: self.created_at,
            is_password_protected: self.is_password_protected(),
        }
    }

    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            exists: true,
            is_password_protected: self.is_password_protected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::password::test_hasher;

    fn admin_count(room: &Room) -> usize {
        room.members().iter().filter(|m| m.is_admin).count()
    }

    fn open_room(creator: &str) -> Room {
        Room::create("abc12".to_string(), PeerRecord::new(creator, creator), None, 100)
    }

    #[test]
    fn test_creator_is_admin() {
        let room = open_room("a");
        assert_eq!(room.admin_id(), "a");
        assert_eq!(admin_count(&room), 1);
        assert!(!room.is_password_protected());
    }

    #[test]
    fn test_admit_never_grants_admin() {
        let mut room = open_room("a");
        let mut sneaky = PeerRecord::new("b", "b");
        sneaky.is_admin = true;
        assert!(room.admit(sneaky));

        assert_eq!(admin_count(&room), 1);
        assert_eq!(room.member_ids(), vec!["a", "b"]);
    }

    #[test]
    fn test_readmit_is_a_no_op() {
        let mut room = open_room("a");
        assert!(room.admit(PeerRecord::new("b", "B")));
        assert!(!room.admit(PeerRecord::new("b", "Bob again")));

        assert_eq!(room.member_ids(), vec!["a", "b"]);
        assert_eq!(room.members()[1].display_name, "B");
    }

    #[test]
    fn test_protected_room_keeps_secret() {
        let secret = test_hasher().hash_sync("xyz").unwrap();
        let room = Room::create("abc12".to_string(), PeerRecord::new("a", "A"), Some(secret), 100);

        assert!(room.is_password_protected());
        assert!(room.info().is_password_protected);
        assert!(room.summary().is_password_protected);
        assert!(room.secret().is_some_and(|s| s.verify_sync("xyz")));
    }

    #[test]
    fn test_admin_succession_picks_earliest_joined() {
        let mut room = open_room("a");
        room.admit(PeerRecord::new("b", "B"));
        room.admit(PeerRecord::new("c", "C"));

        let departure = room.remove("a").unwrap();
        assert_eq!(departure.new_admin.as_deref(), Some("b"));
        assert_eq!(departure.remaining, vec!["b", "c"]);
        assert_eq!(room.admin_id(), "b");
        assert_eq!(admin_count(&room), 1);
    }

    #[test]
    fn test_non_admin_departure_keeps_admin() {
        let mut room = open_room("a");
        room.admit(PeerRecord::new("b", "B"));

        let departure = room.remove("b").unwrap();
        assert!(departure.new_admin.is_none());
        assert_eq!(room.admin_id(), "a");
        assert!(room.remove("b").is_none());
    }

    #[test]
    fn test_last_departure_empties_room() {
        let mut room = open_room("a");
        let departure = room.remove("a").unwrap();
        assert!(departure.emptied_room());
        assert!(departure.new_admin.is_none());
        assert!(room.is_empty());
    }

    #[test]
    fn test_exactly_one_admin_through_churn() {
        let mut room = open_room("p0");
        for i in 1..6 {
            room.admit(PeerRecord::new(format!("p{i}"), "x"));
        }
        for leaving in ["p0", "p3", "p1", "p5", "p2"] {
            room.remove(leaving).unwrap();
            assert_eq!(admin_count(&room), 1, "after {leaving} left");
            assert!(room.members().iter().any(|m| m.is_admin && m.id == room.admin_id()));
        }
        assert_eq!(room.admin_id(), "p4");
    }

    #[test]
    fn test_history_evicts_oldest_first() {
        let mut room = Room::create("r".to_string(), PeerRecord::new("a", "A"), None, 100);
        for i in 0..105 {
            room.post_message("a", format!("m{i}")).unwrap();
        }

        let contents: Vec<_> = room.messages().map(|m| m.content.clone()).collect();
        assert_eq!(contents.len(), 100);
        assert_eq!(contents.first().map(String::as_str), Some("m5"));
        assert_eq!(contents.last().map(String::as_str), Some("m104"));
    }

    #[test]
    fn test_message_snapshot_and_timestamp() {
        let mut room = open_room("a");
        let message = room.post_message("a", "hi".to_string()).unwrap();
        assert_eq!(message.sender_name, "a");
        assert_eq!(message.content, "hi");
        assert!(message.timestamp >= room.created_at());

        assert!(matches!(
            room.post_message("ghost", "boo".to_string()),
            Err(AppError::NotAMember { .. })
        ));
    }

    #[test]
    fn test_media_and_screen_flags() {
        let mut room = open_room("a");
        room.set_media_status("a", false, true).unwrap();
        room.set_screen_sharing("a", true).unwrap();

        let me = &room.members()[0];
        assert!(!me.audio_enabled);
        assert!(me.video_enabled);
        assert!(me.screen_sharing);
        assert!(room.set_screen_sharing("ghost", true).is_err());
    }

    #[test]
    fn test_joined_view_marks_admin() {
        let mut room = open_room("a");
        room.admit(PeerRecord::new("b", "B"));

        match room.joined_view("b") {
            ServerMessage::RoomJoined { peer_id, is_admin, participants, .. } => {
                assert_eq!(peer_id, "b");
                assert!(!is_admin);
                assert_eq!(participants.len(), 2);
            },
            other => panic!("unexpected {other:?}"),
        }
    }
}
