// ================
// common/src/lib.rs
// ================
//! Common types and structures
//! used for communication between `meshroom` clients and the relay server.
//! This module defines the WebSocket protocol messages and supporting types.

pub mod validation;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Identity of one participant for the lifetime of a single connection
pub type PeerId = String;

/// Opaque room identifier chosen by clients
pub type RoomId = String;

/// Messages sent from client to server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msgType", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Join (or create) a room
    /// # Fields
    /// * `room_id` - ID of the room to join
    /// * `display_name` - Name shown to the other participants
    /// * `password` - Room password, required only for protected rooms
    JoinRoom {
        room_id: RoomId,
        display_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        password: Option<String>,
    },
    /// Leave the current room
    LeaveRoom,
    /// Report local microphone/camera state
    MediaStatus {
        audio_enabled: bool,
        video_enabled: bool,
    },
    /// Local participant started sharing their screen
    ScreenSharingStart,
    /// Local participant stopped sharing their screen
    ScreenSharingStop,
    /// Post a chat message to the room
    ChatMessage { content: String },
    /// Session description offer for `target_id`
    Offer { target_id: PeerId, payload: Value },
    /// Session description answer for `target_id`
    Answer { target_id: PeerId, payload: Value },
    /// ICE candidate for `target_id`
    IceCandidate { target_id: PeerId, payload: Value },
}

/// Messages sent from server to client
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "msgType", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Response to a successful join
    RoomJoined {
        room_id: RoomId,
        /// The recipient's own peer id
        peer_id: PeerId,
        is_admin: bool,
        participants: Vec<PeerRecord>,
        messages: Vec<ChatMessage>,
    },
    /// Response to a failed join
    JoinRejected { reason: JoinRejectReason },
    /// A new participant joined the room
    UserConnected(PeerRecord),
    /// A participant left the room
    UserDisconnected { peer_id: PeerId },
    /// Host role moved to another participant
    AdminChanged { new_admin_id: PeerId },
    /// A participant changed their media flags
    UserMediaStatus {
        peer_id: PeerId,
        audio_enabled: bool,
        video_enabled: bool,
    },
    /// A participant started or stopped screen sharing
    UserScreenShare { peer_id: PeerId, is_sharing: bool },
    /// A chat message posted to the room
    NewMessage(ChatMessage),
    /// Relayed offer
    Offer { from: PeerId, payload: Value },
    /// Relayed answer
    Answer { from: PeerId, payload: Value },
    /// Relayed ICE candidate
    IceCandidate { from: PeerId, payload: Value },
    /// Error response for frames that could not be parsed
    MalformedMessage { err_msg: String },
    /// Error response for a failed request
    Error { code: String, message: String },
}

/// Why a join was refused
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum JoinRejectReason {
    IncorrectPassword,
    InvalidRequest,
    TooManyAttempts,
}

/// One participant as seen by every member of a room.
///
/// The media flags are reported by the owning client and relayed verbatim.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerRecord {
    pub id: PeerId,
    pub display_name: String,
    pub is_admin: bool,
    pub audio_enabled: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
}

impl PeerRecord {
    /// A fresh record with audio and video on, not admin
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            is_admin: false,
            audio_enabled: true,
            video_enabled: true,
            screen_sharing: false,
        }
    }
}

/// An immutable chat entry
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: PeerId,
    /// Sender's display name at the time of sending
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

/// Public listing entry for `GET /api/rooms`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: RoomId,
    pub user_count: usize,
    pub created_at: DateTime<Utc>,
    pub is_password_protected: bool,
}

/// Single-room lookup for `GET /api/room/{id}`
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub exists: bool,
    pub is_password_protected: bool,
}

impl RoomInfo {
    pub const MISSING: RoomInfo = RoomInfo {
        exists: false,
        is_password_protected: false,
    };
}
