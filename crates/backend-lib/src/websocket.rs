// ==================
// crates/backend-lib/src/websocket.rs
// ==================
//! Per-connection message handling.
//!
//! A `ConnectionHandler` is created for every WebSocket. It owns the
//! connection's peer id (the identity other participants see) and the room it
//! currently belongs to, and routes each [`ClientMessage`] to the registry or
//! the relay:
//! - `join-room` / `leave-room`: membership, with the wrong-password lockout
//! - `media-status`, `screen-sharing-*`, `chat-message`: room updates
//! - `offer` / `answer` / `ice-candidate`: 1:1 relay
//!
//! Room-scoped messages from a connection that is in no room are ignored.

use crate::connections::ClientTx;
use crate::error::AppError;
use crate::relay::SignalKind;
use crate::AppState;
use meshroom_common::validation::{validate_chat_content, validate_display_name, validate_room_id};
use meshroom_common::{ClientMessage, JoinRejectReason, PeerId, PeerRecord, RoomId, ServerMessage};
use serde_json::Value;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// WebSocket handler for one connection
pub struct ConnectionHandler {
    state: Arc<AppState>,
    peer_id: PeerId,
    client_ip: Option<IpAddr>,
    current_room: Option<RoomId>,
}

impl ConnectionHandler {
    pub fn new(state: Arc<AppState>) -> Self {
        Self::with_peer_id(state, Uuid::new_v4().to_string())
    }

    pub fn with_peer_id(state: Arc<AppState>, peer_id: PeerId) -> Self {
        Self {
            state,
            peer_id,
            client_ip: None,
            current_room: None,
        }
    }

    /// Set client IP address, enabling the join lockout for this connection
    pub fn set_client_ip(&mut self, ip: IpAddr) {
        self.client_ip = Some(ip);
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn current_room(&self) -> Option<&str> {
        self.current_room.as_deref()
    }

    /// Make this connection reachable for broadcasts and relayed signals
    pub fn register(&self, tx: ClientTx) {
        self.state.connections.register(self.peer_id.clone(), tx);
    }

    /// Queue a message for this connection only
    pub fn reply(&self, msg: ServerMessage) {
        if !self.state.connections.send_to(&self.peer_id, msg) {
            debug!(peer_id = %self.peer_id, "reply dropped, connection gone");
        }
    }

    /// # Handle incoming client messages
    /// Errors are meant to be reported back to this client only; they never
    /// leave partial room state behind.
    pub async fn handle_message(&mut self, msg: ClientMessage) -> Result<(), AppError> {
        match msg {
            ClientMessage::JoinRoom { room_id, display_name, password } => {
                self.join(room_id, &display_name, password).await
            },
            ClientMessage::LeaveRoom => self.leave_current().await,
            ClientMessage::MediaStatus { audio_enabled, video_enabled } => {
                let Some(room_id) = self.room_or_ignore("media-status") else {
                    return Ok(());
                };
                self.state
                    .registry
                    .set_media_status(&room_id, &self.peer_id, audio_enabled, video_enabled)
                    .await
            },
            ClientMessage::ScreenSharingStart => self.screen_sharing(true).await,
            ClientMessage::ScreenSharingStop => self.screen_sharing(false).await,
            ClientMessage::ChatMessage { content } => {
                let Some(room_id) = self.room_or_ignore("chat-message") else {
                    return Ok(());
                };
                let content = validate_chat_content(&content)?.to_string();
                self.state
                    .registry
                    .send_chat(&room_id, &self.peer_id, content)
                    .await
                    .map(|_| ())
            },
            ClientMessage::Offer { target_id, payload } => {
                self.relay(SignalKind::Offer, &target_id, payload);
                Ok(())
            },
            ClientMessage::Answer { target_id, payload } => {
                self.relay(SignalKind::Answer, &target_id, payload);
                Ok(())
            },
            ClientMessage::IceCandidate { target_id, payload } => {
                self.relay(SignalKind::IceCandidate, &target_id, payload);
                Ok(())
            },
        }
    }

    async fn join(
        &mut self,
        room_id: RoomId,
        display_name: &str,
        password: Option<String>,
    ) -> Result<(), AppError> {
        if let Err(e) = validate_room_id(&room_id) {
            warn!(peer_id = %self.peer_id, "join refused: {e}");
            self.reply(ServerMessage::JoinRejected {
                reason: JoinRejectReason::InvalidRequest,
            });
            return Ok(());
        }

        let display_name = if display_name.trim().is_empty() {
            self.fallback_name()
        } else {
            match validate_display_name(display_name) {
                Ok(name) => name.to_string(),
                Err(e) => {
                    warn!(peer_id = %self.peer_id, "join refused: {e}");
                    self.reply(ServerMessage::JoinRejected {
                        reason: JoinRejectReason::InvalidRequest,
                    });
                    return Ok(());
                },
            }
        };

        if let Some(ip) = self.client_ip {
            if !self.state.join_limiter.check(ip) {
                self.reply(ServerMessage::JoinRejected {
                    reason: JoinRejectReason::TooManyAttempts,
                });
                return Ok(());
            }
        }

        info!(peer_id = %self.peer_id, %room_id, %display_name, "joining room");
        let record = PeerRecord::new(self.peer_id.clone(), display_name);
        match self.state.registry.join_room(&room_id, record, password).await {
            Ok(()) => {
                if let Some(ip) = self.client_ip {
                    self.state.join_limiter.record_success(ip);
                }
                // One room per connection; the old one is left only once the new one admitted us
                let previous = self.current_room.replace(room_id.clone());
                if let Some(previous) = previous.filter(|prev| *prev != room_id) {
                    self.state.registry.leave_room(&previous, &self.peer_id).await?;
                }
                Ok(())
            },
            Err(AppError::IncorrectPassword) => {
                if let Some(ip) = self.client_ip {
                    self.state.join_limiter.record_failed_attempt(ip);
                }
                self.reply(ServerMessage::JoinRejected {
                    reason: JoinRejectReason::IncorrectPassword,
                });
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    fn fallback_name(&self) -> String {
        let prefix: String = self.peer_id.chars().take(4).collect();
        format!("User-{prefix}")
    }

    async fn screen_sharing(&mut self, sharing: bool) -> Result<(), AppError> {
        let Some(room_id) = self.room_or_ignore("screen-sharing") else {
            return Ok(());
        };
        self.state
            .registry
            .set_screen_sharing(&room_id, &self.peer_id, sharing)
            .await
    }

    fn relay(&self, kind: SignalKind, target_id: &str, payload: Value) {
        // Only room members may signal; the target itself is not re-checked
        if self.room_or_ignore("signal").is_none() {
            return;
        }
        self.state
            .relay
            .forward(kind, &self.peer_id, target_id, payload);
    }

    fn room_or_ignore(&self, what: &str) -> Option<RoomId> {
        if self.current_room.is_none() {
            debug!(peer_id = %self.peer_id, "ignoring {what} outside a room");
        }
        self.current_room.clone()
    }

    /// Leave the current room, if any
    pub async fn leave_current(&mut self) -> Result<(), AppError> {
        if let Some(room_id) = self.current_room.take() {
            self.state.registry.leave_room(&room_id, &self.peer_id).await?;
        }
        Ok(())
    }

    /// Connection closed: leave the room and become unreachable
    pub async fn disconnect(&mut self) {
        if let Err(e) = self.leave_current().await {
            warn!(peer_id = %self.peer_id, "leave on disconnect failed: {e}");
        }
        self.state.connections.unregister(&self.peer_id);
    }
}
