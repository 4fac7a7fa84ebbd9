// ============================
// meshroom-client/src/join.rs
// ============================
//! Join requests, checked before anything touches the network.
use crate::error::ClientError;
use meshroom_common::validation::{validate_display_name, validate_room_id};
use meshroom_common::{ClientMessage, RoomId};
use rand::Rng;

const ROOM_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const ROOM_ID_LENGTH: usize = 5;

/// A random 5-character lowercase base-36 room id
pub fn generate_room_id() -> RoomId {
    let mut rng = rand::rng();
    (0..ROOM_ID_LENGTH)
        .map(|_| ROOM_ID_ALPHABET[rng.random_range(0..ROOM_ID_ALPHABET.len())] as char)
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRequest {
    room_id: RoomId,
    display_name: String,
    password: Option<String>,
}

impl JoinRequest {
    /// Join an existing room
    pub fn new(room_id: &str, display_name: &str, password: Option<&str>) -> Result<Self, ClientError> {
        let room_id = room_id.trim();
        if room_id.is_empty() {
            return Err(ClientError::MissingField("room id"));
        }
        validate_room_id(room_id)?;

        if display_name.trim().is_empty() {
            return Err(ClientError::MissingField("display name"));
        }
        let display_name = validate_display_name(display_name)?;

        Ok(Self {
            room_id: room_id.to_string(),
            display_name: display_name.to_string(),
            password: password.filter(|p| !p.is_empty()).map(str::to_string),
        })
    }

    /// Create a fresh room under a generated id
    pub fn create(display_name: &str, password: Option<&str>) -> Result<Self, ClientError> {
        Self::new(&generate_room_id(), display_name, password)
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn into_message(self) -> ClientMessage {
        ClientMessage::JoinRoom {
            room_id: self.room_id,
            display_name: self.display_name,
            password: self.password,
        }
    }
}
