// ============================
// common/src/validation.rs
// ============================
//! Input validation shared by the client (before any network call) and the server.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

pub const MAX_ROOM_ID_LENGTH: usize = 64;
pub const MAX_DISPLAY_NAME_LENGTH: usize = 50;
pub const MAX_CHAT_LENGTH: usize = 2000;

static ROOM_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("static regex"));

/// Possible validation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Invalid room ID: {0}")]
    InvalidRoomId(String),

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),

    #[error("Invalid chat message: {0}")]
    InvalidChatMessage(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a room ID
pub fn validate_room_id(room_id: &str) -> ValidationResult<&str> {
    if room_id.is_empty() {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must not be empty".to_string(),
        ));
    }

    if room_id.len() > MAX_ROOM_ID_LENGTH {
        return Err(ValidationError::InvalidRoomId(format!(
            "Room ID must be at most {MAX_ROOM_ID_LENGTH} characters"
        )));
    }

    if !ROOM_ID_REGEX.is_match(room_id) {
        return Err(ValidationError::InvalidRoomId(
            "Room ID must contain only letters, digits, '-' and '_'".to_string(),
        ));
    }

    Ok(room_id)
}

/// Validate a display name, returning it trimmed
pub fn validate_display_name(name: &str) -> ValidationResult<&str> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::InvalidDisplayName(
            "Display name must not be empty".to_string(),
        ));
    }

    if name.chars().count() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ValidationError::InvalidDisplayName(format!(
            "Display name must be at most {MAX_DISPLAY_NAME_LENGTH} characters"
        )));
    }

    if name.chars().any(char::is_control) {
        return Err(ValidationError::InvalidDisplayName(
            "Display name contains control characters".to_string(),
        ));
    }

    Ok(name)
}

/// Validate chat content, returning it trimmed
pub fn validate_chat_content(content: &str) -> ValidationResult<&str> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ValidationError::InvalidChatMessage(
            "Message must not be empty".to_string(),
        ));
    }

    if content.chars().count() > MAX_CHAT_LENGTH {
        return Err(ValidationError::InvalidChatMessage(format!(
            "Message must be at most {MAX_CHAT_LENGTH} characters"
        )));
    }

    Ok(content)
}
