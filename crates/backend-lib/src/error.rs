// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use meshroom_common::validation::ValidationError;
use thiserror::Error;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Incorrect room password")]
    IncorrectPassword,

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    /// The room actor emptied and shut down while a command was in flight
    #[error("Room closed: {0}")]
    RoomClosed(String),

    #[error("Peer {peer_id} is not a member of room {room_id}")]
    NotAMember { peer_id: String, room_id: String },

    #[error("Invalid input: {0}")]
    InvalidInput(#[from] ValidationError),

    #[error("Password hashing error: {0}")]
    PasswordHash(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::IncorrectPassword => StatusCode::UNAUTHORIZED,
            AppError::RoomNotFound(_) | AppError::RoomClosed(_) => StatusCode::NOT_FOUND,
            AppError::NotAMember { .. } => StatusCode::FORBIDDEN,
            AppError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            AppError::PasswordHash(_) | AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::IncorrectPassword => "AUTH_001",
            AppError::RoomNotFound(_) => "ROOM_001",
            AppError::RoomClosed(_) => "ROOM_002",
            AppError::NotAMember { .. } => "ROOM_003",
            AppError::InvalidInput(_) => "VAL_001",
            AppError::PasswordHash(_) => "AUTH_003",
            AppError::Config(_) => "CFG_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::IncorrectPassword | AppError::PasswordHash(_) => {
                "Authentication failed".to_string()
            },
            AppError::RoomNotFound(_) | AppError::RoomClosed(_) => {
                "Resource not found".to_string()
            },
            AppError::NotAMember { .. } => "Not a member of this room".to_string(),
            AppError::InvalidInput(_) => "Invalid input provided".to_string(),
            AppError::Config(_) => "An internal server error occurred".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let error_code = self.error_code();

        // Use detailed messages in development, sanitized in production
        let message = if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        };

        let body = serde_json::json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl From<argon2::password_hash::Error> for AppError {
    fn from(err: argon2::password_hash::Error) -> Self {
        AppError::PasswordHash(err.to_string())
    }
}

impl From<figment::Error> for AppError {
    fn from(err: figment::Error) -> Self {
        AppError::Config(err.to_string())
    }
}
