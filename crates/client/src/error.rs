// ============================
// meshroom-client/src/error.rs
// ============================
//! Error types for the mesh client.
use crate::session::SessionState;
use meshroom_common::validation::ValidationError;
use thiserror::Error;

/// Errors surfaced to the application
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Missing {0}")]
    MissingField(&'static str),

    #[error("Invalid input: {0}")]
    Validation(#[from] ValidationError),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Signaling channel closed")]
    ChannelClosed,

    #[error("Negotiation error: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("Media access error: {0}")]
    Media(#[from] MediaAccessError),
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ClientError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ClientError::ChannelClosed
    }
}

/// Negotiation problems. Logged and discarded, never shown to the user.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NegotiationError {
    #[error("cannot {action} in state {state}")]
    InvalidTransition {
        state: SessionState,
        action: &'static str,
    },

    #[error("{kind} arrived out of window in state {state}")]
    OutOfWindow {
        kind: &'static str,
        state: SessionState,
    },

    #[error("malformed {kind} payload: {reason}")]
    MalformedPayload { kind: &'static str, reason: String },

    #[error("transport primitive failed: {0}")]
    Transport(String),
}

/// Camera/microphone/screen acquisition failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAccessError {
    #[error("permission denied")]
    Denied,

    #[error("no {0} device available")]
    Unavailable(&'static str),

    #[error("media request timed out")]
    Timeout,

    #[error("{0}")]
    Other(String),
}
