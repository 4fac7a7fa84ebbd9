// ============================
// meshroom-backend/src/lib.rs
// ============================
//! Room coordination and signaling relay for `meshroom` mesh calls.

pub mod auth;
pub mod config;
pub mod connections;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod relay;
pub mod room;
pub mod room_actor;
pub mod websocket;
pub mod ws_router;

use crate::auth::{JoinRateLimiter, RoomPasswordHasher};
use crate::config::Settings;
use crate::connections::ConnectionMap;
use crate::error::AppError;
use crate::registry::SessionRegistry;
use crate::relay::SignalRelay;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// How often expired join lockouts are swept
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Loaded settings
    pub settings: Arc<Settings>,
    /// Outbound channel of every connected peer
    pub connections: ConnectionMap,
    /// Live rooms
    pub registry: SessionRegistry,
    /// Offer/answer/candidate forwarding
    pub relay: SignalRelay,
    /// Wrong-password lockout
    pub join_limiter: JoinRateLimiter,
}

impl AppState {
    /// Create a new application state
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        settings.validate()?;
        let connections = ConnectionMap::new();
        let hasher = RoomPasswordHasher::new(&settings.password_hash)?;
        let registry = SessionRegistry::new(
            connections.clone(),
            hasher,
            settings.chat_history_capacity,
        );
        let relay = SignalRelay::new(connections.clone());
        let join_limiter = JoinRateLimiter::from_settings(&settings.join_lockout);

        Ok(Self {
            settings: Arc::new(settings),
            connections,
            registry,
            relay,
            join_limiter,
        })
    }

    /// Spawn the periodic lockout sweep
    pub fn spawn_maintenance(&self) -> JoinHandle<()> {
        let limiter = self.join_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            loop {
                interval.tick().await;
                limiter.cleanup();
            }
        })
    }
}
