// ==============
// crates/backend-lib/src/metrics.rs

//! Central place for metric keys
pub const WS_CONNECTION: &str = "ws.connection";
pub const WS_ACTIVE: &str = "ws.active";
pub const ROOM_CREATED: &str = "room.created";
pub const ROOM_CLOSED: &str = "room.closed";
pub const ROOM_ACTIVE: &str = "room.active";
pub const ROOM_JOINED: &str = "room.joined";
pub const ROOM_JOIN_REJECTED: &str = "room.join_rejected";
pub const CHAT_MESSAGE: &str = "chat.message";
pub const SIGNAL_RELAYED: &str = "signal.relayed";
pub const SIGNAL_DROPPED: &str = "signal.dropped";
