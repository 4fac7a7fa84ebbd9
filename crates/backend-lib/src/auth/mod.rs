// ============================
// meshroom-backend/src/auth/mod.rs
// ============================
//! Room password gate: hashing and join-attempt lockout.

pub mod password;
pub mod rate_limit;

pub use password::{RoomPasswordHasher, RoomSecret};
pub use rate_limit::JoinRateLimiter;
