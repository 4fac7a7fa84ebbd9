// ============================
// crates/backend-lib/src/auth/rate_limit.rs
// ============================
//! Lockout for repeated wrong room passwords.

use crate::config::JoinLockoutSettings;
use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// How long a failure record without lockout is remembered
const FAILURE_MEMORY: Duration = Duration::from_secs(24 * 60 * 60);

/// Entry in the attempt map
#[derive(Debug, Clone)]
struct AttemptEntry {
    /// Consecutive wrong passwords
    failed_attempts: u32,
    last_failure: Instant,
    /// When the lockout expires, if one is active
    lockout_expiry: Option<Instant>,
}

/// Per-IP join lockout
#[derive(Debug, Clone)]
pub struct JoinRateLimiter {
    attempts: Arc<DashMap<IpAddr, AttemptEntry>>,
    max_attempts: u32,
    lockout_duration: Duration,
}

impl Default for JoinRateLimiter {
    fn default() -> Self {
        Self::from_settings(&JoinLockoutSettings::default())
    }
}

impl JoinRateLimiter {
    pub fn new(max_attempts: u32, lockout_duration: Duration) -> Self {
        Self {
            attempts: Arc::new(DashMap::new()),
            max_attempts,
            lockout_duration,
        }
    }

    pub fn from_settings(settings: &JoinLockoutSettings) -> Self {
        Self::new(
            settings.max_failed_attempts,
            Duration::from_secs(settings.lockout_secs),
        )
    }

    /// Record a wrong password from `ip`
    pub fn record_failed_attempt(&self, ip: IpAddr) {
        let now = Instant::now();

        let mut entry = self.attempts.entry(ip).or_insert_with(|| AttemptEntry {
            failed_attempts: 0,
            last_failure: now,
            lockout_expiry: None,
        });

        if entry.lockout_expiry.is_some_and(|expiry| now >= expiry) {
            entry.failed_attempts = 0;
            entry.lockout_expiry = None;
        }

        entry.failed_attempts += 1;
        entry.last_failure = now;

        if entry.failed_attempts >= self.max_attempts && entry.lockout_expiry.is_none() {
            entry.lockout_expiry = Some(now + self.lockout_duration);
            warn!(%ip, attempts = entry.failed_attempts, "locked out of room joins");
        }
    }

    /// A successful join clears the record
    pub fn record_success(&self, ip: IpAddr) {
        self.attempts.remove(&ip);
    }

    /// Whether `ip` may attempt a join right now
    pub fn check(&self, ip: IpAddr) -> bool {
        match self.attempts.get(&ip) {
            Some(entry) => entry
                .lockout_expiry
                .is_none_or(|expiry| Instant::now() >= expiry),
            None => true,
        }
    }

    /// Drop expired lockouts and stale failure records
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.attempts.retain(|_, entry| match entry.lockout_expiry {
            Some(expiry) => now < expiry,
            None => now.duration_since(entry.last_failure) < FAILURE_MEMORY,
        });
    }
}
