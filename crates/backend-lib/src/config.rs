// ============================
// meshroom-backend/src/config.rs
// ============================
//! Configuration management.
use crate::error::AppError;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Default config file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "meshroom.toml";

/// Environment variable prefix, nested keys use `__`
pub const ENV_PREFIX: &str = "MESHROOM_";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Server bind address
    pub bind_addr: SocketAddr,
    /// Log level, overridden by `RUST_LOG`
    pub log_level: String,
    /// Emit logs as JSON lines
    pub log_json: bool,
    /// Chat messages kept per room
    pub chat_history_capacity: usize,
    /// Attach a permissive CORS layer to the HTTP API
    pub cors_permissive: bool,
    /// Lockout after repeated wrong room passwords
    pub join_lockout: JoinLockoutSettings,
    /// Argon2 cost parameters for room passwords
    pub password_hash: PasswordHashSettings,
}

/// Join lockout policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinLockoutSettings {
    pub max_failed_attempts: u32,
    pub lockout_secs: u64,
}

/// Argon2id parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordHashSettings {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            log_level: "info".to_string(),
            log_json: false,
            chat_history_capacity: 100,
            cors_permissive: true,
            join_lockout: JoinLockoutSettings::default(),
            password_hash: PasswordHashSettings::default(),
        }
    }
}

impl Default for JoinLockoutSettings {
    fn default() -> Self {
        Self {
            max_failed_attempts: 5,
            lockout_secs: 5 * 60,
        }
    }
}

impl Default for PasswordHashSettings {
    fn default() -> Self {
        Self {
            memory_kib: 19 * 1024,
            iterations: 2,
            parallelism: 1,
        }
    }
}

impl Settings {
    /// Layered provider: defaults, then the config file, then the environment
    pub fn figment(path: Option<&Path>) -> Figment {
        let file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Load and validate settings from the default locations
    pub fn load() -> Result<Self, AppError> {
        Self::load_from(None)
    }

    /// Load and validate settings, reading `path` instead of `meshroom.toml`
    pub fn load_from(path: Option<&Path>) -> Result<Self, AppError> {
        let settings: Settings = Self::figment(path).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject values the server cannot run with
    pub fn validate(&self) -> Result<(), AppError> {
        if !LOG_LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            return Err(AppError::Config(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        if self.chat_history_capacity == 0 {
            return Err(AppError::Config(
                "chat_history_capacity must be at least 1".to_string(),
            ));
        }
        if self.join_lockout.max_failed_attempts == 0 {
            return Err(AppError::Config(
                "join_lockout.max_failed_attempts must be at least 1".to_string(),
            ));
        }
        // argon2 requires at least 8 KiB of memory per lane
        let hash = &self.password_hash;
        if hash.iterations == 0
            || hash.parallelism == 0
            || hash.memory_kib < 8 * hash.parallelism
        {
            return Err(AppError::Config(
                "password_hash parameters are out of range".to_string(),
            ));
        }
        Ok(())
    }
}
