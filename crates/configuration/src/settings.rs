use crate::error::ConfigError;
use serde::Deserialize;
use std::fmt;

/// Connection settings for the datastore server.
///
/// Loaded from `DB_HOST`, `DB_PORT`, `DB_USER` and `DB_PASSWORD`; the retry
/// knobs fall back to ten attempts, ten seconds apart.
#[derive(Clone, Deserialize)]
pub struct DatabaseSettings {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Total connection attempts per bootstrap phase.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Seconds to wait between two connection attempts.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

fn default_connect_attempts() -> u32 {
    10
}

fn default_retry_interval_secs() -> u64 {
    10
}

impl DatabaseSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.trim().is_empty() {
            return Err(ConfigError::ValidationError("DB_HOST must not be empty".to_string()));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::ValidationError("DB_USER must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError("DB_PORT must not be 0".to_string()));
        }
        if self.connect_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "DB_CONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            password: String::new(),
            connect_attempts: default_connect_attempts(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

impl fmt::Debug for DatabaseSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("connect_attempts", &self.connect_attempts)
            .field("retry_interval_secs", &self.retry_interval_secs)
            .finish()
    }
}
