//! Application configuration

use std::env;

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Authentication
    pub jwt_secret: String,
    pub bypass_token_ttl_minutes: i64,
    pub chat_token_ttl_minutes: i64,
    pub agent_token_ttl_hours: i64,

    // Queue admission
    pub rate_limit_window_minutes: i64,
    pub rate_limit_max_joins: u32,
    pub assign_interval_seconds: u64,

    // Presence
    pub heartbeat_timeout_seconds: i64,
    pub agent_session_capacity: usize,

    // Sessions
    pub session_grace_seconds: u64,
    pub message_max_chars: usize,

    // Uploads
    pub upload_max_bytes: usize,
    pub blob_timeout_seconds: u64,
    pub blob_store_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Authentication
            jwt_secret: {
                let secret =
                    env::var("JWT_SECRET").map_err(|_| ConfigError::Missing("JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            bypass_token_ttl_minutes: env_parse("BYPASS_TOKEN_TTL_MINUTES", 10),
            chat_token_ttl_minutes: env_parse("CHAT_TOKEN_TTL_MINUTES", 2),
            agent_token_ttl_hours: env_parse("AGENT_TOKEN_TTL_HOURS", 24),

            // Queue admission
            rate_limit_window_minutes: env_parse("RATE_LIMIT_WINDOW_MINUTES", 10),
            rate_limit_max_joins: env_parse("RATE_LIMIT_MAX_JOINS", 3),
            assign_interval_seconds: env_parse("ASSIGN_INTERVAL_SECONDS", 2),

            // Presence
            heartbeat_timeout_seconds: env_parse("HEARTBEAT_TIMEOUT_SECONDS", 60),
            agent_session_capacity: env_parse("AGENT_SESSION_CAPACITY", 5),

            // Sessions
            session_grace_seconds: env_parse("SESSION_GRACE_SECONDS", 30),
            message_max_chars: env_parse("MESSAGE_MAX_CHARS", 1024),

            // Uploads
            upload_max_bytes: env_parse("UPLOAD_MAX_BYTES", 2_000_000),
            blob_timeout_seconds: env_parse("BLOB_TIMEOUT_SECONDS", 10),
            blob_store_url: env::var("BLOB_STORE_URL").ok(),
        })
    }
}

/// Parse an env var with a fallback default
fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure config tests run serially (they modify shared env vars)
    static CONFIG_TEST_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_jwt_secret_validation() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        env::remove_var("JWT_SECRET");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::Missing("JWT_SECRET"))));

        env::set_var("JWT_SECRET", "too-short");
        let result = Config::from_env();
        assert!(matches!(result, Err(ConfigError::WeakSecret(_))));

        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        let config = Config::from_env().unwrap();
        assert_eq!(config.upload_max_bytes, 2_000_000);
        assert_eq!(config.rate_limit_max_joins, 3);
        assert_eq!(config.session_grace_seconds, 30);

        env::remove_var("JWT_SECRET");
    }

    #[test]
    fn test_tunable_overrides() {
        let _lock = CONFIG_TEST_MUTEX.lock().unwrap();

        env::set_var(
            "JWT_SECRET",
            "test-jwt-secret-must-be-at-least-32-characters-long",
        );
        env::set_var("AGENT_SESSION_CAPACITY", "2");
        env::set_var("UPLOAD_MAX_BYTES", "1000");

        let config = Config::from_env().unwrap();
        assert_eq!(config.agent_session_capacity, 2);
        assert_eq!(config.upload_max_bytes, 1000);

        env::remove_var("JWT_SECRET");
        env::remove_var("AGENT_SESSION_CAPACITY");
        env::remove_var("UPLOAD_MAX_BYTES");
    }
}
