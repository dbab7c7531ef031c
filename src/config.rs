//! Environment-driven configuration, loaded once at process start.

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub database_url: String,
    pub oauth_appid: String,
    pub oauth_secret: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_user: String,
    pub smtp_password: String,
    pub jwt_signing_key: String,
    /// Role id treated as administrative for C4's "administrative role
    /// defined by configuration" override.
    pub admin_role_id: i64,
    /// Seconds a requester must wait between successive urges on the same
    /// work order. The original service hardcodes 600.
    pub urge_cooldown_secs: i64,
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        #[cfg(feature = "server")]
        dotenvy::dotenv().ok();

        Ok(EngineConfig {
            database_url: require_env("DATABASE_URL")?,
            oauth_appid: env_or("OAUTH_APPID", ""),
            oauth_secret: env_or("OAUTH_SECRET", ""),
            smtp_host: env_or("SMTP_HOST", ""),
            smtp_port: env_or("SMTP_PORT", "587")
                .parse()
                .map_err(|_| EngineError::BadInput("SMTP_PORT must be a u16".into()))?,
            smtp_user: env_or("SMTP_USER", ""),
            smtp_password: env_or("SMTP_PASSWORD", ""),
            jwt_signing_key: require_env("JWT_SIGNING_KEY")?,
            admin_role_id: env_or("ADMIN_ROLE_ID", "1")
                .parse()
                .map_err(|_| EngineError::BadInput("ADMIN_ROLE_ID must be an i64".into()))?,
            urge_cooldown_secs: env_or("URGE_COOLDOWN_SECS", "600")
                .parse()
                .map_err(|_| EngineError::BadInput("URGE_COOLDOWN_SECS must be an i64".into()))?,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn require_env(key: &str) -> EngineResult<String> {
    std::env::var(key).map_err(|_| EngineError::BadInput(format!("missing required env var {key}")))
}
