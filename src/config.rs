//! Server configuration loaded from the environment

use std::time::Duration;

const DEV_JWT_SECRET: &str = "paperminder-dev-secret";

#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub base_url: String,
    pub cors_allowed_origins: Vec<String>,
    pub max_firmware_size: usize,
    pub max_frame_size: usize,
    pub scheduler_interval: Duration,
    pub send_timeout: Duration,
    pub jwt_secret: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite:paperminder.db".to_string(),
            base_url: "http://localhost:8000".to_string(),
            cors_allowed_origins: vec!["*".to_string()],
            max_firmware_size: 5 * 1024 * 1024,
            max_frame_size: 64 * 1024,
            scheduler_interval: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            jwt_secret: DEV_JWT_SECRET.to_string(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(url) = std::env::var("DATABASE_URL") {
            if !url.is_empty() {
                config.database_url = url;
            }
        }

        if let Ok(url) = std::env::var("BASE_URL") {
            if !url.is_empty() {
                config.base_url = url.trim_end_matches('/').to_string();
            }
        }

        if let Ok(origins) = std::env::var("CORS_ALLOWED_ORIGINS") {
            let parsed: Vec<String> = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !parsed.is_empty() {
                config.cors_allowed_origins = parsed;
            }
        }

        if let Ok(val) = std::env::var("MAX_FIRMWARE_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_firmware_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_FIRMWARE_SIZE, using default"),
            }
        }

        if let Ok(val) = std::env::var("MAX_FRAME_SIZE") {
            match val.parse::<usize>() {
                Ok(n) if n > 0 => config.max_frame_size = n,
                _ => tracing::warn!(value = %val, "Invalid MAX_FRAME_SIZE, using default"),
            }
        }

        if let Ok(val) = std::env::var("SCHEDULER_INTERVAL_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.scheduler_interval = Duration::from_secs(n),
                _ => tracing::warn!(value = %val, "Invalid SCHEDULER_INTERVAL_SECS, using default"),
            }
        }

        if let Ok(val) = std::env::var("SEND_TIMEOUT_SECS") {
            match val.parse::<u64>() {
                Ok(n) if n > 0 => config.send_timeout = Duration::from_secs(n),
                _ => tracing::warn!(value = %val, "Invalid SEND_TIMEOUT_SECS, using default"),
            }
        }

        if let Ok(secret) = std::env::var("JWT_SECRET") {
            if !secret.is_empty() {
                config.jwt_secret = secret;
            }
        }
        if config.jwt_secret == DEV_JWT_SECRET {
            tracing::warn!("JWT_SECRET not set, using development default");
        }

        config
    }

    /// True when any origin is allowed
    pub fn cors_allow_any(&self) -> bool {
        self.cors_allowed_origins.iter().any(|o| o == "*")
    }
}
