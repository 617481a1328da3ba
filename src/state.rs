//! Shared application state for the PaperMinder server

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::warn;
use uuid::Uuid;

use crate::config::Settings;
use crate::db::Database;
use crate::models::AuthToken;
use crate::registry::{ConnectionRegistry, SessionHandle};

/// Application state shared across handlers and background tasks
pub struct AppState {
    /// Durable storage
    pub db: Database,
    /// Live WebSocket sessions (ephemeral; authoritative for online view)
    pub registry: ConnectionRegistry,
    pub settings: Settings,
    /// Active authentication tokens (kept in-memory for performance)
    pub auth_tokens: RwLock<HashMap<String, AuthToken>>,
    /// Per-printer locks ordering daily-number assignment
    daily_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
    /// Server start time for uptime calculation
    pub start_time: u64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("db", &"<Database>")
            .field("settings", &self.settings)
            .field("start_time", &self.start_time)
            .finish()
    }
}

impl AppState {
    pub async fn new(settings: Settings) -> Result<Self> {
        let db = Database::new(&settings.database_url).await?;
        let registry = ConnectionRegistry::new(settings.send_timeout);

        Ok(Self {
            db,
            registry,
            settings,
            auth_tokens: RwLock::new(HashMap::new()),
            daily_locks: Mutex::new(HashMap::new()),
            start_time: now_secs(),
        })
    }

    /// State over an in-memory database (for testing)
    pub async fn new_in_memory() -> Result<Self> {
        let settings = Settings {
            database_url: "sqlite::memory:".to_string(),
            ..Settings::default()
        };
        Self::new(settings).await
    }

    // ── Session lifecycle ──

    /// Attach a session and, for printer identities, persist the online flag
    ///
    /// The persistence write is best-effort: the registry stays the
    /// authoritative view of connectivity.
    pub async fn attach_session(&self, identity: Uuid, tx: mpsc::Sender<String>) -> SessionHandle {
        let handle = self.registry.attach(identity, tx).await;

        match self.db.get_printer(identity).await {
            Ok(Some(_)) => {
                if let Err(e) = self.db.set_printer_online(identity, true).await {
                    warn!(printer = %identity, error = %e, "Failed to persist online state");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(identity = %identity, error = %e, "Printer lookup failed on attach"),
        }

        handle
    }

    /// Detach a session; the identity's last detach persists offline state
    pub async fn detach_session(&self, identity: Uuid, session_id: u64) {
        let last = self.registry.detach(identity, session_id).await;
        if !last {
            return;
        }

        match self.db.get_printer(identity).await {
            Ok(Some(_)) => {
                if let Err(e) = self.db.set_printer_online(identity, false).await {
                    warn!(printer = %identity, error = %e, "Failed to persist offline state");
                }
            }
            Ok(None) => {}
            Err(e) => warn!(identity = %identity, error = %e, "Printer lookup failed on detach"),
        }
    }

    /// Lock ordering daily-number assignment for one printer
    pub async fn daily_lock(&self, printer_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.daily_locks.lock().await;
        locks.entry(printer_id).or_default().clone()
    }

    // ── Authentication ──

    pub async fn register_user(
        &self,
        username: String,
        email: String,
        password: String,
    ) -> Result<Uuid, String> {
        match self.db.username_exists(&username).await {
            Ok(true) => return Err("Username already exists".to_string()),
            Err(e) => return Err(format!("Database error: {e}")),
            Ok(false) => {}
        }

        let digest = password_digest(&password);
        match self.db.create_user(&username, &email, &digest, false).await {
            Ok(user) => Ok(user.uuid),
            Err(e) => Err(format!("Failed to create user: {e}")),
        }
    }

    pub async fn authenticate_user(
        &self,
        username: String,
        password: String,
    ) -> Result<AuthToken, String> {
        let user = match self.db.get_user_by_username(&username).await {
            Ok(Some(user)) => user,
            Ok(None) => return Err("User not found".to_string()),
            Err(e) => return Err(format!("Database error: {e}")),
        };

        if !user.is_active {
            return Err("Account disabled".to_string());
        }
        if user.password_digest != password_digest(&password) {
            return Err("Invalid credentials".to_string());
        }

        let token = format!("tok_{}", Uuid::new_v4().simple());
        let auth_token = AuthToken {
            token: token.clone(),
            user_id: user.uuid,
            expires_at: now_secs() + 86400, // 24 hours
        };

        self.auth_tokens
            .write()
            .await
            .insert(token, auth_token.clone());

        if let Err(e) = self.db.set_user_last_login(user.uuid).await {
            warn!(user = %user.uuid, error = %e, "Failed to record login time");
        }

        Ok(auth_token)
    }

    /// Validate a bearer token; returns the user it belongs to
    pub async fn validate_token(&self, token: &str) -> Option<Uuid> {
        let auth_tokens = self.auth_tokens.read().await;
        let auth_token = auth_tokens.get(token)?;

        if auth_token.expires_at > now_secs() {
            Some(auth_token.user_id)
        } else {
            None
        }
    }

    /// Server uptime in seconds
    pub fn uptime(&self) -> u64 {
        now_secs() - self.start_time
    }
}

/// Shared application state type
pub type SharedState = Arc<AppState>;

/// Opaque digest for stored passwords
pub fn password_digest(password: &str) -> String {
    let digest = Sha256::digest(password.as_bytes());
    format!("{digest:x}")
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
