//! Database layer for the PaperMinder server using SQLite
//!
//! Provides persistent storage for users, printers, message logs, the
//! offline message cache, firmware binaries, rollouts, and update history.
//! The pool is the only writer to persistent state; callers read, mutate,
//! and write back within single statements or short transactions.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{
    CachedMessage, FirmwareMeta, MessageLogEntry, Printer, RolloutStatus, RolloutTargets,
    RolloutType, UpdateChannel, UpdateHistoryEntry, UpdateRollout, UpdateStatus, User,
};

/// Database connection pool and operations
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Connect to the database named by a sqlite URL (e.g. `sqlite:pm.db`,
    /// `sqlite::memory:`), creating the file and schema when missing
    pub async fn new(database_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("Invalid database URL: {database_url}"))?
            .create_if_missing(true);

        // An in-memory database exists per connection, so the pool must not
        // grow past the connection that created the schema
        let pool = if database_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(options)
                .await
        } else {
            SqlitePool::connect_with(options).await
        }
        .context("Failed to connect to SQLite database")?;

        let db = Self { pool };
        db.run_migrations().await?;
        Ok(db)
    }

    /// In-memory database for tests
    pub async fn new_in_memory() -> Result<Self> {
        Self::new("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                uuid TEXT PRIMARY KEY NOT NULL,
                username TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL,
                password_digest TEXT NOT NULL,
                is_admin INTEGER NOT NULL DEFAULT 0,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                last_login_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create users table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS printers (
                uuid TEXT PRIMARY KEY NOT NULL,
                user_uuid TEXT,
                name TEXT NOT NULL,
                platform TEXT,
                firmware_version TEXT NOT NULL DEFAULT '0.0.0',
                auto_update INTEGER NOT NULL DEFAULT 1,
                update_channel TEXT NOT NULL DEFAULT 'stable',
                online INTEGER NOT NULL DEFAULT 0,
                last_connected TEXT,
                daily_message_number INTEGER NOT NULL DEFAULT 0,
                daily_counter_date TEXT,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create printers table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                sender_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                body TEXT NOT NULL,
                daily_number INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create message_logs table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS message_cache (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                recipient_id TEXT NOT NULL,
                sender_id TEXT NOT NULL,
                sender_name TEXT NOT NULL,
                body TEXT NOT NULL,
                daily_number INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                is_delivered INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create message_cache table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS firmware_versions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL,
                platform TEXT NOT NULL,
                channel TEXT NOT NULL,
                data BLOB NOT NULL,
                size INTEGER NOT NULL,
                md5 TEXT NOT NULL,
                sha256 TEXT NOT NULL,
                release_notes TEXT,
                mandatory INTEGER NOT NULL DEFAULT 0,
                min_upgrade_version TEXT,
                download_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                released_at TEXT NOT NULL,
                deprecated_at TEXT,
                UNIQUE (version, platform)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create firmware_versions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS update_rollouts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                version TEXT NOT NULL,
                target_all INTEGER NOT NULL DEFAULT 0,
                target_user_ids TEXT,
                target_printer_ids TEXT,
                target_channels TEXT,
                min_version TEXT,
                max_version TEXT,
                rollout_type TEXT NOT NULL,
                rollout_percentage INTEGER NOT NULL DEFAULT 100,
                scheduled_for TEXT,
                status TEXT NOT NULL DEFAULT 'pending',
                total_targets INTEGER NOT NULL DEFAULT 0,
                completed_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                declined_count INTEGER NOT NULL DEFAULT 0,
                pending_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create update_rollouts table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS update_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                rollout_id INTEGER,
                printer_id TEXT NOT NULL,
                version TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                last_percent INTEGER NOT NULL DEFAULT 0,
                last_status_message TEXT,
                error_message TEXT,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                FOREIGN KEY (rollout_id) REFERENCES update_rollouts (id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create update_history table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_printers_user ON printers (user_uuid)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_logs_recipient ON message_logs (recipient_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_message_cache_recipient ON message_cache (recipient_id, is_delivered)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_firmware_version ON firmware_versions (version)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_rollouts_status ON update_rollouts (status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_update_history_printer ON update_history (printer_id, status)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_update_history_rollout ON update_history (rollout_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ── User operations ──

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        password_digest: &str,
        is_admin: bool,
    ) -> Result<User> {
        let user_uuid = Uuid::new_v4();
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO users (uuid, username, email, password_digest, is_admin, is_active, created_at) \
             VALUES (?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(user_uuid.to_string())
        .bind(username)
        .bind(email)
        .bind(password_digest)
        .bind(is_admin)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert user")?;

        Ok(User {
            uuid: user_uuid,
            username: username.to_string(),
            email: email.to_string(),
            password_digest: password_digest.to_string(),
            is_admin,
            is_active: true,
            created_at,
            last_login_at: None,
        })
    }

    pub async fn get_user(&self, user_uuid: Uuid) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE uuid = ?")
            .bind(user_uuid.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn get_user_by_username(&self, username: &str) -> Result<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query user by username")?;

        row.map(|r| parse_user(&r)).transpose()
    }

    pub async fn username_exists(&self, username: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM users WHERE username = ?")
            .bind(username)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn set_user_last_login(&self, user_uuid: Uuid) -> Result<()> {
        sqlx::query("UPDATE users SET last_login_at = ? WHERE uuid = ?")
            .bind(Utc::now())
            .bind(user_uuid.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update last login")?;
        Ok(())
    }

    // ── Printer operations ──

    pub async fn register_printer(
        &self,
        printer_uuid: Uuid,
        name: &str,
        platform: Option<&str>,
        user_uuid: Option<Uuid>,
    ) -> Result<Printer> {
        let created_at = Utc::now();

        sqlx::query(
            "INSERT INTO printers (uuid, user_uuid, name, platform, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(printer_uuid.to_string())
        .bind(user_uuid.map(|u| u.to_string()))
        .bind(name)
        .bind(platform)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert printer")?;

        Ok(Printer {
            uuid: printer_uuid,
            user_uuid,
            name: name.to_string(),
            platform: platform.map(|p| p.to_string()),
            firmware_version: "0.0.0".to_string(),
            auto_update: true,
            update_channel: UpdateChannel::Stable,
            online: false,
            last_connected: None,
            daily_message_number: 0,
            daily_counter_date: None,
            created_at,
        })
    }

    pub async fn get_printer(&self, printer_uuid: Uuid) -> Result<Option<Printer>> {
        let row = sqlx::query("SELECT * FROM printers WHERE uuid = ?")
            .bind(printer_uuid.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query printer")?;

        row.map(|r| parse_printer(&r)).transpose()
    }

    pub async fn list_printers(&self) -> Result<Vec<Printer>> {
        let rows = sqlx::query("SELECT * FROM printers ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list printers")?;

        rows.iter().map(parse_printer).collect()
    }

    /// Apply the fields a printer announces on subscription
    pub async fn update_printer_subscription(
        &self,
        printer_uuid: Uuid,
        name: &str,
        platform: Option<&str>,
        firmware_version: &str,
        auto_update: bool,
        update_channel: UpdateChannel,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE printers SET name = ?, platform = ?, firmware_version = ?, auto_update = ?, \
             update_channel = ? WHERE uuid = ?",
        )
        .bind(name)
        .bind(platform)
        .bind(firmware_version)
        .bind(auto_update)
        .bind(update_channel.as_str())
        .bind(printer_uuid.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update printer subscription info")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_printer_online(&self, printer_uuid: Uuid, online: bool) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE printers SET online = ?, last_connected = ? WHERE uuid = ?",
        )
        .bind(online)
        .bind(Utc::now())
        .bind(printer_uuid.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to update printer online state")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_printer_auto_update(&self, printer_uuid: Uuid, auto_update: bool) -> Result<()> {
        sqlx::query("UPDATE printers SET auto_update = ? WHERE uuid = ?")
            .bind(auto_update)
            .bind(printer_uuid.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update printer auto_update flag")?;
        Ok(())
    }

    pub async fn set_printer_firmware_version(&self, printer_uuid: Uuid, version: &str) -> Result<()> {
        sqlx::query("UPDATE printers SET firmware_version = ? WHERE uuid = ?")
            .bind(version)
            .bind(printer_uuid.to_string())
            .execute(&self.pool)
            .await
            .context("Failed to update printer firmware version")?;
        Ok(())
    }

    /// Assign the next daily message number for a printer
    ///
    /// Resets the counter when the stored counter date differs from `today`.
    /// The caller must hold the per-printer counter lock; this function only
    /// performs the storage round-trip.
    pub async fn assign_daily_number(&self, printer_uuid: Uuid, today: NaiveDate) -> Result<i64> {
        let row = sqlx::query(
            "SELECT daily_message_number, daily_counter_date FROM printers WHERE uuid = ?",
        )
        .bind(printer_uuid.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read daily counter")?
        .with_context(|| format!("Printer {printer_uuid} not found"))?;

        let current: i64 = row.get("daily_message_number");
        let counter_date: Option<NaiveDate> = row.get("daily_counter_date");

        let next = if counter_date == Some(today) { current + 1 } else { 1 };

        sqlx::query(
            "UPDATE printers SET daily_message_number = ?, daily_counter_date = ? WHERE uuid = ?",
        )
        .bind(next)
        .bind(today)
        .bind(printer_uuid.to_string())
        .execute(&self.pool)
        .await
        .context("Failed to write daily counter")?;

        Ok(next)
    }

    // ── Message log and cache ──

    pub async fn insert_message_log(
        &self,
        sender_id: &str,
        sender_name: &str,
        recipient_id: Uuid,
        body: &str,
        daily_number: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO message_logs (sender_id, sender_name, recipient_id, body, daily_number, created_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(sender_id)
        .bind(sender_name)
        .bind(recipient_id.to_string())
        .bind(body)
        .bind(daily_number)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to insert message log")?;

        Ok(result.last_insert_rowid())
    }

    /// Most recent log entries for messages addressed to a printer
    pub async fn messages_for_printer(
        &self,
        recipient_id: Uuid,
        limit: i64,
    ) -> Result<Vec<MessageLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM message_logs WHERE recipient_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(recipient_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query message log")?;

        rows.iter().map(parse_message_log).collect()
    }

    pub async fn cache_message(
        &self,
        recipient_id: Uuid,
        sender_id: &str,
        sender_name: &str,
        body: &str,
        daily_number: i64,
    ) -> Result<i64> {
        let result = sqlx::query(
            "INSERT INTO message_cache (recipient_id, sender_id, sender_name, body, daily_number, created_at, is_delivered) \
             VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(recipient_id.to_string())
        .bind(sender_id)
        .bind(sender_name)
        .bind(body)
        .bind(daily_number)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .context("Failed to cache message")?;

        Ok(result.last_insert_rowid())
    }

    /// Undelivered cache rows for a recipient, in insertion order
    pub async fn undelivered_cached_messages(&self, recipient_id: Uuid) -> Result<Vec<CachedMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM message_cache WHERE recipient_id = ? AND is_delivered = 0 ORDER BY id",
        )
        .bind(recipient_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("Failed to query cached messages")?;

        rows.iter().map(parse_cached_message).collect()
    }

    pub async fn mark_cache_delivered(&self, cache_id: i64) -> Result<()> {
        sqlx::query("UPDATE message_cache SET is_delivered = 1 WHERE id = ?")
            .bind(cache_id)
            .execute(&self.pool)
            .await
            .context("Failed to mark cached message delivered")?;
        Ok(())
    }

    /// Delete delivered cache rows older than the cutoff; returns rows removed
    pub async fn clear_delivered_cache_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM message_cache WHERE is_delivered = 1 AND created_at < ?",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to clear old cached messages")?;

        Ok(result.rows_affected())
    }

    // ── Firmware operations ──

    #[allow(clippy::too_many_arguments)]
    pub async fn insert_firmware(
        &self,
        version: &str,
        platform: &str,
        channel: UpdateChannel,
        data: &[u8],
        md5: &str,
        sha256: &str,
        release_notes: Option<&str>,
        mandatory: bool,
        min_upgrade_version: Option<&str>,
    ) -> Result<FirmwareMeta> {
        let released_at = Utc::now();

        let result = sqlx::query(
            "INSERT INTO firmware_versions \
             (version, platform, channel, data, size, md5, sha256, release_notes, mandatory, min_upgrade_version, released_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(version)
        .bind(platform)
        .bind(channel.as_str())
        .bind(data)
        .bind(data.len() as i64)
        .bind(md5)
        .bind(sha256)
        .bind(release_notes)
        .bind(mandatory)
        .bind(min_upgrade_version)
        .bind(released_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert firmware version")?;

        Ok(FirmwareMeta {
            id: result.last_insert_rowid(),
            version: version.to_string(),
            platform: platform.to_string(),
            channel,
            size: data.len() as i64,
            md5: md5.to_string(),
            sha256: sha256.to_string(),
            release_notes: release_notes.map(|s| s.to_string()),
            mandatory,
            min_upgrade_version: min_upgrade_version.map(|s| s.to_string()),
            download_count: 0,
            success_count: 0,
            failure_count: 0,
            released_at,
            deprecated_at: None,
        })
    }

    /// True when any platform build exists for a version
    pub async fn firmware_version_exists(&self, version: &str) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM firmware_versions WHERE version = ?")
            .bind(version)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    pub async fn firmware_exists(&self, version: &str, platform: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) as count FROM firmware_versions WHERE version = ? AND platform = ?",
        )
        .bind(version)
        .bind(platform)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("count") > 0)
    }

    /// Firmware metadata for a version, probing each platform spelling in order
    pub async fn get_firmware_meta(
        &self,
        version: &str,
        platforms: &[String],
    ) -> Result<Option<FirmwareMeta>> {
        for platform in platforms {
            let row = sqlx::query(
                "SELECT id, version, platform, channel, size, md5, sha256, release_notes, mandatory, \
                 min_upgrade_version, download_count, success_count, failure_count, released_at, deprecated_at \
                 FROM firmware_versions WHERE version = ? AND platform = ?",
            )
            .bind(version)
            .bind(platform)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query firmware version")?;

            if let Some(row) = row {
                return parse_firmware_meta(&row).map(Some);
            }
        }
        Ok(None)
    }

    /// Firmware binary plus metadata, probing platform spellings in order
    pub async fn get_firmware_blob(
        &self,
        version: &str,
        platforms: &[String],
    ) -> Result<Option<(FirmwareMeta, Vec<u8>)>> {
        for platform in platforms {
            let row = sqlx::query("SELECT * FROM firmware_versions WHERE version = ? AND platform = ?")
                .bind(version)
                .bind(platform)
                .fetch_optional(&self.pool)
                .await
                .context("Failed to query firmware blob")?;

            if let Some(row) = row {
                let meta = parse_firmware_meta(&row)?;
                let data: Vec<u8> = row.get("data");
                return Ok(Some((meta, data)));
            }
        }
        Ok(None)
    }

    pub async fn list_firmware(&self, channel: Option<UpdateChannel>) -> Result<Vec<FirmwareMeta>> {
        let rows = match channel {
            Some(channel) => {
                sqlx::query(
                    "SELECT id, version, platform, channel, size, md5, sha256, release_notes, mandatory, \
                     min_upgrade_version, download_count, success_count, failure_count, released_at, deprecated_at \
                     FROM firmware_versions WHERE channel = ? ORDER BY released_at DESC",
                )
                .bind(channel.as_str())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query(
                    "SELECT id, version, platform, channel, size, md5, sha256, release_notes, mandatory, \
                     min_upgrade_version, download_count, success_count, failure_count, released_at, deprecated_at \
                     FROM firmware_versions ORDER BY released_at DESC",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("Failed to list firmware versions")?;

        rows.iter().map(parse_firmware_meta).collect()
    }

    pub async fn increment_firmware_download(&self, firmware_id: i64) -> Result<()> {
        sqlx::query("UPDATE firmware_versions SET download_count = download_count + 1 WHERE id = ?")
            .bind(firmware_id)
            .execute(&self.pool)
            .await
            .context("Failed to increment download count")?;
        Ok(())
    }

    pub async fn increment_firmware_success(&self, version: &str, platforms: &[String]) -> Result<()> {
        if let Some(meta) = self.get_firmware_meta(version, platforms).await? {
            sqlx::query("UPDATE firmware_versions SET success_count = success_count + 1 WHERE id = ?")
                .bind(meta.id)
                .execute(&self.pool)
                .await
                .context("Failed to increment success count")?;
        }
        Ok(())
    }

    pub async fn increment_firmware_failure(&self, version: &str, platforms: &[String]) -> Result<()> {
        if let Some(meta) = self.get_firmware_meta(version, platforms).await? {
            sqlx::query("UPDATE firmware_versions SET failure_count = failure_count + 1 WHERE id = ?")
                .bind(meta.id)
                .execute(&self.pool)
                .await
                .context("Failed to increment failure count")?;
        }
        Ok(())
    }

    // ── Rollout operations ──

    pub async fn create_rollout(
        &self,
        version: &str,
        targets: &RolloutTargets,
        rollout_type: RolloutType,
        rollout_percentage: i64,
        scheduled_for: Option<DateTime<Utc>>,
        total_targets: i64,
    ) -> Result<UpdateRollout> {
        let now = Utc::now();
        let user_ids_json = ids_to_json(&targets.user_ids)?;
        let printer_ids_json = ids_to_json(&targets.printer_ids)?;
        let channels_json = channels_to_json(&targets.channels)?;

        let result = sqlx::query(
            "INSERT INTO update_rollouts \
             (version, target_all, target_user_ids, target_printer_ids, target_channels, min_version, max_version, \
              rollout_type, rollout_percentage, scheduled_for, status, total_targets, pending_count, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)",
        )
        .bind(version)
        .bind(targets.all)
        .bind(&user_ids_json)
        .bind(&printer_ids_json)
        .bind(&channels_json)
        .bind(&targets.min_version)
        .bind(&targets.max_version)
        .bind(rollout_type.as_str())
        .bind(rollout_percentage)
        .bind(scheduled_for)
        .bind(total_targets)
        .bind(total_targets)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("Failed to insert rollout")?;

        Ok(UpdateRollout {
            id: result.last_insert_rowid(),
            version: version.to_string(),
            targets: targets.clone(),
            rollout_type,
            rollout_percentage,
            scheduled_for,
            status: RolloutStatus::Pending,
            total_targets,
            completed_count: 0,
            failed_count: 0,
            declined_count: 0,
            pending_count: total_targets,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn get_rollout(&self, rollout_id: i64) -> Result<Option<UpdateRollout>> {
        let row = sqlx::query("SELECT * FROM update_rollouts WHERE id = ?")
            .bind(rollout_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to query rollout")?;

        row.map(|r| parse_rollout(&r)).transpose()
    }

    pub async fn list_rollouts(&self) -> Result<Vec<UpdateRollout>> {
        let rows = sqlx::query("SELECT * FROM update_rollouts ORDER BY created_at DESC")
            .fetch_all(&self.pool)
            .await
            .context("Failed to list rollouts")?;

        rows.iter().map(parse_rollout).collect()
    }

    pub async fn list_rollouts_by_status(&self, status: RolloutStatus) -> Result<Vec<UpdateRollout>> {
        let rows = sqlx::query("SELECT * FROM update_rollouts WHERE status = ? ORDER BY created_at DESC")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await
            .context("Failed to list rollouts by status")?;

        rows.iter().map(parse_rollout).collect()
    }

    pub async fn set_rollout_status(&self, rollout_id: i64, status: RolloutStatus) -> Result<bool> {
        let result = sqlx::query("UPDATE update_rollouts SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(rollout_id)
            .execute(&self.pool)
            .await
            .context("Failed to update rollout status")?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn set_rollout_percentage(&self, rollout_id: i64, percentage: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE update_rollouts SET rollout_percentage = ?, updated_at = ? WHERE id = ?",
        )
        .bind(percentage)
        .bind(Utc::now())
        .bind(rollout_id)
        .execute(&self.pool)
        .await
        .context("Failed to update rollout percentage")?;

        Ok(result.rows_affected() > 0)
    }

    /// Activate pending scheduled rollouts whose start time has passed;
    /// returns the activated rollout IDs
    pub async fn activate_due_rollouts(&self, now: DateTime<Utc>) -> Result<Vec<i64>> {
        let rows = sqlx::query(
            "SELECT id FROM update_rollouts WHERE status = 'pending' \
             AND scheduled_for IS NOT NULL AND scheduled_for <= ?",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query due rollouts")?;

        let ids: Vec<i64> = rows.iter().map(|r| r.get("id")).collect();
        for id in &ids {
            self.set_rollout_status(*id, RolloutStatus::Active).await?;
        }
        Ok(ids)
    }

    /// Move one pending attempt into a terminal outcome column
    ///
    /// Applies `outcome_count += 1, pending_count -= 1` atomically. Returns
    /// the rollout's remaining pending count.
    pub async fn record_rollout_outcome(
        &self,
        rollout_id: i64,
        outcome: UpdateStatus,
    ) -> Result<Option<i64>> {
        let column = match outcome {
            UpdateStatus::Completed => "completed_count",
            UpdateStatus::Failed => "failed_count",
            UpdateStatus::Declined => "declined_count",
            _ => return Ok(None),
        };

        sqlx::query(&format!(
            "UPDATE update_rollouts SET {column} = {column} + 1, \
             pending_count = MAX(pending_count - 1, 0), updated_at = ? WHERE id = ?",
        ))
        .bind(Utc::now())
        .bind(rollout_id)
        .execute(&self.pool)
        .await
        .context("Failed to record rollout outcome")?;

        let row = sqlx::query("SELECT pending_count FROM update_rollouts WHERE id = ?")
            .bind(rollout_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("pending_count")))
    }

    // ── Update history operations ──

    pub async fn create_update_attempt(
        &self,
        rollout_id: Option<i64>,
        printer_id: Uuid,
        version: &str,
    ) -> Result<UpdateHistoryEntry> {
        let started_at = Utc::now();

        let result = sqlx::query(
            "INSERT INTO update_history (rollout_id, printer_id, version, status, started_at) \
             VALUES (?, ?, ?, 'pending', ?)",
        )
        .bind(rollout_id)
        .bind(printer_id.to_string())
        .bind(version)
        .bind(started_at)
        .execute(&self.pool)
        .await
        .context("Failed to insert update attempt")?;

        Ok(UpdateHistoryEntry {
            id: result.last_insert_rowid(),
            rollout_id,
            printer_id,
            version: version.to_string(),
            status: UpdateStatus::Pending,
            last_percent: 0,
            last_status_message: None,
            error_message: None,
            started_at,
            completed_at: None,
        })
    }

    /// Most recent attempt for a rollout+printer pair, regardless of status
    pub async fn latest_attempt_for_rollout(
        &self,
        rollout_id: i64,
        printer_id: Uuid,
    ) -> Result<Option<UpdateHistoryEntry>> {
        let row = sqlx::query(
            "SELECT * FROM update_history WHERE rollout_id = ? AND printer_id = ? ORDER BY id DESC LIMIT 1",
        )
        .bind(rollout_id)
        .bind(printer_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query update attempt")?;

        row.map(|r| parse_history(&r)).transpose()
    }

    /// Most recent non-terminal attempt for a printer
    pub async fn latest_active_attempt(&self, printer_id: Uuid) -> Result<Option<UpdateHistoryEntry>> {
        let row = sqlx::query(
            "SELECT * FROM update_history WHERE printer_id = ? \
             AND status IN ('pending', 'downloading') ORDER BY id DESC LIMIT 1",
        )
        .bind(printer_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query active update attempt")?;

        row.map(|r| parse_history(&r)).transpose()
    }

    /// Record a progress report against the most recent non-terminal attempt
    pub async fn record_attempt_progress(
        &self,
        printer_id: Uuid,
        percent: i64,
        status_message: &str,
    ) -> Result<Option<UpdateHistoryEntry>> {
        let Some(entry) = self.latest_active_attempt(printer_id).await? else {
            return Ok(None);
        };

        let status = if entry.status == UpdateStatus::Pending {
            UpdateStatus::Downloading
        } else {
            entry.status
        };

        sqlx::query(
            "UPDATE update_history SET last_percent = ?, last_status_message = ?, status = ? WHERE id = ?",
        )
        .bind(percent)
        .bind(status_message)
        .bind(status.as_str())
        .bind(entry.id)
        .execute(&self.pool)
        .await
        .context("Failed to record update progress")?;

        Ok(Some(UpdateHistoryEntry {
            status,
            last_percent: percent,
            last_status_message: Some(status_message.to_string()),
            ..entry
        }))
    }

    /// Mark the attempt for (printer, version) completed
    pub async fn complete_attempt(
        &self,
        printer_id: Uuid,
        version: &str,
    ) -> Result<Option<UpdateHistoryEntry>> {
        let row = sqlx::query(
            "SELECT * FROM update_history WHERE printer_id = ? AND version = ? \
             AND status IN ('pending', 'downloading') ORDER BY id DESC LIMIT 1",
        )
        .bind(printer_id.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query attempt for completion")?;

        let Some(row) = row else { return Ok(None) };
        let entry = parse_history(&row)?;
        let completed_at = Utc::now();

        sqlx::query(
            "UPDATE update_history SET status = 'completed', completed_at = ?, last_percent = 100 WHERE id = ?",
        )
        .bind(completed_at)
        .bind(entry.id)
        .execute(&self.pool)
        .await
        .context("Failed to mark attempt completed")?;

        Ok(Some(UpdateHistoryEntry {
            status: UpdateStatus::Completed,
            last_percent: 100,
            completed_at: Some(completed_at),
            ..entry
        }))
    }

    /// Mark the most recent non-terminal attempt failed
    pub async fn fail_attempt(
        &self,
        printer_id: Uuid,
        error_message: &str,
    ) -> Result<Option<UpdateHistoryEntry>> {
        let Some(entry) = self.latest_active_attempt(printer_id).await? else {
            return Ok(None);
        };
        let completed_at = Utc::now();

        sqlx::query(
            "UPDATE update_history SET status = 'failed', completed_at = ?, error_message = ? WHERE id = ?",
        )
        .bind(completed_at)
        .bind(error_message)
        .bind(entry.id)
        .execute(&self.pool)
        .await
        .context("Failed to mark attempt failed")?;

        Ok(Some(UpdateHistoryEntry {
            status: UpdateStatus::Failed,
            error_message: Some(error_message.to_string()),
            completed_at: Some(completed_at),
            ..entry
        }))
    }

    /// Mark the non-terminal attempt for (printer, version) declined
    ///
    /// A printer may decline before downloading or part-way through one. A
    /// decline with no matching attempt still leaves a declined record, so
    /// the fleet view shows the refusal.
    pub async fn decline_attempt(
        &self,
        printer_id: Uuid,
        version: &str,
    ) -> Result<Option<UpdateHistoryEntry>> {
        let row = sqlx::query(
            "SELECT * FROM update_history WHERE printer_id = ? AND version = ? \
             AND status IN ('pending', 'downloading') ORDER BY id DESC LIMIT 1",
        )
        .bind(printer_id.to_string())
        .bind(version)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to query attempt for decline")?;

        let completed_at = Utc::now();

        match row {
            Some(row) => {
                let entry = parse_history(&row)?;
                sqlx::query(
                    "UPDATE update_history SET status = 'declined', completed_at = ? WHERE id = ?",
                )
                .bind(completed_at)
                .bind(entry.id)
                .execute(&self.pool)
                .await
                .context("Failed to mark attempt declined")?;

                Ok(Some(UpdateHistoryEntry {
                    status: UpdateStatus::Declined,
                    completed_at: Some(completed_at),
                    ..entry
                }))
            }
            None => {
                let started_at = Utc::now();
                let result = sqlx::query(
                    "INSERT INTO update_history (printer_id, version, status, started_at, completed_at) \
                     VALUES (?, ?, 'declined', ?, ?)",
                )
                .bind(printer_id.to_string())
                .bind(version)
                .bind(started_at)
                .bind(completed_at)
                .execute(&self.pool)
                .await
                .context("Failed to insert declined attempt")?;

                Ok(Some(UpdateHistoryEntry {
                    id: result.last_insert_rowid(),
                    rollout_id: None,
                    printer_id,
                    version: version.to_string(),
                    status: UpdateStatus::Declined,
                    last_percent: 0,
                    last_status_message: None,
                    error_message: None,
                    started_at,
                    completed_at: Some(completed_at),
                }))
            }
        }
    }

    pub async fn update_history_for_printer(
        &self,
        printer_id: Uuid,
        limit: i64,
    ) -> Result<Vec<UpdateHistoryEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM update_history WHERE printer_id = ? ORDER BY id DESC LIMIT ?",
        )
        .bind(printer_id.to_string())
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to query printer update history")?;

        rows.iter().map(parse_history).collect()
    }
}

// ── Row parsing helpers ──

fn parse_uuid(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).with_context(|| format!("Invalid UUID in database: {value}"))
}

fn parse_user(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    Ok(User {
        uuid: parse_uuid(&row.get::<String, _>("uuid"))?,
        username: row.get("username"),
        email: row.get("email"),
        password_digest: row.get("password_digest"),
        is_admin: row.get("is_admin"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        last_login_at: row.get("last_login_at"),
    })
}

fn parse_printer(row: &sqlx::sqlite::SqliteRow) -> Result<Printer> {
    let channel_raw: String = row.get("update_channel");
    let user_uuid: Option<String> = row.get("user_uuid");

    Ok(Printer {
        uuid: parse_uuid(&row.get::<String, _>("uuid"))?,
        user_uuid: user_uuid.as_deref().map(parse_uuid).transpose()?,
        name: row.get("name"),
        platform: row.get("platform"),
        firmware_version: row.get("firmware_version"),
        auto_update: row.get("auto_update"),
        update_channel: UpdateChannel::parse(&channel_raw)
            .with_context(|| format!("Invalid update channel in database: {channel_raw}"))?,
        online: row.get("online"),
        last_connected: row.get("last_connected"),
        daily_message_number: row.get("daily_message_number"),
        daily_counter_date: row.get("daily_counter_date"),
        created_at: row.get("created_at"),
    })
}

fn parse_message_log(row: &sqlx::sqlite::SqliteRow) -> Result<MessageLogEntry> {
    Ok(MessageLogEntry {
        id: row.get("id"),
        sender_id: row.get("sender_id"),
        sender_name: row.get("sender_name"),
        recipient_id: parse_uuid(&row.get::<String, _>("recipient_id"))?,
        body: row.get("body"),
        daily_number: row.get("daily_number"),
        created_at: row.get("created_at"),
    })
}

fn parse_cached_message(row: &sqlx::sqlite::SqliteRow) -> Result<CachedMessage> {
    Ok(CachedMessage {
        id: row.get("id"),
        recipient_id: parse_uuid(&row.get::<String, _>("recipient_id"))?,
        sender_id: row.get("sender_id"),
        sender_name: row.get("sender_name"),
        body: row.get("body"),
        daily_number: row.get("daily_number"),
        created_at: row.get("created_at"),
        is_delivered: row.get("is_delivered"),
    })
}

fn parse_firmware_meta(row: &sqlx::sqlite::SqliteRow) -> Result<FirmwareMeta> {
    let channel_raw: String = row.get("channel");

    Ok(FirmwareMeta {
        id: row.get("id"),
        version: row.get("version"),
        platform: row.get("platform"),
        channel: UpdateChannel::parse(&channel_raw)
            .with_context(|| format!("Invalid firmware channel in database: {channel_raw}"))?,
        size: row.get("size"),
        md5: row.get("md5"),
        sha256: row.get("sha256"),
        release_notes: row.get("release_notes"),
        mandatory: row.get("mandatory"),
        min_upgrade_version: row.get("min_upgrade_version"),
        download_count: row.get("download_count"),
        success_count: row.get("success_count"),
        failure_count: row.get("failure_count"),
        released_at: row.get("released_at"),
        deprecated_at: row.get("deprecated_at"),
    })
}

fn parse_rollout(row: &sqlx::sqlite::SqliteRow) -> Result<UpdateRollout> {
    let type_raw: String = row.get("rollout_type");
    let status_raw: String = row.get("status");

    let targets = RolloutTargets {
        all: row.get("target_all"),
        user_ids: json_to_ids(row.get::<Option<String>, _>("target_user_ids"))?,
        printer_ids: json_to_ids(row.get::<Option<String>, _>("target_printer_ids"))?,
        channels: json_to_channels(row.get::<Option<String>, _>("target_channels"))?,
        min_version: row.get("min_version"),
        max_version: row.get("max_version"),
    };

    Ok(UpdateRollout {
        id: row.get("id"),
        version: row.get("version"),
        targets,
        rollout_type: RolloutType::parse(&type_raw)
            .with_context(|| format!("Invalid rollout type in database: {type_raw}"))?,
        rollout_percentage: row.get("rollout_percentage"),
        scheduled_for: row.get("scheduled_for"),
        status: RolloutStatus::parse(&status_raw)
            .with_context(|| format!("Invalid rollout status in database: {status_raw}"))?,
        total_targets: row.get("total_targets"),
        completed_count: row.get("completed_count"),
        failed_count: row.get("failed_count"),
        declined_count: row.get("declined_count"),
        pending_count: row.get("pending_count"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn parse_history(row: &sqlx::sqlite::SqliteRow) -> Result<UpdateHistoryEntry> {
    let status_raw: String = row.get("status");

    Ok(UpdateHistoryEntry {
        id: row.get("id"),
        rollout_id: row.get("rollout_id"),
        printer_id: parse_uuid(&row.get::<String, _>("printer_id"))?,
        version: row.get("version"),
        status: UpdateStatus::parse(&status_raw)
            .with_context(|| format!("Invalid update status in database: {status_raw}"))?,
        last_percent: row.get("last_percent"),
        last_status_message: row.get("last_status_message"),
        error_message: row.get("error_message"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
    })
}

// ── Targeting array codecs (JSON text columns) ──

fn ids_to_json(ids: &[Uuid]) -> Result<Option<String>> {
    if ids.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(ids).context("Failed to encode target IDs")?))
}

fn json_to_ids(raw: Option<String>) -> Result<Vec<Uuid>> {
    match raw {
        Some(text) => serde_json::from_str(&text).context("Invalid target ID list in database"),
        None => Ok(Vec::new()),
    }
}

fn channels_to_json(channels: &[UpdateChannel]) -> Result<Option<String>> {
    if channels.is_empty() {
        return Ok(None);
    }
    Ok(Some(
        serde_json::to_string(channels).context("Failed to encode target channels")?,
    ))
}

fn json_to_channels(raw: Option<String>) -> Result<Vec<UpdateChannel>> {
    match raw {
        Some(text) => serde_json::from_str(&text).context("Invalid target channel list in database"),
        None => Ok(Vec::new()),
    }
}
