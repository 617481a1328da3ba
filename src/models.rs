//! Data models for the PaperMinder coordination server

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Enumerations ──

/// Release track tagging firmware versions and printer preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    Stable,
    Beta,
    Canary,
}

impl UpdateChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateChannel::Stable => "stable",
            UpdateChannel::Beta => "beta",
            UpdateChannel::Canary => "canary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "stable" => Some(UpdateChannel::Stable),
            "beta" => Some(UpdateChannel::Beta),
            "canary" => Some(UpdateChannel::Canary),
            _ => None,
        }
    }
}

/// Delivery strategy of a rollout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutType {
    Immediate,
    Gradual,
    Scheduled,
}

impl RolloutType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutType::Immediate => "immediate",
            RolloutType::Gradual => "gradual",
            RolloutType::Scheduled => "scheduled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "immediate" => Some(RolloutType::Immediate),
            "gradual" => Some(RolloutType::Gradual),
            "scheduled" => Some(RolloutType::Scheduled),
            _ => None,
        }
    }
}

/// Lifecycle state of a rollout campaign
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RolloutStatus {
    Pending,
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl RolloutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RolloutStatus::Pending => "pending",
            RolloutStatus::Active => "active",
            RolloutStatus::Paused => "paused",
            RolloutStatus::Completed => "completed",
            RolloutStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(RolloutStatus::Pending),
            "active" => Some(RolloutStatus::Active),
            "paused" => Some(RolloutStatus::Paused),
            "completed" => Some(RolloutStatus::Completed),
            "cancelled" => Some(RolloutStatus::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RolloutStatus::Completed | RolloutStatus::Cancelled)
    }

    /// Legal transitions: pending→active, active↔paused, active→completed,
    /// any non-terminal→cancelled
    pub fn can_transition_to(&self, next: RolloutStatus) -> bool {
        match (self, next) {
            (RolloutStatus::Pending, RolloutStatus::Active) => true,
            (RolloutStatus::Active, RolloutStatus::Paused) => true,
            (RolloutStatus::Paused, RolloutStatus::Active) => true,
            (RolloutStatus::Active, RolloutStatus::Completed) => true,
            (from, RolloutStatus::Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// State of a single update attempt (one printer, one rollout)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Pending,
    Downloading,
    Completed,
    Failed,
    Declined,
}

impl UpdateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateStatus::Pending => "pending",
            UpdateStatus::Downloading => "downloading",
            UpdateStatus::Completed => "completed",
            UpdateStatus::Failed => "failed",
            UpdateStatus::Declined => "declined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(UpdateStatus::Pending),
            "downloading" => Some(UpdateStatus::Downloading),
            "completed" => Some(UpdateStatus::Completed),
            "failed" => Some(UpdateStatus::Failed),
            "declined" => Some(UpdateStatus::Declined),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpdateStatus::Completed | UpdateStatus::Failed | UpdateStatus::Declined
        )
    }

    /// Legal transitions: pending→downloading→{completed,failed,declined};
    /// pending may also terminate directly in failed or declined
    pub fn can_transition_to(&self, next: UpdateStatus) -> bool {
        match (self, next) {
            (UpdateStatus::Pending, UpdateStatus::Downloading) => true,
            (UpdateStatus::Pending, UpdateStatus::Failed) => true,
            (UpdateStatus::Pending, UpdateStatus::Declined) => true,
            (UpdateStatus::Downloading, UpdateStatus::Completed) => true,
            (UpdateStatus::Downloading, UpdateStatus::Failed) => true,
            (UpdateStatus::Downloading, UpdateStatus::Declined) => true,
            _ => false,
        }
    }
}

// ── Persistent entities ──

/// Registered account
#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub uuid: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_digest: String,
    pub is_admin: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// Registered thermal printer
#[derive(Debug, Clone, Serialize)]
pub struct Printer {
    pub uuid: Uuid,
    pub user_uuid: Option<Uuid>,
    pub name: String,
    /// Canonical platform string (`esp8266`, `esp32-c3`, ...); unset until
    /// the printer announces itself
    pub platform: Option<String>,
    pub firmware_version: String,
    pub auto_update: bool,
    pub update_channel: UpdateChannel,
    pub online: bool,
    pub last_connected: Option<DateTime<Utc>>,
    pub daily_message_number: i64,
    pub daily_counter_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

/// Immutable record of a routed message
#[derive(Debug, Clone, Serialize)]
pub struct MessageLogEntry {
    pub id: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub recipient_id: Uuid,
    pub body: String,
    pub daily_number: i64,
    pub created_at: DateTime<Utc>,
}

/// Pending delivery slot for an offline printer
#[derive(Debug, Clone)]
pub struct CachedMessage {
    pub id: i64,
    pub recipient_id: Uuid,
    pub sender_id: String,
    pub sender_name: String,
    pub body: String,
    pub daily_number: i64,
    pub created_at: DateTime<Utc>,
    pub is_delivered: bool,
}

/// Firmware version metadata (binary blob stored separately)
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareMeta {
    pub id: i64,
    pub version: String,
    pub platform: String,
    pub channel: UpdateChannel,
    pub size: i64,
    pub md5: String,
    pub sha256: String,
    pub release_notes: Option<String>,
    pub mandatory: bool,
    pub min_upgrade_version: Option<String>,
    pub download_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub released_at: DateTime<Utc>,
    pub deprecated_at: Option<DateTime<Utc>>,
}

/// Targeting selector of a rollout; ID lists and channel lists combine as a
/// union, version bounds apply to every match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloutTargets {
    pub all: bool,
    pub user_ids: Vec<Uuid>,
    pub printer_ids: Vec<Uuid>,
    pub channels: Vec<UpdateChannel>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
}

impl RolloutTargets {
    pub fn is_empty(&self) -> bool {
        !self.all
            && self.user_ids.is_empty()
            && self.printer_ids.is_empty()
            && self.channels.is_empty()
    }
}

/// Firmware rollout campaign
#[derive(Debug, Clone, Serialize)]
pub struct UpdateRollout {
    pub id: i64,
    pub version: String,
    pub targets: RolloutTargets,
    pub rollout_type: RolloutType,
    pub rollout_percentage: i64,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub status: RolloutStatus,
    pub total_targets: i64,
    pub completed_count: i64,
    pub failed_count: i64,
    pub declined_count: i64,
    pub pending_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One update attempt for one printer under one rollout
#[derive(Debug, Clone, Serialize)]
pub struct UpdateHistoryEntry {
    pub id: i64,
    pub rollout_id: Option<i64>,
    pub printer_id: Uuid,
    pub version: String,
    pub status: UpdateStatus,
    pub last_percent: i64,
    pub last_status_message: Option<String>,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// In-memory authentication token
#[derive(Debug, Clone)]
pub struct AuthToken {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: u64,
}

// ── HTTP request/response types ──

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct RegisterResponse {
    pub user_id: Uuid,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub user_id: Uuid,
    pub expires_at: u64,
}

#[derive(Debug, Deserialize)]
pub struct RegisterPrinterRequest {
    pub name: String,
    pub printer_id: Uuid,
    pub platform: Option<String>,
    pub user_id: Option<Uuid>,
}

/// Request body for sending a text message over HTTP
#[derive(Debug, Deserialize)]
pub struct TestMessageRequest {
    pub recipient_id: Uuid,
    #[serde(default = "default_sender_name")]
    pub sender_name: String,
    pub message: String,
}

fn default_sender_name() -> String {
    "system".to_string()
}

/// Request body for dispatching an already-packed bitmap to a printer
#[derive(Debug, Deserialize)]
pub struct PrintBitmapRequest {
    pub width: u32,
    pub height: u32,
    /// Base64 of 1-bit MSB-first row-major pixel data
    pub data: String,
    pub caption: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FirmwareUploadRequest {
    pub version: String,
    pub platform: String,
    pub channel: UpdateChannel,
    /// Base64 of the firmware binary
    pub data: String,
    pub release_notes: Option<String>,
    #[serde(default)]
    pub mandatory: bool,
    pub min_upgrade_version: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateRolloutRequest {
    pub version: String,
    #[serde(default)]
    pub target_all: bool,
    #[serde(default)]
    pub target_user_ids: Vec<Uuid>,
    #[serde(default)]
    pub target_printer_ids: Vec<Uuid>,
    #[serde(default)]
    pub target_channels: Vec<UpdateChannel>,
    pub min_version: Option<String>,
    pub max_version: Option<String>,
    pub rollout_type: RolloutType,
    pub rollout_percentage: Option<i64>,
    pub scheduled_for: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct UpdatePercentageRequest {
    pub percentage: i64,
}

/// Generic error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rollout_status_dag() {
        use RolloutStatus::*;

        assert!(Pending.can_transition_to(Active));
        assert!(Active.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Paused.can_transition_to(Cancelled));

        // Terminal states are absorbing
        assert!(!Completed.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Active));

        // No shortcuts
        assert!(!Pending.can_transition_to(Paused));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Paused.can_transition_to(Completed));
    }

    #[test]
    fn test_update_status_dag() {
        use UpdateStatus::*;

        assert!(Pending.can_transition_to(Downloading));
        assert!(Pending.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Declined));
        assert!(Downloading.can_transition_to(Completed));
        assert!(Downloading.can_transition_to(Failed));
        assert!(Downloading.can_transition_to(Declined));

        // Terminal states are absorbing
        for terminal in [Completed, Failed, Declined] {
            assert!(terminal.is_terminal());
            for next in [Pending, Downloading, Completed, Failed, Declined] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn test_channel_round_trip() {
        for channel in [UpdateChannel::Stable, UpdateChannel::Beta, UpdateChannel::Canary] {
            assert_eq!(UpdateChannel::parse(channel.as_str()), Some(channel));
        }
        assert_eq!(UpdateChannel::parse("nightly"), None);
    }

    #[test]
    fn test_targets_is_empty() {
        assert!(RolloutTargets::default().is_empty());
        let targets = RolloutTargets {
            channels: vec![UpdateChannel::Stable],
            ..Default::default()
        };
        assert!(!targets.is_empty());
    }
}
