//! WebSocket wire protocol
//!
//! Frames are JSON objects discriminated by a `kind` field. Clients (web
//! users and printers) send [`ClientFrame`]s; the server replies with
//! [`ServerFrame`]s. A printer session opens with `subscription`; any other
//! opening frame marks the session as a human user session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::UpdateChannel;

/// Frames accepted from clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Printer handshake announcing identity and update preferences.
    /// `printer_id` is authoritative; the legacy `api_key` is ignored.
    Subscription {
        printer_name: String,
        printer_id: Uuid,
        platform: String,
        firmware_version: String,
        auto_update: bool,
        update_channel: UpdateChannel,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        api_key: Option<String>,
    },
    /// Text message addressed to a printer
    Message {
        recipient_id: Uuid,
        sender_name: String,
        message: String,
    },
    /// Download progress report; `percent` is 0–100, or -1 on error
    FirmwareProgress { percent: i64, status: String },
    FirmwareComplete { version: String },
    FirmwareFailed { error: String },
    FirmwareDeclined { version: String, auto_update: bool },
    /// Printer acknowledges a bitmap job
    BitmapPrinting { width: u32, height: u32 },
    BitmapError { error: String },
}

impl ClientFrame {
    pub fn kind(&self) -> &'static str {
        match self {
            ClientFrame::Subscription { .. } => "subscription",
            ClientFrame::Message { .. } => "message",
            ClientFrame::FirmwareProgress { .. } => "firmware_progress",
            ClientFrame::FirmwareComplete { .. } => "firmware_complete",
            ClientFrame::FirmwareFailed { .. } => "firmware_failed",
            ClientFrame::FirmwareDeclined { .. } => "firmware_declined",
            ClientFrame::BitmapPrinting { .. } => "bitmap_printing",
            ClientFrame::BitmapError { .. } => "bitmap_error",
        }
    }
}

/// Severity of a status frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusLevel {
    Info,
    Warning,
    Error,
}

/// Frames emitted by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Delivered text message
    Outbound {
        sender_name: String,
        message: String,
        daily_number: i64,
        timestamp: DateTime<Utc>,
    },
    /// Validation failures, cache-drain notices, connection info
    Status { level: StatusLevel, message: String },
    /// Firmware offer; the printer fetches `url` and verifies `md5`
    FirmwareUpdate {
        version: String,
        url: String,
        md5: String,
    },
    /// Packed 1-bit bitmap print job
    PrintBitmap {
        width: u32,
        height: u32,
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caption: Option<String>,
    },
}

impl ServerFrame {
    pub fn status(level: StatusLevel, message: impl Into<String>) -> Self {
        ServerFrame::Status {
            level,
            message: message.into(),
        }
    }
}
