//! Update attempt tracking
//!
//! Consumes the firmware response frames printers send while downloading and
//! installing, advances the per-attempt state machine, and keeps rollout and
//! firmware counters in step. An active rollout whose pending count drains
//! to zero is completed here.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::models::{RolloutStatus, UpdateStatus};
use crate::platform::platform_variants;
use crate::state::AppState;

/// Record a `firmware_progress` report
pub async fn handle_progress(
    state: &AppState,
    printer_id: Uuid,
    percent: i64,
    status_message: &str,
) -> Result<(), CoreError> {
    match state
        .db
        .record_attempt_progress(printer_id, percent, status_message)
        .await?
    {
        Some(entry) => {
            debug!(
                printer = %printer_id,
                version = %entry.version,
                percent,
                status = status_message,
                "Firmware download progress"
            );
        }
        None => {
            debug!(printer = %printer_id, "Progress report without active update attempt");
        }
    }
    Ok(())
}

/// Record a `firmware_complete` report
pub async fn handle_complete(
    state: &AppState,
    printer_id: Uuid,
    version: &str,
) -> Result<(), CoreError> {
    // The printer is running the new version regardless of our bookkeeping
    state
        .db
        .set_printer_firmware_version(printer_id, version)
        .await?;

    let Some(entry) = state.db.complete_attempt(printer_id, version).await? else {
        warn!(printer = %printer_id, version, "Completion report without matching attempt");
        return Ok(());
    };

    if let Some(platform) = printer_platform(state, printer_id).await {
        state
            .db
            .increment_firmware_success(version, &platform_variants(&platform))
            .await?;
    }

    if let Some(rollout_id) = entry.rollout_id {
        let pending = state
            .db
            .record_rollout_outcome(rollout_id, UpdateStatus::Completed)
            .await?;
        finalize_if_drained(state, rollout_id, pending).await?;
    }

    info!(printer = %printer_id, version, "Firmware update completed");
    Ok(())
}

/// Record a `firmware_failed` report
pub async fn handle_failed(
    state: &AppState,
    printer_id: Uuid,
    error_message: &str,
) -> Result<(), CoreError> {
    let Some(entry) = state.db.fail_attempt(printer_id, error_message).await? else {
        warn!(printer = %printer_id, "Failure report without active update attempt");
        return Ok(());
    };

    if let Some(platform) = printer_platform(state, printer_id).await {
        state
            .db
            .increment_firmware_failure(&entry.version, &platform_variants(&platform))
            .await?;
    }

    if let Some(rollout_id) = entry.rollout_id {
        let pending = state
            .db
            .record_rollout_outcome(rollout_id, UpdateStatus::Failed)
            .await?;
        finalize_if_drained(state, rollout_id, pending).await?;
    }

    warn!(printer = %printer_id, version = %entry.version, error = error_message, "Firmware update failed");
    Ok(())
}

/// Record a `firmware_declined` report
///
/// A decline that also reports `auto_update: false` persists the opt-out so
/// the evaluator stops offering updates to this printer.
pub async fn handle_declined(
    state: &AppState,
    printer_id: Uuid,
    version: &str,
    auto_update: bool,
) -> Result<(), CoreError> {
    if !auto_update {
        state.db.set_printer_auto_update(printer_id, false).await?;
        info!(printer = %printer_id, "Printer disabled auto-update");
    }

    let Some(entry) = state.db.decline_attempt(printer_id, version).await? else {
        return Ok(());
    };

    if let Some(rollout_id) = entry.rollout_id {
        let pending = state
            .db
            .record_rollout_outcome(rollout_id, UpdateStatus::Declined)
            .await?;
        finalize_if_drained(state, rollout_id, pending).await?;
    }

    info!(printer = %printer_id, version, "Firmware update declined");
    Ok(())
}

/// Complete an active rollout whose pending count reached zero
async fn finalize_if_drained(
    state: &AppState,
    rollout_id: i64,
    pending: Option<i64>,
) -> Result<(), CoreError> {
    if pending != Some(0) {
        return Ok(());
    }

    let Some(rollout) = state.db.get_rollout(rollout_id).await? else {
        return Ok(());
    };
    if rollout.status == RolloutStatus::Active {
        state
            .db
            .set_rollout_status(rollout_id, RolloutStatus::Completed)
            .await?;
        info!(rollout = rollout_id, version = %rollout.version, "Rollout completed");
    }
    Ok(())
}

async fn printer_platform(state: &AppState, printer_id: Uuid) -> Option<String> {
    match state.db.get_printer(printer_id).await {
        Ok(Some(printer)) => printer.platform,
        Ok(None) => None,
        Err(e) => {
            warn!(printer = %printer_id, error = %e, "Printer lookup failed for counter update");
            None
        }
    }
}
