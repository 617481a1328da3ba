//! Rollout evaluation
//!
//! Decides, for one printer at one moment, which firmware (if any) it should
//! be offered. Runs when a printer subscribes and again on every scheduler
//! tick, so newly activated campaigns reach online printers without a
//! reconnect.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::bucket::rollout_bucket;
use crate::error::CoreError;
use crate::models::{Printer, RolloutStatus, RolloutTargets, RolloutType, UpdateRollout, UpdateStatus};
use crate::platform::platform_variants;
use crate::state::AppState;
use crate::version::{compare_versions, is_newer};
use crate::wire::ServerFrame;

/// A firmware offer produced by the evaluator
#[derive(Debug, Clone)]
pub struct FirmwarePush {
    pub rollout_id: i64,
    pub version: String,
    pub frame: ServerFrame,
}

/// True when a printer falls inside a rollout's target selector
///
/// Explicit ID lists and channel lists combine as a union; the version
/// window applies to every match and is inclusive at both ends.
pub fn printer_matches_targets(targets: &RolloutTargets, printer: &Printer) -> bool {
    let selected = targets.all
        || printer
            .user_uuid
            .is_some_and(|user| targets.user_ids.contains(&user))
        || targets.printer_ids.contains(&printer.uuid)
        || targets.channels.contains(&printer.update_channel);
    if !selected {
        return false;
    }

    if let Some(min) = &targets.min_version {
        if compare_versions(&printer.firmware_version, min) == Ordering::Less {
            return false;
        }
    }
    if let Some(max) = &targets.max_version {
        if compare_versions(&printer.firmware_version, max) == Ordering::Greater {
            return false;
        }
    }
    true
}

/// Whether a rollout should deliver to a printer right now
fn rollout_applies(rollout: &UpdateRollout, printer: &Printer, now: DateTime<Utc>) -> bool {
    if rollout.status != RolloutStatus::Active {
        return false;
    }
    if rollout.scheduled_for.is_some_and(|at| at > now) {
        return false;
    }
    if !printer_matches_targets(&rollout.targets, printer) {
        return false;
    }
    // Never downgrade or re-offer the running version
    if !is_newer(&rollout.version, &printer.firmware_version) {
        return false;
    }
    if rollout.rollout_type == RolloutType::Gradual {
        let bucket = rollout_bucket(&printer.uuid) as i64;
        if bucket >= rollout.rollout_percentage {
            return false;
        }
    }
    true
}

/// Evaluate the active rollouts against one printer
///
/// Returns at most one firmware offer. The winning rollout is the one with
/// the highest target version, ties broken by most recent creation. A
/// missing binary for the printer's platform skips the rollout without
/// creating history. History rows are idempotent per rollout+printer: an
/// existing `pending` row re-emits the frame without a new row, anything
/// further along emits nothing.
pub async fn evaluate_for_printer(
    state: &AppState,
    printer: &Printer,
) -> Result<Option<FirmwarePush>, CoreError> {
    if !printer.auto_update {
        return Ok(None);
    }

    let now = Utc::now();
    let active = state
        .db
        .list_rollouts_by_status(RolloutStatus::Active)
        .await?;

    let candidate = active
        .into_iter()
        .filter(|rollout| rollout_applies(rollout, printer, now))
        .max_by(|a, b| {
            compare_versions(&a.version, &b.version).then(a.created_at.cmp(&b.created_at))
        });

    let Some(rollout) = candidate else {
        return Ok(None);
    };

    let Some(platform) = printer.platform.as_deref() else {
        debug!(printer = %printer.uuid, "Printer has no platform, skipping rollout");
        return Ok(None);
    };

    let variants = platform_variants(platform);
    let Some(firmware) = state.db.get_firmware_meta(&rollout.version, &variants).await? else {
        debug!(
            printer = %printer.uuid,
            rollout = rollout.id,
            version = %rollout.version,
            platform,
            "No firmware binary for platform, skipping rollout"
        );
        return Ok(None);
    };

    match state
        .db
        .latest_attempt_for_rollout(rollout.id, printer.uuid)
        .await?
    {
        None => {
            state
                .db
                .create_update_attempt(Some(rollout.id), printer.uuid, &rollout.version)
                .await?;
        }
        Some(attempt) if attempt.status == UpdateStatus::Pending => {
            // The printer may have missed the earlier offer; re-emit on the
            // existing row.
        }
        Some(_) => return Ok(None),
    }

    let url = format!(
        "{}/api/firmware/download/{}?platform={}",
        state.settings.base_url, firmware.version, firmware.platform
    );

    Ok(Some(FirmwarePush {
        rollout_id: rollout.id,
        version: firmware.version.clone(),
        frame: ServerFrame::FirmwareUpdate {
            version: firmware.version,
            url,
            md5: firmware.md5,
        },
    }))
}

/// Evaluate a printer and push the offer to its live sessions
///
/// A failed or timed-out send leaves the history row pending; the scheduler
/// retries on its next tick.
pub async fn push_available_update(state: &AppState, printer: &Printer) -> Result<bool, CoreError> {
    let Some(push) = evaluate_for_printer(state, printer).await? else {
        return Ok(false);
    };

    let delivered = state.registry.broadcast(printer.uuid, &push.frame).await;
    if delivered == 0 {
        warn!(
            printer = %printer.uuid,
            rollout = push.rollout_id,
            version = %push.version,
            "Firmware push reached no session, attempt stays pending"
        );
        return Ok(false);
    }

    info!(
        printer = %printer.uuid,
        rollout = push.rollout_id,
        version = %push.version,
        "Firmware update offered"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{UpdateChannel, UpdateStatus};
    use crate::state::AppState;
    use chrono::NaiveDate;
    use uuid::Uuid;

    fn printer(channel: UpdateChannel, version: &str) -> Printer {
        Printer {
            uuid: Uuid::new_v4(),
            user_uuid: None,
            name: "P".to_string(),
            platform: Some("esp8266".to_string()),
            firmware_version: version.to_string(),
            auto_update: true,
            update_channel: channel,
            online: true,
            last_connected: None,
            daily_message_number: 0,
            daily_counter_date: None,
            created_at: Utc::now(),
        }
    }

    fn rollout(version: &str, targets: RolloutTargets) -> UpdateRollout {
        UpdateRollout {
            id: 1,
            version: version.to_string(),
            targets,
            rollout_type: RolloutType::Immediate,
            rollout_percentage: 100,
            scheduled_for: None,
            status: RolloutStatus::Active,
            total_targets: 0,
            completed_count: 0,
            failed_count: 0,
            declined_count: 0,
            pending_count: 0,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_targeting_union() {
        let user = Uuid::new_v4();
        let mut p = printer(UpdateChannel::Beta, "1.0.0");
        p.user_uuid = Some(user);

        let by_all = RolloutTargets { all: true, ..Default::default() };
        let by_user = RolloutTargets { user_ids: vec![user], ..Default::default() };
        let by_printer = RolloutTargets { printer_ids: vec![p.uuid], ..Default::default() };
        let by_channel = RolloutTargets {
            channels: vec![UpdateChannel::Beta],
            ..Default::default()
        };
        let by_other_channel = RolloutTargets {
            channels: vec![UpdateChannel::Stable],
            ..Default::default()
        };
        let union = RolloutTargets {
            channels: vec![UpdateChannel::Stable],
            printer_ids: vec![p.uuid],
            ..Default::default()
        };

        assert!(printer_matches_targets(&by_all, &p));
        assert!(printer_matches_targets(&by_user, &p));
        assert!(printer_matches_targets(&by_printer, &p));
        assert!(printer_matches_targets(&by_channel, &p));
        assert!(!printer_matches_targets(&by_other_channel, &p));
        // Explicit printer ID matches even though the channel does not
        assert!(printer_matches_targets(&union, &p));
    }

    #[test]
    fn test_version_window_inclusive_bounds() {
        let p = printer(UpdateChannel::Stable, "1.2.0");

        let window = |min: Option<&str>, max: Option<&str>| RolloutTargets {
            all: true,
            min_version: min.map(String::from),
            max_version: max.map(String::from),
            ..Default::default()
        };

        // Equal to either bound is included
        assert!(printer_matches_targets(&window(Some("1.2.0"), None), &p));
        assert!(printer_matches_targets(&window(None, Some("1.2.0")), &p));
        assert!(printer_matches_targets(&window(Some("1.0.0"), Some("2.0.0")), &p));

        assert!(!printer_matches_targets(&window(Some("1.3.0"), None), &p));
        assert!(!printer_matches_targets(&window(None, Some("1.1.0")), &p));
    }

    #[test]
    fn test_never_downgrade() {
        let p = printer(UpdateChannel::Stable, "1.5.0");
        let targets = RolloutTargets { all: true, ..Default::default() };

        let same = rollout("1.5.0", targets.clone());
        let older = rollout("1.0.0", targets.clone());
        let newer = rollout("1.6.0", targets);

        let now = Utc::now();
        assert!(!rollout_applies(&same, &p, now));
        assert!(!rollout_applies(&older, &p, now));
        assert!(rollout_applies(&newer, &p, now));
    }

    #[test]
    fn test_gradual_percentage_boundaries() {
        let p = printer(UpdateChannel::Stable, "1.0.0");
        let targets = RolloutTargets { all: true, ..Default::default() };
        let now = Utc::now();

        let mut zero = rollout("2.0.0", targets.clone());
        zero.rollout_type = RolloutType::Gradual;
        zero.rollout_percentage = 0;
        assert!(!rollout_applies(&zero, &p, now));

        let mut full = rollout("2.0.0", targets.clone());
        full.rollout_type = RolloutType::Gradual;
        full.rollout_percentage = 100;
        assert!(rollout_applies(&full, &p, now));

        // bucket < percentage, deterministic per printer
        let bucket = rollout_bucket(&p.uuid) as i64;
        let mut edge = rollout("2.0.0", targets);
        edge.rollout_type = RolloutType::Gradual;
        edge.rollout_percentage = bucket;
        assert!(!rollout_applies(&edge, &p, now));
        edge.rollout_percentage = bucket + 1;
        assert!(rollout_applies(&edge, &p, now));
    }

    #[test]
    fn test_schedule_and_status_gates() {
        let p = printer(UpdateChannel::Stable, "1.0.0");
        let targets = RolloutTargets { all: true, ..Default::default() };
        let now = Utc::now();

        let mut future = rollout("2.0.0", targets.clone());
        future.scheduled_for = Some(now + chrono::Duration::hours(1));
        assert!(!rollout_applies(&future, &p, now));

        let mut past = rollout("2.0.0", targets.clone());
        past.scheduled_for = Some(now - chrono::Duration::hours(1));
        assert!(rollout_applies(&past, &p, now));

        let mut paused = rollout("2.0.0", targets);
        paused.status = RolloutStatus::Paused;
        assert!(!rollout_applies(&paused, &p, now));
    }

    // ── Evaluator over live state ──

    async fn seed_state() -> (AppState, Printer) {
        let state = AppState::new_in_memory().await.unwrap();
        let printer_id = Uuid::new_v4();
        state
            .db
            .register_printer(printer_id, "P", Some("esp8266"), None)
            .await
            .unwrap();
        state
            .db
            .update_printer_subscription(
                printer_id,
                "P",
                Some("esp8266"),
                "1.0.0",
                true,
                UpdateChannel::Stable,
            )
            .await
            .unwrap();
        let printer = state.db.get_printer(printer_id).await.unwrap().unwrap();
        (state, printer)
    }

    async fn seed_firmware(state: &AppState, version: &str, platform: &str) {
        state
            .db
            .insert_firmware(
                version,
                platform,
                UpdateChannel::Stable,
                b"firmware-blob",
                "0123456789abcdef0123456789abcdef",
                "sha",
                None,
                false,
                None,
            )
            .await
            .unwrap();
    }

    async fn seed_active_rollout(state: &AppState, version: &str) -> i64 {
        let targets = RolloutTargets { all: true, ..Default::default() };
        let rollout = state
            .db
            .create_rollout(version, &targets, RolloutType::Immediate, 100, None, 1)
            .await
            .unwrap();
        state
            .db
            .set_rollout_status(rollout.id, RolloutStatus::Active)
            .await
            .unwrap();
        rollout.id
    }

    #[tokio::test]
    async fn test_evaluate_emits_push_and_pending_row() {
        let (state, printer) = seed_state().await;
        seed_firmware(&state, "1.5.0", "esp8266").await;
        let rollout_id = seed_active_rollout(&state, "1.5.0").await;

        let push = evaluate_for_printer(&state, &printer).await.unwrap().unwrap();
        assert_eq!(push.rollout_id, rollout_id);
        assert_eq!(push.version, "1.5.0");
        match &push.frame {
            ServerFrame::FirmwareUpdate { url, md5, .. } => {
                assert!(url.contains("/api/firmware/download/1.5.0"));
                assert!(url.contains("platform=esp8266"));
                assert_eq!(md5, "0123456789abcdef0123456789abcdef");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        let attempt = state
            .db
            .latest_attempt_for_rollout(rollout_id, printer.uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(attempt.status, UpdateStatus::Pending);
    }

    #[tokio::test]
    async fn test_evaluate_is_idempotent_per_pending_row() {
        let (state, printer) = seed_state().await;
        seed_firmware(&state, "1.5.0", "esp8266").await;
        let rollout_id = seed_active_rollout(&state, "1.5.0").await;

        // Re-subscribing re-emits but never duplicates the history row
        assert!(evaluate_for_printer(&state, &printer).await.unwrap().is_some());
        assert!(evaluate_for_printer(&state, &printer).await.unwrap().is_some());

        let history = state
            .db
            .update_history_for_printer(printer.uuid, 10)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].rollout_id, Some(rollout_id));
    }

    #[tokio::test]
    async fn test_evaluate_silent_after_attempt_progresses() {
        let (state, printer) = seed_state().await;
        seed_firmware(&state, "1.5.0", "esp8266").await;
        seed_active_rollout(&state, "1.5.0").await;

        assert!(evaluate_for_printer(&state, &printer).await.unwrap().is_some());
        state
            .db
            .record_attempt_progress(printer.uuid, 10, "downloading")
            .await
            .unwrap();

        assert!(evaluate_for_printer(&state, &printer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_platform_mismatch_leaves_no_history() {
        let (state, printer) = seed_state().await;
        // Binary exists only for a different platform family
        seed_firmware(&state, "1.5.0", "esp32-c3").await;
        seed_active_rollout(&state, "1.5.0").await;

        assert!(evaluate_for_printer(&state, &printer).await.unwrap().is_none());
        assert!(state
            .db
            .update_history_for_printer(printer.uuid, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_auto_update_disabled_emits_nothing() {
        let (state, mut printer) = seed_state().await;
        seed_firmware(&state, "1.5.0", "esp8266").await;
        seed_active_rollout(&state, "1.5.0").await;

        printer.auto_update = false;
        assert!(evaluate_for_printer(&state, &printer).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_highest_version_wins() {
        let (state, printer) = seed_state().await;
        seed_firmware(&state, "1.5.0", "esp8266").await;
        seed_firmware(&state, "2.0.0", "esp8266").await;
        seed_active_rollout(&state, "1.5.0").await;
        seed_active_rollout(&state, "2.0.0").await;

        let push = evaluate_for_printer(&state, &printer).await.unwrap().unwrap();
        assert_eq!(push.version, "2.0.0");
    }

    #[tokio::test]
    async fn test_daily_counter_untouched_by_evaluation() {
        // Evaluation must not interfere with message numbering state
        let (state, printer) = seed_state().await;
        seed_firmware(&state, "1.5.0", "esp8266").await;
        seed_active_rollout(&state, "1.5.0").await;
        evaluate_for_printer(&state, &printer).await.unwrap();

        let today = NaiveDate::from_ymd_opt(2025, 6, 1).unwrap();
        assert_eq!(state.db.assign_daily_number(printer.uuid, today).await.unwrap(), 1);
    }
}
