//! Background scheduler
//!
//! A single ticker (default 30 s) that activates scheduled rollouts whose
//! start time has passed and re-runs the rollout evaluator for every
//! connected printer, so campaigns activated or widened after subscription
//! reach online printers without a reconnect. Tests construct their own
//! state and call [`tick`] directly.

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::rollout;
use crate::state::{AppState, SharedState};

/// Delivered cache rows are kept this long before pruning
const CACHE_RETENTION_DAYS: i64 = 7;

/// Handle to the running scheduler task
pub struct Scheduler {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    /// Spawn the ticker over shared state
    pub fn start(state: SharedState) -> Self {
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let interval = state.settings.scheduler_interval;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(interval) => {
                        if let Err(e) = tick(&state).await {
                            warn!(error = %e, "Scheduler tick failed");
                        }
                    }
                }
            }
            debug!("Scheduler stopped");
        });

        Self { shutdown, task }
    }

    /// Stop the ticker; an in-flight tick finishes before this returns
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

/// One scheduler pass
pub async fn tick(state: &AppState) -> Result<(), CoreError> {
    let activated = state.db.activate_due_rollouts(Utc::now()).await?;
    if !activated.is_empty() {
        info!(rollouts = ?activated, "Activated scheduled rollouts");
    }

    for identity in state.registry.connected_identities().await {
        match state.db.get_printer(identity).await {
            Ok(Some(printer)) => {
                if let Err(e) = rollout::push_available_update(state, &printer).await {
                    warn!(printer = %identity, error = %e, "Rollout evaluation failed");
                }
            }
            // User sessions share the registry; nothing to evaluate
            Ok(None) => {}
            Err(e) => warn!(identity = %identity, error = %e, "Printer lookup failed in tick"),
        }
    }

    let cutoff = Utc::now() - ChronoDuration::days(CACHE_RETENTION_DAYS);
    match state.db.clear_delivered_cache_before(cutoff).await {
        Ok(0) => {}
        Ok(removed) => debug!(removed, "Pruned delivered cache rows"),
        Err(e) => warn!(error = %e, "Cache pruning failed"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RolloutStatus, RolloutTargets, RolloutType, UpdateChannel};
    use crate::wire::ServerFrame;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    async fn seed_state() -> (AppState, Uuid) {
        let state = AppState::new_in_memory().await.unwrap();
        let printer_id = Uuid::new_v4();
        state
            .db
            .register_printer(printer_id, "P", Some("esp8266"), None)
            .await
            .unwrap();
        state
            .db
            .insert_firmware(
                "1.5.0",
                "esp8266",
                UpdateChannel::Stable,
                b"blob",
                "md5",
                "sha",
                None,
                false,
                None,
            )
            .await
            .unwrap();
        (state, printer_id)
    }

    #[tokio::test]
    async fn test_tick_activates_due_rollout_and_pushes() {
        let (state, printer_id) = seed_state().await;
        let targets = RolloutTargets { all: true, ..Default::default() };
        let rollout = state
            .db
            .create_rollout(
                "1.5.0",
                &targets,
                RolloutType::Scheduled,
                100,
                Some(Utc::now() - ChronoDuration::minutes(1)),
                1,
            )
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        state.attach_session(printer_id, tx).await;

        tick(&state).await.unwrap();

        assert_eq!(
            state.db.get_rollout(rollout.id).await.unwrap().unwrap().status,
            RolloutStatus::Active
        );

        let text = rx.recv().await.unwrap();
        let frame: ServerFrame = serde_json::from_str(&text).unwrap();
        match frame {
            ServerFrame::FirmwareUpdate { version, .. } => assert_eq!(version, "1.5.0"),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_resumed_rollout_reaches_connected_printer_on_tick() {
        let (state, printer_id) = seed_state().await;
        let targets = RolloutTargets { all: true, ..Default::default() };
        let rollout = state
            .db
            .create_rollout("1.5.0", &targets, RolloutType::Immediate, 100, None, 1)
            .await
            .unwrap();
        state
            .db
            .set_rollout_status(rollout.id, RolloutStatus::Active)
            .await
            .unwrap();
        state
            .db
            .set_rollout_status(rollout.id, RolloutStatus::Paused)
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        state.attach_session(printer_id, tx).await;

        // Paused: the tick must stay silent
        tick(&state).await.unwrap();
        assert!(rx.try_recv().is_err());

        // Resume, next tick delivers
        state
            .db
            .set_rollout_status(rollout.id, RolloutStatus::Active)
            .await
            .unwrap();
        tick(&state).await.unwrap();

        let text = rx.recv().await.unwrap();
        let frame: ServerFrame = serde_json::from_str(&text).unwrap();
        assert!(matches!(frame, ServerFrame::FirmwareUpdate { .. }));
    }

    #[tokio::test]
    async fn test_scheduler_shutdown() {
        let state = Arc::new(AppState::new_in_memory().await.unwrap());
        let scheduler = Scheduler::start(state);
        scheduler.shutdown().await;
    }
}
