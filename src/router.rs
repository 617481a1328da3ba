//! Text message routing
//!
//! Messages addressed to a printer are sanitized, stamped with the printer's
//! next daily number, logged, then either delivered to every live session or
//! parked in the message cache. Cached rows are drained in insertion order
//! when the printer next subscribes; a row is marked delivered only after its
//! frame has been handed to the socket write path, so delivery is
//! at-least-once and printers dedup by daily number.

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreError;
use crate::registry::SessionHandle;
use crate::sanitize::{sanitize_message, sanitize_name};
use crate::state::AppState;
use crate::wire::ServerFrame;

/// Outcome of routing one text message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutedMessage {
    pub daily_number: i64,
    /// Sessions the frame reached; 0 means the message was cached
    pub delivered_sessions: usize,
}

/// Route a text message to a printer, caching it when no session is live
pub async fn route_text_message(
    state: &AppState,
    sender_id: &str,
    recipient_id: Uuid,
    sender_name: &str,
    body: &str,
) -> Result<RoutedMessage, CoreError> {
    state
        .db
        .get_printer(recipient_id)
        .await?
        .ok_or(CoreError::RecipientNotFound(recipient_id))?;

    let sender_name = sanitize_name(sender_name);
    let body = sanitize_message(body);

    // Assignment is totally ordered per printer; the lock spans the
    // read-reset-increment round-trip.
    let daily_number = {
        let lock = state.daily_lock(recipient_id).await;
        let _guard = lock.lock().await;
        state
            .db
            .assign_daily_number(recipient_id, Utc::now().date_naive())
            .await?
    };

    state
        .db
        .insert_message_log(sender_id, &sender_name, recipient_id, &body, daily_number)
        .await?;

    let timestamp = Utc::now();
    let frame = ServerFrame::Outbound {
        sender_name: sender_name.clone(),
        message: body.clone(),
        daily_number,
        timestamp,
    };

    let delivered_sessions = state.registry.broadcast(recipient_id, &frame).await;
    if delivered_sessions == 0 {
        state
            .db
            .cache_message(recipient_id, sender_id, &sender_name, &body, daily_number)
            .await?;
        debug!(recipient = %recipient_id, daily_number, "Recipient offline, message cached");
    }

    Ok(RoutedMessage {
        daily_number,
        delivered_sessions,
    })
}

/// Drain undelivered cached messages onto a freshly attached session
///
/// Rows are written in insertion order and marked delivered one by one. The
/// first write failure aborts the drain, leaving the remaining rows queued
/// for the next session.
pub async fn drain_cached_messages(
    state: &AppState,
    printer_id: Uuid,
    session: &SessionHandle,
) -> Result<usize, CoreError> {
    let pending = state.db.undelivered_cached_messages(printer_id).await?;
    if pending.is_empty() {
        return Ok(0);
    }

    let mut delivered = 0;
    for row in pending {
        let frame = ServerFrame::Outbound {
            sender_name: row.sender_name.clone(),
            message: row.body.clone(),
            daily_number: row.daily_number,
            timestamp: row.created_at,
        };

        if let Err(e) = session.send(&frame).await {
            warn!(
                printer = %printer_id,
                cache_id = row.id,
                error = %e,
                "Cache drain aborted, remaining rows stay queued"
            );
            break;
        }
        delivered += 1;

        if let Err(e) = state.db.mark_cache_delivered(row.id).await {
            // The frame is already on the wire; the unmarked row will be
            // re-sent next time and deduplicated by daily number.
            warn!(printer = %printer_id, cache_id = row.id, error = %e, "Failed to mark cache row delivered");
        }
    }

    if delivered > 0 {
        info!(printer = %printer_id, delivered, "Drained cached messages");
    }
    Ok(delivered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::AppState;
    use tokio::sync::mpsc;

    async fn state_with_printer() -> (AppState, Uuid) {
        let state = AppState::new_in_memory().await.unwrap();
        let printer_id = Uuid::new_v4();
        state
            .db
            .register_printer(printer_id, "Kitchen", Some("esp8266"), None)
            .await
            .unwrap();
        (state, printer_id)
    }

    #[tokio::test]
    async fn test_offline_recipient_message_is_cached() {
        let (state, printer_id) = state_with_printer().await;

        let routed = route_text_message(&state, "sender", printer_id, "Alice", "Hi")
            .await
            .unwrap();
        assert_eq!(routed.daily_number, 1);
        assert_eq!(routed.delivered_sessions, 0);

        let cached = state.db.undelivered_cached_messages(printer_id).await.unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].body, "Hi");
        assert_eq!(cached[0].daily_number, 1);
    }

    #[tokio::test]
    async fn test_online_recipient_gets_frame_without_caching() {
        let (state, printer_id) = state_with_printer().await;
        let (tx, mut rx) = mpsc::channel(8);
        state.attach_session(printer_id, tx).await;

        let routed = route_text_message(&state, "sender", printer_id, "Alice", "Hi")
            .await
            .unwrap();
        assert_eq!(routed.delivered_sessions, 1);

        let text = rx.recv().await.unwrap();
        let frame: ServerFrame = serde_json::from_str(&text).unwrap();
        match frame {
            ServerFrame::Outbound {
                sender_name,
                message,
                daily_number,
                ..
            } => {
                assert_eq!(sender_name, "Alice");
                assert_eq!(message, "Hi");
                assert_eq!(daily_number, 1);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        assert!(state
            .db
            .undelivered_cached_messages(printer_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_unknown_recipient() {
        let state = AppState::new_in_memory().await.unwrap();
        let err = route_text_message(&state, "sender", Uuid::new_v4(), "Alice", "Hi")
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::RecipientNotFound(_)));
    }

    #[tokio::test]
    async fn test_daily_numbers_are_contiguous() {
        let (state, printer_id) = state_with_printer().await;

        for expected in 1..=4 {
            let routed = route_text_message(&state, "sender", printer_id, "Alice", "Hi")
                .await
                .unwrap();
            assert_eq!(routed.daily_number, expected);
        }
    }

    #[tokio::test]
    async fn test_message_body_is_sanitized() {
        let (state, printer_id) = state_with_printer().await;

        route_text_message(&state, "sender", printer_id, "Al\u{0}ice", "caf\u{e9} time")
            .await
            .unwrap();

        let cached = state.db.undelivered_cached_messages(printer_id).await.unwrap();
        assert_eq!(cached[0].sender_name, "Al ice");
        assert_eq!(cached[0].body, "caf time");
    }

    #[tokio::test]
    async fn test_drain_delivers_in_insertion_order_and_marks() {
        let (state, printer_id) = state_with_printer().await;

        for body in ["first", "second", "third"] {
            route_text_message(&state, "sender", printer_id, "Alice", body)
                .await
                .unwrap();
        }

        let (tx, mut rx) = mpsc::channel(8);
        let handle = state.attach_session(printer_id, tx).await;

        let drained = drain_cached_messages(&state, printer_id, &handle).await.unwrap();
        assert_eq!(drained, 3);

        for expected in ["first", "second", "third"] {
            let text = rx.recv().await.unwrap();
            let frame: ServerFrame = serde_json::from_str(&text).unwrap();
            match frame {
                ServerFrame::Outbound { message, .. } => assert_eq!(message, expected),
                other => panic!("unexpected frame: {other:?}"),
            }
        }

        assert!(state
            .db
            .undelivered_cached_messages(printer_id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_drain_aborts_on_dead_session() {
        let (state, printer_id) = state_with_printer().await;

        for body in ["first", "second"] {
            route_text_message(&state, "sender", printer_id, "Alice", body)
                .await
                .unwrap();
        }

        let (tx, rx) = mpsc::channel(8);
        let handle = state.attach_session(printer_id, tx).await;
        drop(rx);

        let drained = drain_cached_messages(&state, printer_id, &handle).await.unwrap();
        assert_eq!(drained, 0);

        // Nothing was marked delivered
        let cached = state.db.undelivered_cached_messages(printer_id).await.unwrap();
        assert_eq!(cached.len(), 2);
    }
}
