//! HTTP and WebSocket handlers for the PaperMinder server

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Json, Router,
};
use base64::Engine;
use futures_util::{sink::SinkExt, stream::StreamExt};
use md5::Md5;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bitmap;
use crate::error::CoreError;
use crate::models::{
    AuthRequest, AuthResponse, CreateRolloutRequest, ErrorResponse, FirmwareUploadRequest,
    HealthResponse, PrintBitmapRequest, RegisterPrinterRequest, RegisterRequest, RegisterResponse,
    RolloutStatus, RolloutTargets, RolloutType, TestMessageRequest, UpdateChannel,
    UpdatePercentageRequest, User,
};
use crate::platform::{normalize_platform, platform_variants};
use crate::registry::SessionHandle;
use crate::rollout;
use crate::router;
use crate::sanitize::sanitize_name;
use crate::state::SharedState;
use crate::updates;
use crate::wire::{ClientFrame, ServerFrame, StatusLevel};

/// Consecutive malformed frames tolerated before a session is closed
const MAX_MALFORMED_FRAMES: u32 = 5;

/// All HTTP and WebSocket routes over shared state
pub fn api_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/register", post(register_handler))
        .route("/auth", post(auth_handler))
        .route(
            "/api/printers",
            get(list_printers_handler).post(register_printer_handler),
        )
        .route("/api/printers/:printer_id/updates", get(printer_updates_handler))
        .route("/api/printers/:printer_id/messages", get(printer_messages_handler))
        .route(
            "/api/printers/:printer_id/print-bitmap",
            post(print_bitmap_handler),
        )
        .route("/api/messages/test", post(test_message_handler))
        .route("/api/firmware", get(list_firmware_handler))
        .route("/api/firmware/upload", post(upload_firmware_handler))
        .route("/api/firmware/download/:version", get(download_firmware_handler))
        .route(
            "/api/rollouts",
            get(list_rollouts_handler).post(create_rollout_handler),
        )
        .route("/api/rollouts/:rollout_id", get(get_rollout_handler))
        .route("/api/rollouts/:rollout_id/activate", post(activate_rollout_handler))
        .route("/api/rollouts/:rollout_id/pause", post(pause_rollout_handler))
        .route("/api/rollouts/:rollout_id/resume", post(resume_rollout_handler))
        .route("/api/rollouts/:rollout_id/cancel", post(cancel_rollout_handler))
        .route(
            "/api/rollouts/:rollout_id/percentage",
            patch(update_percentage_handler),
        )
        .route("/ws/:identity", get(ws_handler))
        .with_state(state)
}

// ── Authorization helpers ──

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message.to_string(),
            code: status.as_u16(),
        }),
    )
        .into_response()
}

async fn authorize(state: &SharedState, headers: &HeaderMap) -> Result<User, Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Missing bearer token"))?;

    let user_id = state
        .validate_token(token)
        .await
        .ok_or_else(|| error_response(StatusCode::UNAUTHORIZED, "Invalid or expired token"))?;

    match state.db.get_user(user_id).await {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(error_response(StatusCode::UNAUTHORIZED, "Unknown user")),
        Err(e) => {
            error!(error = %e, "User lookup failed");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Persistence error"))
        }
    }
}

async fn authorize_admin(state: &SharedState, headers: &HeaderMap) -> Result<User, Response> {
    let user = authorize(state, headers).await?;
    if !user.is_admin {
        return Err(error_response(StatusCode::FORBIDDEN, "Admin privileges required"));
    }
    Ok(user)
}

// ── Health and authentication ──

/// Health check endpoint
pub async fn health_handler(State(state): State<SharedState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.uptime(),
    })
}

/// User registration endpoint
pub async fn register_handler(
    State(state): State<SharedState>,
    Json(request): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, Response> {
    if request.username.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Username cannot be empty"));
    }
    if request.password.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Password cannot be empty"));
    }

    match state
        .register_user(request.username, request.email, request.password)
        .await
    {
        Ok(user_id) => {
            info!(user = %user_id, "Registered new user");
            Ok(Json(RegisterResponse {
                user_id,
                message: "User registered successfully".into(),
            }))
        }
        Err(err) => Err(error_response(StatusCode::CONFLICT, &err)),
    }
}

/// User authentication endpoint
pub async fn auth_handler(
    State(state): State<SharedState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<AuthResponse>, Response> {
    match state
        .authenticate_user(request.username, request.password)
        .await
    {
        Ok(token) => Ok(Json(AuthResponse {
            token: token.token,
            user_id: token.user_id,
            expires_at: token.expires_at,
        })),
        Err(err) => Err(error_response(StatusCode::UNAUTHORIZED, &err)),
    }
}

// ── Printer endpoints ──

/// Register a printer; non-admin callers own the printer they register
pub async fn register_printer_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<RegisterPrinterRequest>,
) -> Result<Json<crate::models::Printer>, Response> {
    let user = authorize(&state, &headers).await?;

    let owner = if user.is_admin {
        request.user_id.or(Some(user.uuid))
    } else {
        Some(user.uuid)
    };

    match state.db.get_printer(request.printer_id).await {
        Ok(Some(_)) => {
            return Err(error_response(StatusCode::CONFLICT, "Printer already registered"))
        }
        Ok(None) => {}
        Err(e) => {
            error!(error = %e, "Printer lookup failed");
            return Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Persistence error"));
        }
    }

    let name = sanitize_name(&request.name);
    if name.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Printer name cannot be empty"));
    }
    let platform = request.platform.as_deref().and_then(normalize_platform);

    match state
        .db
        .register_printer(request.printer_id, &name, platform.as_deref(), owner)
        .await
    {
        Ok(printer) => {
            info!(printer = %printer.uuid, "Registered printer");
            Ok(Json(printer))
        }
        Err(e) => {
            error!(error = %e, "Failed to register printer");
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, "Persistence error"))
        }
    }
}

/// Admin fleet listing; online state comes from the registry
pub async fn list_printers_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<Json<Vec<crate::models::Printer>>, Response> {
    authorize_admin(&state, &headers).await?;

    let mut printers = state.db.list_printers().await.map_err(|e| {
        error!(error = %e, "Failed to list printers");
        error_response(StatusCode::INTERNAL_SERVER_ERROR, "Persistence error")
    })?;

    for printer in &mut printers {
        printer.online = state.registry.is_connected(printer.uuid).await;
    }
    Ok(Json(printers))
}

/// Update history of one printer
pub async fn printer_updates_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(printer_id): Path<Uuid>,
) -> Result<Json<Vec<crate::models::UpdateHistoryEntry>>, Response> {
    let user = authorize(&state, &headers).await?;

    let printer = match state.db.get_printer(printer_id).await {
        Ok(Some(printer)) => printer,
        Ok(None) => return Err(CoreError::RecipientNotFound(printer_id).into_response()),
        Err(e) => return Err(CoreError::StoreUnavailable(e).into_response()),
    };

    if !user.is_admin && printer.user_uuid != Some(user.uuid) {
        return Err(error_response(StatusCode::FORBIDDEN, "Not your printer"));
    }

    let history = state
        .db
        .update_history_for_printer(printer_id, 100)
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;
    Ok(Json(history))
}

/// Delivered message history of one printer
pub async fn printer_messages_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(printer_id): Path<Uuid>,
) -> Result<Json<Vec<crate::models::MessageLogEntry>>, Response> {
    let user = authorize(&state, &headers).await?;

    let printer = match state.db.get_printer(printer_id).await {
        Ok(Some(printer)) => printer,
        Ok(None) => return Err(CoreError::RecipientNotFound(printer_id).into_response()),
        Err(e) => return Err(CoreError::StoreUnavailable(e).into_response()),
    };

    if !user.is_admin && printer.user_uuid != Some(user.uuid) {
        return Err(error_response(StatusCode::FORBIDDEN, "Not your printer"));
    }

    let messages = state
        .db
        .messages_for_printer(printer_id, 100)
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;
    Ok(Json(messages))
}

/// Dispatch an already-packed bitmap to a printer's live sessions
pub async fn print_bitmap_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(printer_id): Path<Uuid>,
    Json(request): Json<PrintBitmapRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    authorize(&state, &headers).await?;

    let delivered = bitmap::dispatch_bitmap(&state, printer_id, &request)
        .await
        .map_err(IntoResponse::into_response)?;

    Ok(Json(json!({
        "status": "dispatched",
        "sessions": delivered,
    })))
}

/// Route a text message over HTTP (testing and system notifications)
pub async fn test_message_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<TestMessageRequest>,
) -> Result<Json<serde_json::Value>, Response> {
    let user = authorize(&state, &headers).await?;

    let routed = router::route_text_message(
        &state,
        &user.uuid.to_string(),
        request.recipient_id,
        &request.sender_name,
        &request.message,
    )
    .await
    .map_err(IntoResponse::into_response)?;

    Ok(Json(json!({
        "daily_number": routed.daily_number,
        "delivered_sessions": routed.delivered_sessions,
        "cached": routed.delivered_sessions == 0,
    })))
}

// ── Firmware endpoints ──

/// Upload a firmware binary for one (version, platform) pair
pub async fn upload_firmware_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<FirmwareUploadRequest>,
) -> Result<Json<crate::models::FirmwareMeta>, Response> {
    authorize_admin(&state, &headers).await?;

    if request.version.trim().is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Version cannot be empty"));
    }
    let Some(platform) = normalize_platform(&request.platform) else {
        return Err(error_response(StatusCode::BAD_REQUEST, "Platform cannot be empty"));
    };

    let data = base64::engine::general_purpose::STANDARD
        .decode(&request.data)
        .map_err(|_| error_response(StatusCode::BAD_REQUEST, "Invalid base64 firmware data"))?;

    if data.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Firmware binary is empty"));
    }
    if data.len() > state.settings.max_firmware_size {
        return Err(error_response(
            StatusCode::PAYLOAD_TOO_LARGE,
            &format!(
                "Firmware is {} bytes, maximum is {}",
                data.len(),
                state.settings.max_firmware_size
            ),
        ));
    }

    match state.db.firmware_exists(&request.version, &platform).await {
        Ok(true) => {
            return Err(error_response(
                StatusCode::CONFLICT,
                "Firmware already exists for this version and platform",
            ))
        }
        Ok(false) => {}
        Err(e) => return Err(CoreError::StoreUnavailable(e).into_response()),
    }

    let md5 = format!("{:x}", Md5::digest(&data));
    let sha256 = format!("{:x}", Sha256::digest(&data));

    let meta = state
        .db
        .insert_firmware(
            request.version.trim(),
            &platform,
            request.channel,
            &data,
            &md5,
            &sha256,
            request.release_notes.as_deref(),
            request.mandatory,
            request.min_upgrade_version.as_deref(),
        )
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;

    info!(version = %meta.version, platform = %meta.platform, size = meta.size, "Firmware uploaded");
    Ok(Json(meta))
}

/// List firmware metadata, optionally filtered by channel
pub async fn list_firmware_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<crate::models::FirmwareMeta>>, Response> {
    authorize(&state, &headers).await?;

    let channel = match params.get("channel") {
        Some(raw) => Some(
            UpdateChannel::parse(raw)
                .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Unknown channel"))?,
        ),
        None => None,
    };

    let list = state
        .db
        .list_firmware(channel)
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;
    Ok(Json(list))
}

/// Serve a firmware binary; this is the stable URL embedded in
/// `firmware_update` frames, so it stays unauthenticated
pub async fn download_firmware_handler(
    State(state): State<SharedState>,
    Path(version): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Response, Response> {
    let platform = params
        .get("platform")
        .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Missing platform parameter"))?;

    let variants = platform_variants(platform);
    if variants.is_empty() {
        return Err(error_response(StatusCode::BAD_REQUEST, "Invalid platform parameter"));
    }

    let (meta, data) = state
        .db
        .get_firmware_blob(&version, &variants)
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?
        .ok_or_else(|| {
            CoreError::FirmwareUnavailable {
                version: version.clone(),
                platform: platform.clone(),
            }
            .into_response()
        })?;

    if let Err(e) = state.db.increment_firmware_download(meta.id).await {
        warn!(firmware = meta.id, error = %e, "Failed to count download");
    }

    let filename = format!("firmware-{}-{}.bin", meta.version, meta.platform);
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        data,
    )
        .into_response())
}

// ── Rollout endpoints ──

/// Create a rollout campaign; targets are counted at creation time
pub async fn create_rollout_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CreateRolloutRequest>,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    authorize_admin(&state, &headers).await?;

    let targets = RolloutTargets {
        all: request.target_all,
        user_ids: request.target_user_ids,
        printer_ids: request.target_printer_ids,
        channels: request.target_channels,
        min_version: request.min_version,
        max_version: request.max_version,
    };
    if targets.is_empty() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Rollout needs a target selector (all, users, printers, or channels)",
        ));
    }

    let percentage = match request.rollout_type {
        RolloutType::Gradual => {
            let pct = request.rollout_percentage.ok_or_else(|| {
                error_response(
                    StatusCode::BAD_REQUEST,
                    "rollout_percentage is required for gradual rollouts",
                )
            })?;
            if !(0..=100).contains(&pct) {
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "rollout_percentage must be between 0 and 100",
                ));
            }
            pct
        }
        _ => 100,
    };

    if request.rollout_type == RolloutType::Scheduled && request.scheduled_for.is_none() {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "scheduled_for is required for scheduled rollouts",
        ));
    }

    match state.db.firmware_version_exists(&request.version).await {
        Ok(true) => {}
        Ok(false) => {
            return Err(error_response(
                StatusCode::BAD_REQUEST,
                &format!("No firmware uploaded for version {}", request.version),
            ))
        }
        Err(e) => return Err(CoreError::StoreUnavailable(e).into_response()),
    }

    let printers = state
        .db
        .list_printers()
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;
    let total_targets = printers
        .iter()
        .filter(|p| rollout::printer_matches_targets(&targets, p))
        .count() as i64;

    let created = state
        .db
        .create_rollout(
            &request.version,
            &targets,
            request.rollout_type,
            percentage,
            request.scheduled_for,
            total_targets,
        )
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;

    info!(
        rollout = created.id,
        version = %created.version,
        targets = total_targets,
        "Rollout created"
    );
    Ok(Json(created))
}

pub async fn list_rollouts_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Json<Vec<crate::models::UpdateRollout>>, Response> {
    authorize_admin(&state, &headers).await?;

    let rollouts = match params.get("status") {
        Some(raw) => {
            let status = RolloutStatus::parse(raw)
                .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Unknown status"))?;
            state.db.list_rollouts_by_status(status).await
        }
        None => state.db.list_rollouts().await,
    }
    .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;

    Ok(Json(rollouts))
}

pub async fn get_rollout_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(rollout_id): Path<i64>,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    authorize_admin(&state, &headers).await?;

    match state.db.get_rollout(rollout_id).await {
        Ok(Some(rollout)) => Ok(Json(rollout)),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Rollout not found")),
        Err(e) => Err(CoreError::StoreUnavailable(e).into_response()),
    }
}

async fn transition_rollout(
    state: &SharedState,
    rollout_id: i64,
    next: RolloutStatus,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    let rollout = match state.db.get_rollout(rollout_id).await {
        Ok(Some(rollout)) => rollout,
        Ok(None) => return Err(error_response(StatusCode::NOT_FOUND, "Rollout not found")),
        Err(e) => return Err(CoreError::StoreUnavailable(e).into_response()),
    };

    if !rollout.status.can_transition_to(next) {
        return Err(error_response(
            StatusCode::CONFLICT,
            &format!(
                "Cannot move rollout from {} to {}",
                rollout.status.as_str(),
                next.as_str()
            ),
        ));
    }

    state
        .db
        .set_rollout_status(rollout_id, next)
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;

    info!(rollout = rollout_id, status = next.as_str(), "Rollout status changed");

    match state.db.get_rollout(rollout_id).await {
        Ok(Some(rollout)) => Ok(Json(rollout)),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Rollout not found")),
        Err(e) => Err(CoreError::StoreUnavailable(e).into_response()),
    }
}

pub async fn activate_rollout_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(rollout_id): Path<i64>,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    authorize_admin(&state, &headers).await?;
    transition_rollout(&state, rollout_id, RolloutStatus::Active).await
}

pub async fn pause_rollout_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(rollout_id): Path<i64>,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    authorize_admin(&state, &headers).await?;
    transition_rollout(&state, rollout_id, RolloutStatus::Paused).await
}

pub async fn resume_rollout_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(rollout_id): Path<i64>,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    authorize_admin(&state, &headers).await?;
    transition_rollout(&state, rollout_id, RolloutStatus::Active).await
}

pub async fn cancel_rollout_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(rollout_id): Path<i64>,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    authorize_admin(&state, &headers).await?;
    transition_rollout(&state, rollout_id, RolloutStatus::Cancelled).await
}

/// Widen (or narrow) a gradual rollout
pub async fn update_percentage_handler(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(rollout_id): Path<i64>,
    Json(request): Json<UpdatePercentageRequest>,
) -> Result<Json<crate::models::UpdateRollout>, Response> {
    authorize_admin(&state, &headers).await?;

    if !(0..=100).contains(&request.percentage) {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Percentage must be between 0 and 100",
        ));
    }

    let rollout = match state.db.get_rollout(rollout_id).await {
        Ok(Some(rollout)) => rollout,
        Ok(None) => return Err(error_response(StatusCode::NOT_FOUND, "Rollout not found")),
        Err(e) => return Err(CoreError::StoreUnavailable(e).into_response()),
    };
    if rollout.rollout_type != RolloutType::Gradual {
        return Err(error_response(
            StatusCode::BAD_REQUEST,
            "Only gradual rollouts have a percentage",
        ));
    }

    state
        .db
        .set_rollout_percentage(rollout_id, request.percentage)
        .await
        .map_err(|e| CoreError::StoreUnavailable(e).into_response())?;

    match state.db.get_rollout(rollout_id).await {
        Ok(Some(rollout)) => Ok(Json(rollout)),
        Ok(None) => Err(error_response(StatusCode::NOT_FOUND, "Rollout not found")),
        Err(e) => Err(CoreError::StoreUnavailable(e).into_response()),
    }
}

// ── WebSocket ──

/// WebSocket upgrade handler; one endpoint serves users and printers, the
/// role is inferred from the first frame
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(identity): Path<Uuid>,
    State(state): State<SharedState>,
) -> Response {
    info!(%identity, "WebSocket connection established");
    ws.on_upgrade(move |socket| websocket_handler(socket, identity, state))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionRole {
    Undetermined,
    User,
    Printer,
}

async fn websocket_handler(socket: WebSocket, path_identity: Uuid, state: SharedState) {
    let (mut ws_sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<String>(64);

    // Writer task: the single consumer of this session's queue, so frame
    // writes are serialized per session.
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut identity = path_identity;
    let mut handle = state.attach_session(identity, tx.clone()).await;
    let mut role = SessionRole::Undetermined;
    let mut malformed_streak: u32 = 0;

    let _ = handle
        .send(&ServerFrame::status(StatusLevel::Info, "connected"))
        .await;

    while let Some(msg) = receiver.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if text.len() > state.settings.max_frame_size {
                    let _ = handle
                        .send(&ServerFrame::status(
                            StatusLevel::Error,
                            format!(
                                "Frame of {} bytes exceeds limit of {}",
                                text.len(),
                                state.settings.max_frame_size
                            ),
                        ))
                        .await;
                    break;
                }

                let frame = match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        malformed_streak += 1;
                        let err = CoreError::MalformedFrame(e.to_string());
                        let _ = handle
                            .send(&ServerFrame::status(StatusLevel::Error, err.to_string()))
                            .await;
                        if malformed_streak >= MAX_MALFORMED_FRAMES {
                            warn!(%identity, "Closing session after repeated malformed frames");
                            break;
                        }
                        continue;
                    }
                };
                malformed_streak = 0;

                if role == SessionRole::Undetermined {
                    role = if matches!(frame, ClientFrame::Subscription { .. }) {
                        SessionRole::Printer
                    } else {
                        SessionRole::User
                    };
                }

                handle_client_frame(&state, &mut identity, &mut handle, &tx, role, frame).await;
            }
            Ok(Message::Close(_)) => {
                info!(%identity, "WebSocket closed by peer");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!(%identity, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    state.detach_session(identity, handle.id()).await;
    writer.abort();
    info!(%identity, "WebSocket session ended");
}

/// Dispatch one parsed frame within a session
async fn handle_client_frame(
    state: &SharedState,
    identity: &mut Uuid,
    handle: &mut SessionHandle,
    tx: &mpsc::Sender<String>,
    role: SessionRole,
    frame: ClientFrame,
) {
    let printer_only = !matches!(
        frame,
        ClientFrame::Subscription { .. } | ClientFrame::Message { .. }
    );
    if printer_only && role != SessionRole::Printer {
        let _ = handle
            .send(&ServerFrame::status(
                StatusLevel::Error,
                format!("Frame kind '{}' requires a printer session", frame.kind()),
            ))
            .await;
        return;
    }

    match frame {
        ClientFrame::Subscription {
            printer_name,
            printer_id,
            platform,
            firmware_version,
            auto_update,
            update_channel,
            api_key: _,
        } => {
            if role != SessionRole::Printer {
                let _ = handle
                    .send(&ServerFrame::status(
                        StatusLevel::Error,
                        "subscription must be the first frame of a printer session",
                    ))
                    .await;
                return;
            }
            handle_subscription(
                state,
                identity,
                handle,
                tx,
                &printer_name,
                printer_id,
                &platform,
                &firmware_version,
                auto_update,
                update_channel,
            )
            .await;
        }

        ClientFrame::Message {
            recipient_id,
            sender_name,
            message,
        } => {
            let sender_id = identity.to_string();
            match router::route_text_message(state, &sender_id, recipient_id, &sender_name, &message)
                .await
            {
                // Offline recipients are not an error to the sender; the
                // message sits in the cache
                Ok(_) => {}
                Err(e @ CoreError::RecipientNotFound(_)) => {
                    let _ = handle
                        .send(&ServerFrame::status(StatusLevel::Error, e.to_string()))
                        .await;
                }
                Err(e) => {
                    error!(sender = %identity, error = %e, "Message routing failed");
                    let _ = handle
                        .send(&ServerFrame::status(
                            StatusLevel::Error,
                            "Message could not be processed",
                        ))
                        .await;
                }
            }
        }

        ClientFrame::FirmwareProgress { percent, status } => {
            if !(-1..=100).contains(&percent) {
                let _ = handle
                    .send(&ServerFrame::status(
                        StatusLevel::Error,
                        "percent must be between -1 and 100",
                    ))
                    .await;
                return;
            }
            if let Err(e) = updates::handle_progress(state, *identity, percent, &status).await {
                error!(printer = %identity, error = %e, "Failed to record progress");
            }
        }

        ClientFrame::FirmwareComplete { version } => {
            if let Err(e) = updates::handle_complete(state, *identity, &version).await {
                error!(printer = %identity, error = %e, "Failed to record completion");
            }
        }

        ClientFrame::FirmwareFailed { error: message } => {
            if let Err(e) = updates::handle_failed(state, *identity, &message).await {
                error!(printer = %identity, error = %e, "Failed to record failure");
            }
        }

        ClientFrame::FirmwareDeclined {
            version,
            auto_update,
        } => {
            if let Err(e) = updates::handle_declined(state, *identity, &version, auto_update).await
            {
                error!(printer = %identity, error = %e, "Failed to record decline");
            }
        }

        ClientFrame::BitmapPrinting { width, height } => {
            info!(printer = %identity, width, height, "Printer started bitmap job");
        }

        ClientFrame::BitmapError { error: message } => {
            warn!(printer = %identity, error = %message, "Printer reported bitmap error");
        }
    }
}

/// Process a printer handshake: adopt the authoritative printer identity,
/// persist the announced state, evaluate rollouts, then drain the cache
#[allow(clippy::too_many_arguments)]
async fn handle_subscription(
    state: &SharedState,
    identity: &mut Uuid,
    handle: &mut SessionHandle,
    tx: &mpsc::Sender<String>,
    printer_name: &str,
    printer_id: Uuid,
    platform: &str,
    firmware_version: &str,
    auto_update: bool,
    update_channel: UpdateChannel,
) {
    if printer_id != *identity {
        state.detach_session(*identity, handle.id()).await;
        *handle = state.attach_session(printer_id, tx.clone()).await;
        *identity = printer_id;
    }

    let name = sanitize_name(printer_name);
    let platform = normalize_platform(platform);

    let updated = match state
        .db
        .update_printer_subscription(
            printer_id,
            &name,
            platform.as_deref(),
            firmware_version,
            auto_update,
            update_channel,
        )
        .await
    {
        Ok(updated) => updated,
        Err(e) => {
            error!(printer = %printer_id, error = %e, "Failed to persist subscription");
            let _ = handle
                .send(&ServerFrame::status(
                    StatusLevel::Error,
                    "Subscription could not be processed",
                ))
                .await;
            return;
        }
    };

    if !updated {
        let _ = handle
            .send(&ServerFrame::status(
                StatusLevel::Warning,
                format!("Printer '{printer_id}' is not registered"),
            ))
            .await;
        return;
    }

    let _ = handle
        .send(&ServerFrame::status(
            StatusLevel::Info,
            format!("Printer '{name}' subscribed successfully"),
        ))
        .await;
    info!(printer = %printer_id, platform = ?platform, firmware = firmware_version, "Printer subscribed");

    // Firmware evaluation first, cache drain second
    match state.db.get_printer(printer_id).await {
        Ok(Some(printer)) => {
            if let Err(e) = rollout::push_available_update(state, &printer).await {
                error!(printer = %printer_id, error = %e, "Rollout evaluation failed");
            }
        }
        Ok(None) => {}
        Err(e) => error!(printer = %printer_id, error = %e, "Printer reload failed"),
    }

    if let Err(e) = router::drain_cached_messages(state, printer_id, handle).await {
        error!(printer = %printer_id, error = %e, "Cache drain failed");
    }
}
