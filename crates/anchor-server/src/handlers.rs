//! API route handlers.

use anchor_core::nuclear::{NewNuclearSite, UnblockOutcome};
use anchor_core::session::SessionStatus;
use anchor_storage::StorageData;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{Local, Utc};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{ApiError, Result};
use crate::models::{
    AppRequest, BlockAgainRequest, ExceptionRequest, HistoryResponse, IdleRequest,
    NuclearListResponse, NuclearSiteResponse, UnblockResponse,
};
use crate::state::Controller;

/// GET /api/session - Current session status.
pub async fn get_session(State(controller): State<Controller>) -> Json<SessionStatus> {
    Json(controller.session_status())
}

/// POST /api/session/start - Start a focus session.
pub async fn start_session(State(controller): State<Controller>) -> Result<Json<SessionStatus>> {
    Ok(Json(controller.start_session().await?))
}

/// POST /api/session/end - End the session and return its summary.
pub async fn end_session(State(controller): State<Controller>) -> Result<Json<SessionStatus>> {
    let summary = controller.end_session().await?;
    info!(
        work_ms = summary.work_timer_ms,
        productive_ms = summary.productive_ms,
        "Session ended via API"
    );
    Ok(Json(summary))
}

/// POST /api/session/break - Spend the banked reward.
pub async fn start_break(State(controller): State<Controller>) -> Result<Json<SessionStatus>> {
    Ok(Json(controller.start_break().await?))
}

/// POST /api/session/break/end - End the break early.
pub async fn end_break(State(controller): State<Controller>) -> Result<Json<SessionStatus>> {
    Ok(Json(controller.end_break().await?))
}

/// POST /api/session/idle - Mark the user idle or active.
pub async fn set_idle(
    State(controller): State<Controller>,
    Json(req): Json<IdleRequest>,
) -> StatusCode {
    debug!(idle = req.idle, "Idle report");
    controller.set_idle(req.idle);
    StatusCode::NO_CONTENT
}

/// POST /api/session/app - Report the focused application.
pub async fn report_app(
    State(controller): State<Controller>,
    Json(req): Json<AppRequest>,
) -> Result<StatusCode> {
    let app = req.app.trim();
    if app.is_empty() {
        return Err(ApiError::BadRequest("app must not be empty".into()));
    }

    controller.report_app(app);
    Ok(StatusCode::NO_CONTENT)
}

/// GET /api/config - The whole persisted document.
pub async fn get_config(State(controller): State<Controller>) -> Json<StorageData> {
    Json(controller.config())
}

/// PUT /api/config - Shallow-merge top-level keys.
pub async fn update_config(
    State(controller): State<Controller>,
    Json(partial): Json<Value>,
) -> Result<Json<StorageData>> {
    if let Value::Object(map) = &partial {
        debug!(keys = ?map.keys().collect::<Vec<_>>(), "Updating config");
    }
    Ok(Json(controller.update_config(partial).await?))
}

/// POST /api/config/reset - Restore defaults.
pub async fn reset_config(State(controller): State<Controller>) -> Result<Json<StorageData>> {
    info!("Config reset requested");
    Ok(Json(controller.reset_config().await?))
}

/// GET /api/nuclear - Nuclear blocks with their current stage.
pub async fn list_nuclear(State(controller): State<Controller>) -> Json<NuclearListResponse> {
    let now = Utc::now();
    let sites = controller
        .nuclear_sites()
        .into_iter()
        .map(|entry| NuclearSiteResponse::at(entry, now))
        .collect();
    Json(NuclearListResponse { sites })
}

/// POST /api/nuclear - Add a nuclear block.
pub async fn add_nuclear(
    State(controller): State<Controller>,
    Json(site): Json<NewNuclearSite>,
) -> Result<(StatusCode, Json<NuclearSiteResponse>)> {
    let entry = controller.add_nuclear(site).await?;
    Ok((
        StatusCode::CREATED,
        Json(NuclearSiteResponse::at(entry, Utc::now())),
    ))
}

/// POST /api/nuclear/{id}/unblock - Start the second cooldown.
pub async fn click_unblock(
    State(controller): State<Controller>,
    Path(id): Path<String>,
) -> Result<Json<UnblockResponse>> {
    let (removed, entry) = match controller.click_unblock(&id).await? {
        UnblockOutcome::Unblocking(entry) => (false, entry),
        UnblockOutcome::Removed(entry) => (true, entry),
    };
    Ok(Json(UnblockResponse {
        removed,
        site: NuclearSiteResponse::at(entry, Utc::now()),
    }))
}

/// POST /api/nuclear/{id}/confirm - Remove the block.
pub async fn confirm_unblock(
    State(controller): State<Controller>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    controller.confirm_unblock(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/nuclear/{id}/block-again - Re-arm the first cooldown.
pub async fn block_again(
    State(controller): State<Controller>,
    Path(id): Path<String>,
    body: Option<Json<BlockAgainRequest>>,
) -> Result<Json<NuclearSiteResponse>> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let entry = controller.block_again(&id, req.cooldown1_ms).await?;
    Ok(Json(NuclearSiteResponse::at(entry, Utc::now())))
}

/// POST /api/nuclear/{id}/exceptions - Add a path exception.
pub async fn add_exception(
    State(controller): State<Controller>,
    Path(id): Path<String>,
    Json(req): Json<ExceptionRequest>,
) -> Result<Json<NuclearSiteResponse>> {
    let entry = controller.add_exception(&id, &req.path).await?;
    Ok(Json(NuclearSiteResponse::at(entry, Utc::now())))
}

/// DELETE /api/nuclear/{id}/exceptions - Remove a path exception.
pub async fn remove_exception(
    State(controller): State<Controller>,
    Path(id): Path<String>,
    Json(req): Json<ExceptionRequest>,
) -> Result<Json<NuclearSiteResponse>> {
    let entry = controller.remove_exception(&id, &req.path).await?;
    Ok(Json(NuclearSiteResponse::at(entry, Utc::now())))
}

/// GET /api/history - Session history, daily totals and streak.
pub async fn get_history(State(controller): State<Controller>) -> Json<HistoryResponse> {
    Json(controller.history(Local::now().date_naive()))
}
