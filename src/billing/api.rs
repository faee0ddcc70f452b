use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use super::models::RemittanceRow;
use super::retention::EnabledOrg;
use super::store::{RemittanceFilter, RemittanceStore, ResetRequest};
use crate::error::{AppError, AppResult};
use crate::messaging::{MessageBus, OutboundMessage, ENABLED_ORGS_TOPIC};

/// Shared state for the internal remittance routes.
#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<dyn RemittanceStore>,
    pub bus: Arc<dyn MessageBus>,
    pub retention_enabled: bool,
    pub stuck_pending_after: chrono::Duration,
}

#[derive(Debug, Serialize)]
pub struct AffectedRows {
    pub count: u64,
}

#[derive(Debug, Serialize)]
pub struct PurgeScheduled {
    pub org_id: String,
    pub message_id: i64,
}

/// key: billing-api -> internal remittance administration
pub fn admin_routes() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/internal/remittances", get(list_remittances))
        .route(
            "/internal/remittances/tally/:tally_id",
            get(list_remittances_by_tally),
        )
        .route("/internal/remittances/reset", put(reset_remittances))
        .route(
            "/internal/remittances/org/:org_id",
            delete(delete_org_remittances),
        )
        .route("/internal/remittances/purge/:org_id", post(purge_org))
        .route("/internal/remittances/reconcile", post(fail_stuck_remittances))
}

pub async fn health() -> &'static str {
    "OK"
}

pub async fn list_remittances(
    Extension(state): Extension<AdminState>,
    Query(filter): Query<RemittanceFilter>,
) -> AppResult<Json<Vec<RemittanceRow>>> {
    if filter.org_id.trim().is_empty() {
        return Err(AppError::BadRequest("org_id is required".to_string()));
    }
    Ok(Json(state.store.find(&filter).await?))
}

pub async fn list_remittances_by_tally(
    Extension(state): Extension<AdminState>,
    Path(tally_id): Path<Uuid>,
) -> AppResult<Json<Vec<RemittanceRow>>> {
    let rows = state.store.find_by_tally(tally_id).await?;
    if rows.is_empty() {
        return Err(AppError::NotFound);
    }
    Ok(Json(rows))
}

pub async fn reset_remittances(
    Extension(state): Extension<AdminState>,
    Json(request): Json<ResetRequest>,
) -> AppResult<Json<AffectedRows>> {
    if request.org_ids.is_empty() == request.billing_account_ids.is_empty() {
        return Err(AppError::BadRequest(
            "provide exactly one of org_ids or billing_account_ids".to_string(),
        ));
    }
    if request.start > request.end {
        return Err(AppError::BadRequest("start must not be after end".to_string()));
    }
    let count = state.store.reset_remitted_value(&request).await?;
    tracing::info!(
        product_id = %request.product_id,
        count,
        "reset remitted values"
    );
    Ok(Json(AffectedRows { count }))
}

pub async fn delete_org_remittances(
    Extension(state): Extension<AdminState>,
    Path(org_id): Path<String>,
) -> AppResult<Json<AffectedRows>> {
    let count = state.store.delete_by_org(&org_id).await?;
    tracing::info!(%org_id, count, "deleted remittances for org");
    Ok(Json(AffectedRows { count }))
}

pub async fn purge_org(
    Extension(state): Extension<AdminState>,
    Path(org_id): Path<String>,
) -> AppResult<(StatusCode, Json<PurgeScheduled>)> {
    if !state.retention_enabled {
        return Err(AppError::BadRequest(
            "remittance retention is not configured".to_string(),
        ));
    }
    let message = OutboundMessage::new(
        ENABLED_ORGS_TOPIC,
        &EnabledOrg {
            org_id: org_id.clone(),
        },
    )?;
    let message_id = state.bus.publish(message).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(PurgeScheduled { org_id, message_id }),
    ))
}

pub async fn fail_stuck_remittances(
    Extension(state): Extension<AdminState>,
) -> AppResult<Json<AffectedRows>> {
    let cutoff = Utc::now() - state.stuck_pending_after;
    let count = state.store.fail_stuck_pending(cutoff).await?;
    if count > 0 {
        tracing::warn!(count, %cutoff, "failed remittances stuck in pending");
    }
    Ok(Json(AffectedRows { count }))
}
