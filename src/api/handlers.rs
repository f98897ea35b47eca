//! Request handlers for the API endpoints.
//!
//! Handlers only translate between JSON and the arbiter; every decision is
//! made by [`CommandArbiter`](crate::fleet::CommandArbiter).

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;

use crate::config::RuntimeConfigPatch;
use crate::devices::DeviceId;
use crate::error::FleetError;
use crate::fleet::CommandOutcome;

use super::AppState;
use super::types::{
    ActivateRequest, ApplyRequest, ControlRequest, DispatchResponse, ErrorResponse, HistoryQuery,
    OperatorResponse, OverrideRequest, PreviewQuery,
};

/// Entries returned by `/api/history` when no limit is given.
const DEFAULT_HISTORY_LIMIT: usize = 50;

/// HTTP status for an error kind.
fn error_status(error: &FleetError) -> StatusCode {
    match error {
        FleetError::CapacityExceeded { .. } => StatusCode::BAD_REQUEST,
        FleetError::Conflict(_) => StatusCode::CONFLICT,
        FleetError::NoDevicesAvailable => StatusCode::SERVICE_UNAVAILABLE,
        FleetError::DeviceUnreachable { .. } => StatusCode::NOT_FOUND,
        _ => StatusCode::OK,
    }
}

/// Accepted commands are 200 even when degraded; rejections map by kind.
fn outcome_status(outcome: &CommandOutcome) -> StatusCode {
    match (&outcome.error, outcome.accepted) {
        (Some(error), false) => error_status(error),
        _ => StatusCode::OK,
    }
}

/// `GET /api/status` → dispatch status.
pub async fn get_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.arbiter.status())
}

/// `POST /api/activate` → `{accepted, message}`.
pub async fn activate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ActivateRequest>,
) -> impl IntoResponse {
    let outcome = state.arbiter.activate(req.activation_power_in_kw).await;
    (outcome_status(&outcome), Json(DispatchResponse::from(&outcome)))
}

/// `POST /api/deactivate` → `{accepted, message}`. The body is ignored.
pub async fn deactivate(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let outcome = state.arbiter.deactivate().await;
    (outcome_status(&outcome), Json(DispatchResponse::from(&outcome)))
}

/// `GET /api/fleet` → full fleet view.
pub async fn get_fleet(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.arbiter.fleet_status())
}

/// `POST /api/override` → enable or release the manual override.
pub async fn set_override(
    State(state): State<Arc<AppState>>,
    Json(req): Json<OverrideRequest>,
) -> impl IntoResponse {
    let outcome = state
        .arbiter
        .set_override(req.enabled, req.target_power_kw)
        .await;
    (outcome_status(&outcome), Json(OperatorResponse::from(outcome)))
}

/// `GET /api/preview?targetKw=..&mode=..` → the plan a local apply would push.
pub async fn preview(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PreviewQuery>,
) -> impl IntoResponse {
    match state.arbiter.preview(query.target_kw, query.mode) {
        Ok(plan) => Ok(Json(plan)),
        Err(e) => Err((error_status(&e), Json(ErrorResponse::new(e.to_string())))),
    }
}

/// `POST /api/apply` → local apply from the dashboard.
pub async fn apply(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ApplyRequest>,
) -> impl IntoResponse {
    let outcome = state.arbiter.local_apply(req.target_power_kw, req.mode).await;
    (outcome_status(&outcome), Json(OperatorResponse::from(outcome)))
}

/// `GET /api/history?limit=N` → most recent commands, newest first.
pub async fn history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> impl IntoResponse {
    Json(state.arbiter.history(query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT)))
}

/// `GET /api/config` → current runtime configuration.
pub async fn get_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.arbiter.config().current().as_ref().clone())
}

/// `PATCH /api/config` → apply a partial update.
///
/// `PATCH /api/config` with an invalid value → 400 + `ErrorResponse`
pub async fn patch_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<RuntimeConfigPatch>,
) -> impl IntoResponse {
    match state.arbiter.config().update(patch) {
        Ok(updated) => Ok(Json(updated.as_ref().clone())),
        Err(errors) => Err((
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: "invalid configuration".to_string(),
                details: errors.iter().map(ToString::to_string).collect(),
            }),
        )),
    }
}

/// `POST /api/devices/{address}/control` → one device action.
pub async fn control_device(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
    Json(req): Json<ControlRequest>,
) -> impl IntoResponse {
    let id = DeviceId::new(address);
    let outcome = state.arbiter.control_device(&id, req.action).await;
    (outcome_status(&outcome), Json(OperatorResponse::from(outcome)))
}
