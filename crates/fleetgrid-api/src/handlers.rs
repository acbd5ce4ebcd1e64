//! REST API handlers.
//!
//! Each handler goes through the `RolloutExecutor` so that every write
//! fires its entity event, and returns JSON responses.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use tracing::warn;

use fleet_core::count::TotalTargetCountStatus;
use fleet_core::types::{
    Action, ActionId, ActionStatus, ActionStatusEntry, Rollout, RolloutGroup, RolloutGroupId,
    RolloutId, TargetId, TenantId,
};
use fleetgrid_rollout::{CreateRollout, RolloutError, RolloutExecutor, RolloutResult};
use fleetgrid_state::{CountScope, StateError};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn status_for(err: &RolloutError) -> StatusCode {
    match err {
        RolloutError::NotFound(_) | RolloutError::State(StateError::NotFound(_)) => {
            StatusCode::NOT_FOUND
        }
        RolloutError::IllegalState { .. }
        | RolloutError::NoScheduledGroup(_)
        | RolloutError::State(StateError::IllegalTransition(_)) => StatusCode::CONFLICT,
        RolloutError::InvalidCondition { .. }
        | RolloutError::InvalidGroups(_)
        | RolloutError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        RolloutError::State(_) | RolloutError::Core(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rollout_error(err: RolloutError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        warn!(error = %err, "request failed");
    }
    error_response(&err.to_string(), status).into_response()
}

fn respond<T: Serialize>(result: RolloutResult<T>) -> Response {
    match result {
        Ok(data) => ApiResponse::ok(data).into_response(),
        Err(e) => rollout_error(e),
    }
}

// ── Views ──────────────────────────────────────────────────────

/// A rollout with its live target counts.
#[derive(Debug, Serialize, Deserialize)]
pub struct RolloutView {
    #[serde(flatten)]
    pub rollout: Rollout,
    pub total_target_count_status: TotalTargetCountStatus,
}

/// A rollout group with its live target counts.
#[derive(Debug, Serialize, Deserialize)]
pub struct GroupView {
    #[serde(flatten)]
    pub group: RolloutGroup,
    pub total_target_count_status: TotalTargetCountStatus,
    pub finished_percent: f64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActionView {
    #[serde(flatten)]
    pub action: Action,
    pub history: Vec<ActionStatusEntry>,
}

/// Status report body sent by a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: ActionStatus,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub download_progress_percent: Option<u8>,
}

fn rollout_view(exec: &RolloutExecutor, rollout: Rollout) -> RolloutResult<RolloutView> {
    let counts = exec.total_target_count_status(
        &rollout.tenant,
        CountScope::Rollout {
            rollout_id: rollout.id,
        },
    )?;
    Ok(RolloutView {
        rollout,
        total_target_count_status: counts,
    })
}

fn group_view(exec: &RolloutExecutor, group: RolloutGroup) -> RolloutResult<GroupView> {
    let counts = exec.total_target_count_status(
        &group.tenant,
        CountScope::Group {
            rollout_id: group.rollout_id,
            group_id: group.id,
        },
    )?;
    Ok(GroupView {
        finished_percent: counts.finished_percent(),
        group,
        total_target_count_status: counts,
    })
}

// ── Rollouts ───────────────────────────────────────────────────

/// GET /api/v1/tenants/{tenant}/rollouts
pub async fn list_rollouts(
    State(state): State<ApiState>,
    Path(tenant): Path<TenantId>,
) -> impl IntoResponse {
    let exec = &state.executor;
    respond(exec.list_rollouts(&tenant).and_then(|rollouts| {
        rollouts
            .into_iter()
            .map(|r| rollout_view(exec, r))
            .collect::<RolloutResult<Vec<_>>>()
    }))
}

/// POST /api/v1/tenants/{tenant}/rollouts
pub async fn create_rollout(
    State(state): State<ApiState>,
    Path(tenant): Path<TenantId>,
    Json(req): Json<CreateRollout>,
) -> impl IntoResponse {
    let exec = &state.executor;
    match exec
        .create_rollout(&tenant, &req)
        .and_then(|r| rollout_view(exec, r))
    {
        Ok(view) => (StatusCode::CREATED, ApiResponse::ok(view)).into_response(),
        Err(e) => rollout_error(e),
    }
}

/// GET /api/v1/tenants/{tenant}/rollouts/{id}
pub async fn get_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    let exec = &state.executor;
    respond(
        exec.get_rollout(&tenant, id)
            .and_then(|r| rollout_view(exec, r)),
    )
}

/// GET /api/v1/tenants/{tenant}/rollouts/{id}/groups
pub async fn list_groups(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    let exec = &state.executor;
    respond(exec.list_groups(&tenant, id).and_then(|groups| {
        groups
            .into_iter()
            .map(|g| group_view(exec, g))
            .collect::<RolloutResult<Vec<_>>>()
    }))
}

/// GET /api/v1/tenants/{tenant}/rollouts/{id}/groups/{group_id}
pub async fn get_group(
    State(state): State<ApiState>,
    Path((tenant, id, group_id)): Path<(TenantId, RolloutId, RolloutGroupId)>,
) -> impl IntoResponse {
    let exec = &state.executor;
    respond(
        exec.get_group(&tenant, id, group_id)
            .and_then(|g| group_view(exec, g)),
    )
}

/// GET /api/v1/tenants/{tenant}/rollouts/{id}/groups/{group_id}/targets
pub async fn list_group_targets(
    State(state): State<ApiState>,
    Path((tenant, id, group_id)): Path<(TenantId, RolloutId, RolloutGroupId)>,
) -> impl IntoResponse {
    let targets: RolloutResult<Vec<TargetId>> =
        state.executor.list_group_targets(&tenant, id, group_id);
    respond(targets)
}

/// DELETE /api/v1/tenants/{tenant}/rollouts/{id}
pub async fn delete_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    match state.executor.delete_rollout(&tenant, id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => rollout_error(e),
    }
}

// ── Lifecycle commands ─────────────────────────────────────────

/// POST /api/v1/tenants/{tenant}/rollouts/{id}/start
pub async fn start_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    respond(state.executor.start(&tenant, id))
}

/// POST /api/v1/tenants/{tenant}/rollouts/{id}/pause
pub async fn pause_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    respond(state.executor.pause(&tenant, id))
}

/// POST /api/v1/tenants/{tenant}/rollouts/{id}/resume
pub async fn resume_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    respond(state.executor.resume(&tenant, id))
}

/// POST /api/v1/tenants/{tenant}/rollouts/{id}/stop
pub async fn stop_rollout(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    respond(state.executor.stop(&tenant, id))
}

/// POST /api/v1/tenants/{tenant}/rollouts/{id}/trigger_next_group
pub async fn trigger_next_group(
    State(state): State<ApiState>,
    Path((tenant, id)): Path<(TenantId, RolloutId)>,
) -> impl IntoResponse {
    let exec = &state.executor;
    respond(
        exec.trigger_next_group(&tenant, id)
            .and_then(|g| group_view(exec, g)),
    )
}

// ── Actions ────────────────────────────────────────────────────

/// GET /api/v1/tenants/{tenant}/actions/{action_id}
pub async fn get_action(
    State(state): State<ApiState>,
    Path((tenant, action_id)): Path<(TenantId, ActionId)>,
) -> impl IntoResponse {
    let store = state.executor.store();
    let result = store
        .get_action(&tenant, action_id)
        .map_err(RolloutError::from)
        .and_then(|found| {
            found.ok_or_else(|| RolloutError::NotFound(format!("action {tenant}/{action_id}")))
        })
        .and_then(|action| {
            let history = store.list_action_history(&tenant, action_id)?;
            Ok(ActionView { action, history })
        });
    respond(result)
}

/// POST /api/v1/tenants/{tenant}/actions/{action_id}/status
pub async fn report_status(
    State(state): State<ApiState>,
    Path((tenant, action_id)): Path<(TenantId, ActionId)>,
    Json(report): Json<StatusReport>,
) -> impl IntoResponse {
    respond(state.executor.report_action_status(
        &tenant,
        action_id,
        report.status,
        &report.messages,
        report.download_progress_percent,
    ))
}
