//! fleetgrid-api — REST API for FleetGrid.
//!
//! Provides axum route handlers for operators and dashboards: rollout
//! creation and lifecycle commands, live target counts per rollout and per
//! group, and the device-facing action status report endpoint.
//!
//! # API Routes
//!
//! All routes are nested under `/api/v1/tenants/{tenant}`.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/rollouts` | List rollouts with counts |
//! | POST | `/rollouts` | Create a rollout |
//! | GET | `/rollouts/{id}` | Rollout with counts |
//! | DELETE | `/rollouts/{id}` | Cancel open actions and delete |
//! | GET | `/rollouts/{id}/groups` | Groups with counts |
//! | GET | `/rollouts/{id}/groups/{group_id}` | One group with counts |
//! | GET | `/rollouts/{id}/groups/{group_id}/targets` | Group member targets |
//! | POST | `/rollouts/{id}/start` | Start a ready rollout |
//! | POST | `/rollouts/{id}/pause` | Pause a running rollout |
//! | POST | `/rollouts/{id}/resume` | Resume a paused rollout |
//! | POST | `/rollouts/{id}/stop` | Stop and cancel open actions |
//! | POST | `/rollouts/{id}/trigger_next_group` | Start the next scheduled group now |
//! | GET | `/actions/{action_id}` | Action with status history |
//! | POST | `/actions/{action_id}/status` | Device status report |

pub mod handlers;

use axum::Router;
use axum::routing::{get, post};
use fleetgrid_rollout::RolloutExecutor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub executor: RolloutExecutor,
}

/// Build the complete API router.
pub fn build_router(executor: RolloutExecutor) -> Router {
    let api_state = ApiState { executor };

    let tenant_routes = Router::new()
        .route("/rollouts", get(handlers::list_rollouts).post(handlers::create_rollout))
        .route(
            "/rollouts/{id}",
            get(handlers::get_rollout).delete(handlers::delete_rollout),
        )
        .route("/rollouts/{id}/groups", get(handlers::list_groups))
        .route("/rollouts/{id}/groups/{group_id}", get(handlers::get_group))
        .route(
            "/rollouts/{id}/groups/{group_id}/targets",
            get(handlers::list_group_targets),
        )
        .route("/rollouts/{id}/start", post(handlers::start_rollout))
        .route("/rollouts/{id}/pause", post(handlers::pause_rollout))
        .route("/rollouts/{id}/resume", post(handlers::resume_rollout))
        .route("/rollouts/{id}/stop", post(handlers::stop_rollout))
        .route(
            "/rollouts/{id}/trigger_next_group",
            post(handlers::trigger_next_group),
        )
        .route("/actions/{action_id}", get(handlers::get_action))
        .route("/actions/{action_id}/status", post(handlers::report_status))
        .with_state(api_state);

    Router::new().nest("/api/v1/tenants/{tenant}", tenant_routes)
}
