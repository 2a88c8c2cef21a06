use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::models::{BudgetStatus, BudgetTransaction};
use crate::utils::ApiResult;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    #[serde(default = "default_history_limit")]
    pub limit: usize,
}

fn default_history_limit() -> usize {
    100
}

#[derive(Debug, Deserialize)]
pub struct SetBudgetRequest {
    pub total_budget: f64,
}

/// Current budget status for a user.
pub async fn get_budget(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<BudgetStatus>> {
    Ok(Json(state.budget_manager.get_budget_status(&user_id)))
}

/// Manually reset a user's consumed budget.
pub async fn reset_budget(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<Value>> {
    state.budget_manager.reset_budget(&user_id);
    let status = state.budget_manager.get_budget_status(&user_id);
    state
        .audit_logger
        .log_budget_reset(&user_id, status.total_budget, "manual");
    tracing::info!("Budget manually reset for user {}", user_id);
    Ok(Json(json!({"ok": true, "status": status})))
}

/// Newest-first transaction history for a user.
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> ApiResult<Json<Vec<BudgetTransaction>>> {
    Ok(Json(
        state.budget_manager.get_budget_history(&user_id, params.limit),
    ))
}

/// Replace a user's total budget.
pub async fn set_budget(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(request): Json<SetBudgetRequest>,
) -> ApiResult<Json<BudgetStatus>> {
    state
        .budget_manager
        .set_budget(&user_id, request.total_budget);
    state.audit_logger.log_config_changed(
        &user_id,
        "budget",
        json!({"total_budget": request.total_budget}),
    );
    Ok(Json(state.budget_manager.get_budget_status(&user_id)))
}
