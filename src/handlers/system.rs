use axum::{
    extract::{Path, State},
    Json,
};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::services::performance_monitor::{PerformanceStatistics, QueryMetrics};
use crate::services::query_cache::CacheStatistics;
use crate::services::rate_limiter::RateLimiterStatistics;
use crate::utils::ApiResult;
use crate::AppState;

pub async fn cache_statistics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<CacheStatistics>> {
    Ok(Json(state.query_cache.get_statistics()))
}

pub async fn performance_statistics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<PerformanceStatistics>> {
    Ok(Json(state.performance_monitor.get_statistics()))
}

pub async fn slow_queries(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<QueryMetrics>>> {
    Ok(Json(state.performance_monitor.get_slow_queries(100)))
}

pub async fn rate_limit_statistics(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<RateLimiterStatistics>> {
    Ok(Json(state.rate_limiter.get_statistics()))
}

/// Force a policy-document reload from disk.
pub async fn reload_policy(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    state.policy_config.reload();
    state
        .audit_logger
        .log_config_changed("system", "policy", json!({"action": "reload"}));
    Ok(Json(json!({"ok": true})))
}

/// Add a column to the sensitive set at runtime.
pub async fn add_sensitive_column(
    State(state): State<Arc<AppState>>,
    Path(column): Path<String>,
) -> ApiResult<Json<Value>> {
    state.policy_engine.add_sensitive_column(&column);
    state.audit_logger.log_config_changed(
        "system",
        "sensitive_columns",
        json!({"added": column}),
    );
    Ok(Json(json!({
        "sensitive_columns": state.policy_engine.sensitive_columns(),
    })))
}

/// Remove a column from the sensitive set at runtime.
pub async fn remove_sensitive_column(
    State(state): State<Arc<AppState>>,
    Path(column): Path<String>,
) -> ApiResult<Json<Value>> {
    state.policy_engine.remove_sensitive_column(&column);
    state.audit_logger.log_config_changed(
        "system",
        "sensitive_columns",
        json!({"removed": column}),
    );
    Ok(Json(json!({
        "sensitive_columns": state.policy_engine.sensitive_columns(),
    })))
}
