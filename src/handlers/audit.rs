use axum::{
    extract::{Query, State},
    http::header,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::models::{AuditFilter, AuditLogEntry, EventType, PrivacyMethod};
use crate::services::audit_log_service::AuditStatistics;
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct AuditListParams {
    pub user_id: Option<String>,
    pub event_type: Option<EventType>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub query_id: Option<String>,
    pub privacy_method: Option<PrivacyMethod>,
    #[serde(default = "default_include_rejected")]
    pub include_rejected: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_include_rejected() -> bool {
    true
}

fn default_limit() -> usize {
    100
}

impl From<AuditListParams> for AuditFilter {
    fn from(params: AuditListParams) -> Self {
        AuditFilter {
            user_id: params.user_id,
            event_types: params.event_type.map(|t| vec![t]),
            start_time: params.start_time,
            end_time: params.end_time,
            query_id: params.query_id,
            privacy_method: params.privacy_method,
            include_rejected: params.include_rejected,
            limit: params.limit,
            offset: params.offset,
        }
    }
}

pub async fn list_logs(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AuditListParams>,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    let filter: AuditFilter = params.into();
    Ok(Json(state.audit_logger.filter_logs(&filter)))
}

#[derive(Debug, Deserialize)]
pub struct StatisticsParams {
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

pub async fn statistics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<StatisticsParams>,
) -> ApiResult<Json<AuditStatistics>> {
    Ok(Json(
        state
            .audit_logger
            .get_statistics(params.start_time, params.end_time),
    ))
}

#[derive(Debug, Deserialize)]
pub struct ExportParams {
    #[serde(default = "default_format")]
    pub format: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

fn default_format() -> String {
    "json".to_string()
}

/// Export the (optionally time-bounded) log as JSON or CSV.
pub async fn export(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> ApiResult<impl IntoResponse> {
    let filter = AuditFilter {
        start_time: params.start_time,
        end_time: params.end_time,
        limit: usize::MAX,
        ..Default::default()
    };

    match params.format.as_str() {
        "csv" => {
            let csv = state.audit_logger.export_csv(Some(&filter));
            Ok(([(header::CONTENT_TYPE, "text/csv; charset=utf-8")], csv).into_response())
        }
        "json" => {
            let exported = state.audit_logger.export_json(Some(&filter))?;
            Ok((
                [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
                exported,
            )
                .into_response())
        }
        other => Err(ApiError::invalid_data(format!(
            "unsupported export format: {}",
            other
        ))),
    }
}

/// Recompute the hash chain and report whether it is intact.
pub async fn verify(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let valid = state.audit_logger.verify_chain_integrity();
    Ok(Json(json!({
        "valid": valid,
        "entries": state.audit_logger.entry_count(),
    })))
}
