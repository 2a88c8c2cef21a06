use axum::{extract::State, Json};
use std::sync::Arc;
use validator::Validate;

use crate::models::{QueryRequest, QueryResponse};
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

/// Submit a SQL statement through the privacy pipeline.
pub async fn process_query(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> ApiResult<Json<QueryResponse>> {
    request
        .validate()
        .map_err(|e| ApiError::validation_error(e.to_string()))?;

    tracing::debug!(
        "Query submitted by {}: {}",
        request.context.effective_user_id(),
        request.sql
    );

    let response = state
        .query_driver
        .process_query(&request.sql, request.context)
        .await;
    Ok(Json(response))
}
