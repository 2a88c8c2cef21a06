//! Distributed-mode endpoints: peer operation delivery, state exchange,
//! and instance registry management. Mounted only when distributed mode is
//! enabled.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::services::budget_sync::{BudgetState, SyncOperation};
use crate::services::coordinator::ServiceInstance;
use crate::utils::{ApiError, ApiResult};
use crate::AppState;

fn budget_sync(state: &AppState) -> ApiResult<&Arc<crate::services::DistributedBudgetSync>> {
    state
        .budget_sync
        .as_ref()
        .ok_or_else(|| ApiError::not_found("distributed mode is not enabled"))
}

fn coordinator(state: &AppState) -> ApiResult<&Arc<crate::services::DistributedCoordinator>> {
    state
        .coordinator
        .as_ref()
        .ok_or_else(|| ApiError::not_found("distributed mode is not enabled"))
}

/// Apply a batch of operations delivered by a peer instance.
pub async fn apply_operations(
    State(state): State<Arc<AppState>>,
    Json(operations): Json<Vec<SyncOperation>>,
) -> ApiResult<Json<Value>> {
    let sync = budget_sync(&state)?;
    let mut applied = 0usize;
    for operation in &operations {
        if sync.apply_remote_operation(operation) {
            applied += 1;
        }
    }
    tracing::debug!("Applied {}/{} remote operations", applied, operations.len());
    Ok(Json(json!({"applied": applied, "received": operations.len()})))
}

/// Merge a peer's state snapshot and answer with our own.
pub async fn exchange_state(
    State(state): State<Arc<AppState>>,
    Json(remote_states): Json<HashMap<String, BudgetState>>,
) -> ApiResult<Json<Value>> {
    let sync = budget_sync(&state)?;
    sync.sync_state(remote_states);
    Ok(Json(json!({
        "instance_id": sync.instance_id(),
        "statistics": sync.get_statistics(),
    })))
}

pub async fn sync_statistics(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let sync = budget_sync(&state)?;
    Ok(Json(serde_json::to_value(sync.get_statistics())?))
}

#[derive(Debug, Deserialize)]
pub struct RegisterInstanceRequest {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

fn default_weight() -> u32 {
    100
}

pub async fn register_instance(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegisterInstanceRequest>,
) -> ApiResult<Json<ServiceInstance>> {
    let coordinator = coordinator(&state)?;
    let instance = coordinator.register(
        &request.host,
        request.port,
        request.weight,
        request.metadata,
    );
    Ok(Json(instance))
}

pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let coordinator = coordinator(&state)?;
    if !coordinator.heartbeat(&instance_id) {
        return Err(ApiError::not_found(format!(
            "instance not registered: {}",
            instance_id
        )));
    }
    Ok(Json(json!({"ok": true})))
}

pub async fn deregister_instance(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<Value>> {
    let coordinator = coordinator(&state)?;
    Ok(Json(json!({"removed": coordinator.deregister(&instance_id)})))
}

pub async fn list_instances(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<ServiceInstance>>> {
    let coordinator = coordinator(&state)?;
    Ok(Json(coordinator.get_all_instances()))
}

pub async fn cluster_health(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let coordinator = coordinator(&state)?;
    Ok(Json(coordinator.get_health_endpoint()))
}
