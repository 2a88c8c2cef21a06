use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use validator::Validate;

use crate::models::BudgetStatus;

/// Inbound query request body
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct QueryRequest {
    #[validate(length(min = 1, message = "sql must not be empty"))]
    pub sql: String,
    #[serde(default)]
    pub context: QueryContext,
}

/// Per-request context: caller identity plus scratch metadata the pipeline
/// accumulates (e.g. the multi-table sensitivity uplift).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryContext {
    pub user_id: Option<String>,
    pub user_role: Option<String>,
    pub request_id: Option<String>,
    #[serde(default)]
    pub extra: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl QueryContext {
    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    /// Anonymous callers share one budget account.
    pub fn effective_user_id(&self) -> &str {
        self.user_id.as_deref().unwrap_or("anonymous")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseType {
    #[serde(rename = "DP")]
    Dp,
    #[serde(rename = "DeID")]
    DeId,
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "BUDGET_ERROR")]
    BudgetError,
}

/// Privacy metadata attached to every response
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PrivacyInfo {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub epsilon: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns_processed: Vec<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub methods_used: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_budget: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_status: Option<BudgetStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PrivacyInfo {
    pub fn none(reason: impl Into<String>) -> Self {
        Self {
            method: "None".to_string(),
            reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

/// Uniform payload returned by the driver for every outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtectedData {
    #[serde(rename = "type")]
    pub response_type: ResponseType,
    pub original_query: String,
    pub protected_result: Option<Value>,
    pub privacy_info: PrivacyInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Top-level response envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResponse {
    pub status: String,
    pub data: ProtectedData,
}

impl QueryResponse {
    pub fn success(data: ProtectedData) -> Self {
        Self {
            status: "success".to_string(),
            data,
        }
    }

    pub fn error(data: ProtectedData) -> Self {
        Self {
            status: "error".to_string(),
            data,
        }
    }
}

/// Result handed back by an executor backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub data: Value,
    pub row_count: usize,
}

/// Timestamped export envelope for audit dumps
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditExport {
    pub export_timestamp: DateTime<Utc>,
    pub total_entries: usize,
    pub entries: Value,
}
