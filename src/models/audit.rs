use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::utils::sha256_hex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    QuerySubmitted,
    QueryAnalyzed,
    PrivacyApplied,
    QueryRejected,
    BudgetConsumed,
    BudgetReset,
    ConfigChanged,
    SystemError,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::QuerySubmitted => "query_submitted",
            EventType::QueryAnalyzed => "query_analyzed",
            EventType::PrivacyApplied => "privacy_applied",
            EventType::QueryRejected => "query_rejected",
            EventType::BudgetConsumed => "budget_consumed",
            EventType::BudgetReset => "budget_reset",
            EventType::ConfigChanged => "config_changed",
            EventType::SystemError => "system_error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMethod {
    DifferentialPrivacy,
    Deidentification,
    KAnonymity,
    LDiversity,
    None,
}

impl PrivacyMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrivacyMethod::DifferentialPrivacy => "differential_privacy",
            PrivacyMethod::Deidentification => "deidentification",
            PrivacyMethod::KAnonymity => "k_anonymity",
            PrivacyMethod::LDiversity => "l_diversity",
            PrivacyMethod::None => "none",
        }
    }
}

/// Query-side details embedded in an audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryEvent {
    pub query_id: String,
    pub user_id: String,
    pub original_sql: String,
    pub timestamp: DateTime<Utc>,
    pub tables_accessed: Vec<String>,
    pub columns_accessed: Vec<String>,
    pub query_type: String,
    pub is_aggregation: bool,
    pub has_joins: bool,
    pub has_subqueries: bool,
    pub execution_time_ms: Option<f64>,
}

impl QueryEvent {
    pub fn new(
        query_id: impl Into<String>,
        user_id: impl Into<String>,
        original_sql: impl Into<String>,
    ) -> Self {
        Self {
            query_id: query_id.into(),
            user_id: user_id.into(),
            original_sql: original_sql.into(),
            timestamp: Utc::now(),
            tables_accessed: Vec::new(),
            columns_accessed: Vec::new(),
            query_type: "UNKNOWN".to_string(),
            is_aggregation: false,
            has_joins: false,
            has_subqueries: false,
            execution_time_ms: None,
        }
    }
}

/// Privacy-side details embedded in an audit entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyEvent {
    pub query_id: String,
    pub privacy_method: PrivacyMethod,
    pub epsilon: Option<f64>,
    pub delta: Option<f64>,
    pub sensitivity: Option<f64>,
    pub k_value: Option<u32>,
    pub l_value: Option<u32>,
    pub noise_added: Option<f64>,
    pub columns_protected: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

impl PrivacyEvent {
    pub fn new(query_id: impl Into<String>, privacy_method: PrivacyMethod) -> Self {
        Self {
            query_id: query_id.into(),
            privacy_method,
            epsilon: None,
            delta: None,
            sensitivity: None,
            k_value: None,
            l_value: None,
            noise_added: None,
            columns_protected: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

/// One link of the tamper-evident chain.
///
/// `entry_hash` covers every other field (previous_hash included) rendered as
/// sorted-keys JSON, so flipping any field invalidates the entry and every
/// entry after it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub entry_id: String,
    pub event_type: EventType,
    pub timestamp: DateTime<Utc>,
    pub user_id: String,
    pub query_event: Option<QueryEvent>,
    pub privacy_event: Option<PrivacyEvent>,
    pub rejection_reason: Option<String>,
    pub metadata: Map<String, Value>,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

impl AuditLogEntry {
    /// Canonical rendering: every field except `entry_hash`, keys sorted.
    ///
    /// `serde_json::Value` objects are backed by a BTreeMap, so converting
    /// through `Value` yields a stable sorted-keys string.
    fn canonical_value(&self) -> Value {
        json!({
            "entry_id": self.entry_id,
            "event_type": self.event_type,
            "timestamp": self.timestamp.to_rfc3339(),
            "user_id": self.user_id,
            "query_event": self.query_event,
            "privacy_event": self.privacy_event,
            "rejection_reason": self.rejection_reason,
            "metadata": self.metadata,
            "previous_hash": self.previous_hash,
        })
    }

    pub fn compute_hash(&self) -> String {
        let canonical = self.canonical_value().to_string();
        sha256_hex(canonical.as_bytes())
    }

    pub fn verify_integrity(&self) -> bool {
        self.entry_hash == self.compute_hash()
    }
}

/// Filter criteria for listing and exporting audit entries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditFilter {
    pub user_id: Option<String>,
    pub event_types: Option<Vec<EventType>>,
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

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            user_id: None,
            event_types: None,
            start_time: None,
            end_time: None,
            query_id: None,
            privacy_method: None,
            include_rejected: true,
            limit: 100,
            offset: 0,
        }
    }
}

impl AuditFilter {
    pub fn matches(&self, entry: &AuditLogEntry) -> bool {
        if let Some(user_id) = &self.user_id {
            if &entry.user_id != user_id {
                return false;
            }
        }
        if let Some(event_types) = &self.event_types {
            if !event_types.contains(&entry.event_type) {
                return false;
            }
        }
        if let Some(start) = self.start_time {
            if entry.timestamp < start {
                return false;
            }
        }
        if let Some(end) = self.end_time {
            if entry.timestamp > end {
                return false;
            }
        }
        if let Some(query_id) = &self.query_id {
            if let Some(query_event) = &entry.query_event {
                if &query_event.query_id != query_id {
                    return false;
                }
            }
            if let Some(privacy_event) = &entry.privacy_event {
                if &privacy_event.query_id != query_id {
                    return false;
                }
            }
        }
        if let Some(method) = self.privacy_method {
            if let Some(privacy_event) = &entry.privacy_event {
                if privacy_event.privacy_method != method {
                    return false;
                }
            }
        }
        if !self.include_rejected && entry.event_type == EventType::QueryRejected {
            return false;
        }
        true
    }
}
