//! Tamper-evident audit log.
//!
//! Entries form a hash chain: each append records the previous entry's hash
//! and its own SHA-256 over a canonical sorted-keys JSON rendering. The
//! buffer is bounded; overflow truncates from the head, and the retained
//! suffix stays verifiable by treating the first retained entry as the chain
//! head. An eviction hook lets a collaborator archive truncated entries.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::{
    AuditExport, AuditFilter, AuditLogEntry, EventType, PrivacyEvent, PrivacyMethod, QueryEvent,
};

type EvictionHook = Box<dyn Fn(&AuditLogEntry) + Send + Sync>;

struct ChainState {
    entries: VecDeque<AuditLogEntry>,
    last_hash: Option<String>,
}

pub struct AuditLogger {
    state: Mutex<ChainState>,
    eviction_hooks: Mutex<Vec<EvictionHook>>,
    max_entries: usize,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuditStatistics {
    pub total_entries: usize,
    pub by_event_type: HashMap<String, usize>,
    pub by_user: HashMap<String, usize>,
    pub by_privacy_method: HashMap<String, usize>,
    pub rejected_queries: usize,
    pub total_epsilon_consumed: f64,
}

impl AuditLogger {
    pub fn new(max_entries: usize) -> Self {
        Self {
            state: Mutex::new(ChainState {
                entries: VecDeque::new(),
                last_hash: None,
            }),
            eviction_hooks: Mutex::new(Vec::new()),
            max_entries: max_entries.max(1),
        }
    }

    /// Register a hook invoked for every entry truncated from the head.
    pub fn on_evict<F>(&self, hook: F)
    where
        F: Fn(&AuditLogEntry) + Send + Sync + 'static,
    {
        if let Ok(mut hooks) = self.eviction_hooks.lock() {
            hooks.push(Box::new(hook));
        }
    }

    fn generate_entry_id() -> String {
        format!("audit_{}", &Uuid::new_v4().simple().to_string()[..16])
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, ChainState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn add_entry(
        &self,
        event_type: EventType,
        user_id: &str,
        query_event: Option<QueryEvent>,
        privacy_event: Option<PrivacyEvent>,
        rejection_reason: Option<String>,
        metadata: Map<String, Value>,
    ) -> AuditLogEntry {
        let mut state = self.lock_state();

        let mut entry = AuditLogEntry {
            entry_id: Self::generate_entry_id(),
            event_type,
            timestamp: Utc::now(),
            user_id: user_id.to_string(),
            query_event,
            privacy_event,
            rejection_reason,
            metadata,
            previous_hash: state.last_hash.clone(),
            entry_hash: String::new(),
        };
        entry.entry_hash = entry.compute_hash();
        state.last_hash = Some(entry.entry_hash.clone());
        state.entries.push_back(entry.clone());

        while state.entries.len() > self.max_entries {
            if let Some(evicted) = state.entries.pop_front() {
                if let Ok(hooks) = self.eviction_hooks.lock() {
                    for hook in hooks.iter() {
                        hook(&evicted);
                    }
                }
            }
        }

        entry
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_query_submitted(
        &self,
        query_id: &str,
        user_id: &str,
        original_sql: &str,
        tables: Vec<String>,
        columns: Vec<String>,
        is_aggregation: bool,
        has_joins: bool,
        has_subqueries: bool,
    ) -> AuditLogEntry {
        let mut query_event = QueryEvent::new(query_id, user_id, original_sql);
        query_event.tables_accessed = tables;
        query_event.columns_accessed = columns;
        query_event.query_type = "SELECT".to_string();
        query_event.is_aggregation = is_aggregation;
        query_event.has_joins = has_joins;
        query_event.has_subqueries = has_subqueries;

        self.add_entry(
            EventType::QuerySubmitted,
            user_id,
            Some(query_event),
            None,
            None,
            Map::new(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn log_privacy_applied(
        &self,
        query_id: &str,
        user_id: &str,
        privacy_method: PrivacyMethod,
        epsilon: Option<f64>,
        delta: Option<f64>,
        sensitivity: Option<f64>,
        columns_protected: Vec<String>,
    ) -> AuditLogEntry {
        let mut privacy_event = PrivacyEvent::new(query_id, privacy_method);
        privacy_event.epsilon = epsilon;
        privacy_event.delta = delta;
        privacy_event.sensitivity = sensitivity;
        privacy_event.columns_protected = columns_protected;

        self.add_entry(
            EventType::PrivacyApplied,
            user_id,
            None,
            Some(privacy_event),
            None,
            Map::new(),
        )
    }

    pub fn log_query_rejected(
        &self,
        query_id: &str,
        user_id: &str,
        original_sql: &str,
        rejection_reason: &str,
    ) -> AuditLogEntry {
        let query_event = QueryEvent::new(query_id, user_id, original_sql);
        self.add_entry(
            EventType::QueryRejected,
            user_id,
            Some(query_event),
            None,
            Some(rejection_reason.to_string()),
            Map::new(),
        )
    }

    pub fn log_budget_consumed(
        &self,
        user_id: &str,
        query_id: &str,
        epsilon_consumed: f64,
        remaining_budget: f64,
    ) -> AuditLogEntry {
        let mut metadata = Map::new();
        metadata.insert("query_id".to_string(), json!(query_id));
        metadata.insert("epsilon_consumed".to_string(), json!(epsilon_consumed));
        metadata.insert("remaining_budget".to_string(), json!(remaining_budget));

        self.add_entry(EventType::BudgetConsumed, user_id, None, None, None, metadata)
    }

    pub fn log_budget_reset(
        &self,
        user_id: &str,
        new_budget: f64,
        reset_reason: &str,
    ) -> AuditLogEntry {
        let mut metadata = Map::new();
        metadata.insert("new_budget".to_string(), json!(new_budget));
        metadata.insert("reset_reason".to_string(), json!(reset_reason));

        self.add_entry(EventType::BudgetReset, user_id, None, None, None, metadata)
    }

    pub fn log_config_changed(&self, user_id: &str, config_type: &str, changes: Value) -> AuditLogEntry {
        let mut metadata = Map::new();
        metadata.insert("config_type".to_string(), json!(config_type));
        metadata.insert("changes".to_string(), changes);

        self.add_entry(EventType::ConfigChanged, user_id, None, None, None, metadata)
    }

    pub fn log_system_error(
        &self,
        user_id: &str,
        error_type: &str,
        error_message: &str,
        query_id: Option<&str>,
    ) -> AuditLogEntry {
        let mut metadata = Map::new();
        metadata.insert("error_type".to_string(), json!(error_type));
        metadata.insert("error_message".to_string(), json!(error_message));
        metadata.insert("query_id".to_string(), json!(query_id));

        self.add_entry(EventType::SystemError, user_id, None, None, None, metadata)
    }

    pub fn filter_logs(&self, filter: &AuditFilter) -> Vec<AuditLogEntry> {
        let state = self.lock_state();
        state
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .skip(filter.offset)
            .take(filter.limit)
            .cloned()
            .collect()
    }

    pub fn get_logs_by_user(&self, user_id: &str, limit: usize) -> Vec<AuditLogEntry> {
        self.filter_logs(&AuditFilter {
            user_id: Some(user_id.to_string()),
            limit,
            ..Default::default()
        })
    }

    pub fn get_logs_by_query(&self, query_id: &str) -> Vec<AuditLogEntry> {
        self.filter_logs(&AuditFilter {
            query_id: Some(query_id.to_string()),
            limit: 1000,
            ..Default::default()
        })
    }

    pub fn get_logs_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        limit: usize,
    ) -> Vec<AuditLogEntry> {
        self.filter_logs(&AuditFilter {
            start_time: Some(start_time),
            end_time: Some(end_time),
            limit,
            ..Default::default()
        })
    }

    /// Recompute every entry hash and verify the previous/current linkage.
    /// The first retained entry is treated as the chain head.
    pub fn verify_chain_integrity(&self) -> bool {
        let state = self.lock_state();
        let entries = &state.entries;
        if entries.is_empty() {
            return true;
        }

        if !entries[0].verify_integrity() {
            return false;
        }
        for i in 1..entries.len() {
            if !entries[i].verify_integrity() {
                return false;
            }
            if entries[i].previous_hash.as_deref() != Some(entries[i - 1].entry_hash.as_str()) {
                return false;
            }
        }
        true
    }

    fn collect(&self, filter: Option<&AuditFilter>) -> Vec<AuditLogEntry> {
        match filter {
            Some(filter) => self.filter_logs(filter),
            None => self.lock_state().entries.iter().cloned().collect(),
        }
    }

    pub fn export_json(&self, filter: Option<&AuditFilter>) -> anyhow::Result<String> {
        let entries = self.collect(filter);
        let export = AuditExport {
            export_timestamp: Utc::now(),
            total_entries: entries.len(),
            entries: serde_json::to_value(&entries)?,
        };
        Ok(serde_json::to_string_pretty(&export)?)
    }

    /// Fixed-header CSV for compliance reporting.
    pub fn export_csv(&self, filter: Option<&AuditFilter>) -> String {
        let entries = self.collect(filter);

        let mut lines = vec![
            "entry_id,event_type,timestamp,user_id,query_id,privacy_method,epsilon,rejection_reason"
                .to_string(),
        ];

        for entry in entries {
            let mut query_id = String::new();
            let mut privacy_method = String::new();
            let mut epsilon = String::new();

            if let Some(query_event) = &entry.query_event {
                query_id = query_event.query_id.clone();
            }
            if let Some(privacy_event) = &entry.privacy_event {
                query_id = privacy_event.query_id.clone();
                privacy_method = privacy_event.privacy_method.as_str().to_string();
                if let Some(value) = privacy_event.epsilon {
                    epsilon = value.to_string();
                }
            }

            let mut rejection = entry.rejection_reason.clone().unwrap_or_default();
            rejection = rejection.replace('"', "\"\"");
            if rejection.contains(',') || rejection.contains('"') {
                rejection = format!("\"{}\"", rejection);
            }

            lines.push(format!(
                "{},{},{},{},{},{},{},{}",
                entry.entry_id,
                entry.event_type.as_str(),
                entry.timestamp.to_rfc3339(),
                entry.user_id,
                query_id,
                privacy_method,
                epsilon,
                rejection
            ));
        }

        lines.join("\n")
    }

    pub fn get_statistics(
        &self,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
    ) -> AuditStatistics {
        let entries = self.filter_logs(&AuditFilter {
            start_time,
            end_time,
            limit: usize::MAX,
            ..Default::default()
        });

        let mut stats = AuditStatistics {
            total_entries: entries.len(),
            by_event_type: HashMap::new(),
            by_user: HashMap::new(),
            by_privacy_method: HashMap::new(),
            rejected_queries: 0,
            total_epsilon_consumed: 0.0,
        };

        for entry in &entries {
            *stats
                .by_event_type
                .entry(entry.event_type.as_str().to_string())
                .or_insert(0) += 1;
            *stats.by_user.entry(entry.user_id.clone()).or_insert(0) += 1;

            if entry.event_type == EventType::QueryRejected {
                stats.rejected_queries += 1;
            }

            if let Some(privacy_event) = &entry.privacy_event {
                *stats
                    .by_privacy_method
                    .entry(privacy_event.privacy_method.as_str().to_string())
                    .or_insert(0) += 1;
                if let Some(epsilon) = privacy_event.epsilon {
                    stats.total_epsilon_consumed += epsilon;
                }
            }
        }

        stats
    }

    pub fn entry_count(&self) -> usize {
        self.lock_state().entries.len()
    }

    /// Testing hook: mutate an entry in place to exercise tamper detection.
    #[cfg(test)]
    pub fn tamper_with_entry(&self, index: usize, mutate: impl FnOnce(&mut AuditLogEntry)) {
        let mut state = self.lock_state();
        if let Some(entry) = state.entries.get_mut(index) {
            mutate(entry);
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.entries.clear();
        state.last_hash = None;
    }
}
