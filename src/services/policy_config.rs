//! Policy configuration: load, hot-reload, and change notification.
//!
//! The policy document is a TOML file describing rules, the sensitive-column
//! set, roles, column patterns, table policies, and classification rules.
//! Readers always observe a consistent snapshot (an `Arc` swapped under a
//! write lock); reload callbacks fire after the new document is installed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::models::DataClassification;

/// Role-scoped privacy parameters and access lists
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleConfig {
    #[serde(skip)]
    pub name: String,
    pub epsilon: f64,
    pub delta: f64,
    pub max_queries_per_day: u32,
    pub allowed_tables: Vec<String>,
    pub denied_tables: Vec<String>,
    pub allowed_columns: Vec<String>,
    pub denied_columns: Vec<String>,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            epsilon: 1.0,
            delta: 1e-5,
            max_queries_per_day: 1000,
            allowed_tables: Vec::new(),
            denied_tables: Vec::new(),
            allowed_columns: Vec::new(),
            denied_columns: Vec::new(),
        }
    }
}

/// Parameters a rule or pattern may attach to its action
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionParams {
    pub epsilon: Option<f64>,
    pub delta: Option<f64>,
    pub mechanism: Option<String>,
    pub method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRule {
    pub condition: String,
    pub action: String,
    pub params: ActionParams,
}

impl Default for PolicyRule {
    fn default() -> Self {
        Self {
            condition: String::new(),
            action: "PASS".to_string(),
            params: ActionParams::default(),
        }
    }
}

/// Column-name pattern rule as written in the config file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnPatternConfig {
    pub pattern: String,
    pub classification: DataClassification,
    pub privacy_method: String,
    pub params: ActionParams,
}

impl Default for ColumnPatternConfig {
    fn default() -> Self {
        Self {
            pattern: String::new(),
            classification: DataClassification::Internal,
            privacy_method: "DeID".to_string(),
            params: ActionParams::default(),
        }
    }
}

/// Compiled column pattern, anchored at the start and case-insensitive
#[derive(Debug, Clone)]
pub struct ColumnPattern {
    pub pattern: String,
    pub regex: Regex,
    pub classification: DataClassification,
    pub privacy_method: String,
    pub params: ActionParams,
}

impl ColumnPattern {
    pub fn matches(&self, column_name: &str) -> bool {
        self.regex.is_match(column_name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TablePolicy {
    #[serde(skip)]
    pub table_name: String,
    pub classification: DataClassification,
    pub default_epsilon: f64,
    pub column_policies: HashMap<String, ActionParams>,
}

impl Default for TablePolicy {
    fn default() -> Self {
        Self {
            table_name: String::new(),
            classification: DataClassification::Internal,
            default_epsilon: 1.0,
            column_policies: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassificationRule {
    pub epsilon: f64,
    pub allow_raw: bool,
}

impl Default for ClassificationRule {
    fn default() -> Self {
        Self {
            epsilon: 1.0,
            allow_raw: false,
        }
    }
}

/// The full policy document
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyDocument {
    pub rules: Vec<PolicyRule>,
    pub sensitive_columns: Vec<String>,
    pub default_epsilon: f64,
    pub roles: HashMap<String, RoleConfig>,
    pub column_patterns: Vec<ColumnPatternConfig>,
    pub table_policies: HashMap<String, TablePolicy>,
    pub classification_rules: HashMap<String, ClassificationRule>,
}

impl Default for PolicyDocument {
    fn default() -> Self {
        let mut classification_rules = HashMap::new();
        classification_rules.insert(
            "public".to_string(),
            ClassificationRule {
                epsilon: 2.0,
                allow_raw: true,
            },
        );
        classification_rules.insert(
            "internal".to_string(),
            ClassificationRule {
                epsilon: 1.0,
                allow_raw: false,
            },
        );
        classification_rules.insert(
            "confidential".to_string(),
            ClassificationRule {
                epsilon: 0.5,
                allow_raw: false,
            },
        );
        classification_rules.insert(
            "restricted".to_string(),
            ClassificationRule {
                epsilon: 0.1,
                allow_raw: false,
            },
        );

        Self {
            rules: vec![
                PolicyRule {
                    condition: "aggregations".to_string(),
                    action: "DP".to_string(),
                    params: ActionParams {
                        epsilon: Some(1.0),
                        mechanism: Some("laplace".to_string()),
                        ..Default::default()
                    },
                },
                PolicyRule {
                    condition: "sensitive_columns".to_string(),
                    action: "DeID".to_string(),
                    params: ActionParams {
                        method: Some("hash".to_string()),
                        ..Default::default()
                    },
                },
            ],
            sensitive_columns: ["name", "email", "phone", "id_card", "ssn", "mobile"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            default_epsilon: 1.0,
            roles: HashMap::new(),
            column_patterns: Vec::new(),
            table_policies: HashMap::new(),
            classification_rules,
        }
    }
}

type ReloadCallback = Box<dyn Fn(&PolicyDocument, &PolicyDocument) + Send + Sync>;

/// Thread-safe policy document holder with optional file backing
pub struct PolicyConfigManager {
    config_path: Option<PathBuf>,
    current: RwLock<Arc<PolicyDocument>>,
    last_modified: Mutex<Option<SystemTime>>,
    reload_callbacks: Mutex<Vec<ReloadCallback>>,
    watcher_shutdown: Arc<AtomicBool>,
    watcher_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PolicyConfigManager {
    /// Load from a TOML file; a missing or unreadable file falls back to the
    /// documented defaults.
    pub fn new(config_path: Option<PathBuf>) -> Self {
        let (document, mtime) = match &config_path {
            Some(path) => match Self::load_file(path) {
                Ok(loaded) => loaded,
                Err(err) => {
                    tracing::warn!(
                        "Failed to load policy config from {}: {} (using defaults)",
                        path.display(),
                        err
                    );
                    (PolicyDocument::default(), None)
                }
            },
            None => (PolicyDocument::default(), None),
        };

        Self {
            config_path,
            current: RwLock::new(Arc::new(document)),
            last_modified: Mutex::new(mtime),
            reload_callbacks: Mutex::new(Vec::new()),
            watcher_shutdown: Arc::new(AtomicBool::new(false)),
            watcher_handle: Mutex::new(None),
        }
    }

    fn load_file(path: &Path) -> anyhow::Result<(PolicyDocument, Option<SystemTime>)> {
        let content = std::fs::read_to_string(path)?;
        let document: PolicyDocument = toml::from_str(&content)?;
        let mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
        Ok((document, mtime))
    }

    /// Consistent snapshot of the current document.
    pub fn current(&self) -> Arc<PolicyDocument> {
        self.current
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_default()
    }

    pub fn get_default_epsilon(&self) -> f64 {
        self.current().default_epsilon
    }

    pub fn get_sensitive_columns(&self) -> Vec<String> {
        self.current().sensitive_columns.clone()
    }

    pub fn get_role_config(&self, role_name: &str) -> Option<RoleConfig> {
        self.current().roles.get(role_name).map(|role| {
            let mut role = role.clone();
            role.name = role_name.to_string();
            role
        })
    }

    /// Column patterns with their regexes compiled (case-insensitive,
    /// anchored at the column-name start). Invalid patterns are skipped with
    /// a warning.
    pub fn get_column_patterns(&self) -> Vec<ColumnPattern> {
        self.current()
            .column_patterns
            .iter()
            .filter_map(|config| {
                let anchored = format!("(?i)^(?:{})", config.pattern);
                match Regex::new(&anchored) {
                    Ok(regex) => Some(ColumnPattern {
                        pattern: config.pattern.clone(),
                        regex,
                        classification: config.classification,
                        privacy_method: config.privacy_method.clone(),
                        params: config.params.clone(),
                    }),
                    Err(err) => {
                        tracing::warn!(
                            "Skipping invalid column pattern '{}': {}",
                            config.pattern,
                            err
                        );
                        None
                    }
                }
            })
            .collect()
    }

    pub fn get_table_policy(&self, table_name: &str) -> Option<TablePolicy> {
        self.current().table_policies.get(table_name).map(|policy| {
            let mut policy = policy.clone();
            policy.table_name = table_name.to_string();
            policy
        })
    }

    pub fn get_classification_rule(&self, classification: DataClassification) -> ClassificationRule {
        self.current()
            .classification_rules
            .get(classification.as_str())
            .copied()
            .unwrap_or_default()
    }

    /// Re-read the backing file and notify subscribers. Errors keep the
    /// previous document in place.
    pub fn reload(&self) {
        let Some(path) = &self.config_path else {
            return;
        };

        let (new_document, mtime) = match Self::load_file(path) {
            Ok(loaded) => loaded,
            Err(err) => {
                tracing::warn!("Policy config reload failed: {} (keeping previous)", err);
                return;
            }
        };

        let new_arc = Arc::new(new_document);
        let old_arc = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let old = Arc::clone(&guard);
            *guard = Arc::clone(&new_arc);
            old
        };
        if let Ok(mut last) = self.last_modified.lock() {
            *last = mtime;
        }

        tracing::info!("Policy configuration reloaded from {}", path.display());

        if let Ok(callbacks) = self.reload_callbacks.lock() {
            for callback in callbacks.iter() {
                callback(&old_arc, &new_arc);
            }
        }
    }

    /// Register a callback receiving (old, new) after every reload.
    pub fn on_reload<F>(&self, callback: F)
    where
        F: Fn(&PolicyDocument, &PolicyDocument) + Send + Sync + 'static,
    {
        if let Ok(mut callbacks) = self.reload_callbacks.lock() {
            callbacks.push(Box::new(callback));
        }
    }

    /// Mutate the in-process document, persisting to the backing file when
    /// one is configured.
    pub fn update_config<F>(&self, mutate: F)
    where
        F: FnOnce(&mut PolicyDocument),
    {
        let updated = {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(_) => return,
            };
            let mut document = (**guard).clone();
            mutate(&mut document);
            let updated = Arc::new(document);
            *guard = Arc::clone(&updated);
            updated
        };

        if let Some(path) = &self.config_path {
            match toml::to_string_pretty(&*updated) {
                Ok(serialized) => {
                    if let Err(err) = std::fs::write(path, serialized) {
                        tracing::warn!("Failed to persist policy config: {}", err);
                    }
                }
                Err(err) => tracing::warn!("Failed to serialize policy config: {}", err),
            }
        }
    }

    /// Install an in-memory document directly (tests and embedding).
    pub fn from_document(document: PolicyDocument) -> Self {
        Self {
            config_path: None,
            current: RwLock::new(Arc::new(document)),
            last_modified: Mutex::new(None),
            reload_callbacks: Mutex::new(Vec::new()),
            watcher_shutdown: Arc::new(AtomicBool::new(false)),
            watcher_handle: Mutex::new(None),
        }
    }

    /// Poll the backing file's mtime once per second, reloading when it
    /// advances. Explicit stop via [`stop_watcher`](Self::stop_watcher).
    pub fn start_watcher(self: &Arc<Self>) {
        if self.config_path.is_none() {
            return;
        }
        let mut handle_guard = match self.watcher_handle.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        if handle_guard.is_some() {
            return;
        }

        self.watcher_shutdown.store(false, Ordering::Relaxed);
        let manager = Arc::clone(self);
        let shutdown = Arc::clone(&self.watcher_shutdown);

        let handle = tokio::spawn(async move {
            tracing::info!("Policy config watcher started");
            while !shutdown.load(Ordering::Relaxed) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                let Some(path) = &manager.config_path else {
                    break;
                };
                let current_mtime = std::fs::metadata(path).and_then(|m| m.modified()).ok();
                let changed = {
                    let last = manager.last_modified.lock().ok().and_then(|g| *g);
                    match (current_mtime, last) {
                        (Some(current), Some(last)) => current > last,
                        (Some(_), None) => true,
                        _ => false,
                    }
                };
                if changed {
                    manager.reload();
                }
            }
            tracing::info!("Policy config watcher stopped");
        });
        *handle_guard = Some(handle);
    }

    /// Signal the watcher and wait for it to exit (bounded).
    pub async fn stop_watcher(&self) {
        self.watcher_shutdown.store(true, Ordering::Relaxed);
        let handle = self.watcher_handle.lock().ok().and_then(|mut g| g.take());
        if let Some(handle) = handle {
            let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_document() {
        let manager = PolicyConfigManager::new(None);
        assert_eq!(manager.get_default_epsilon(), 1.0);
        let sensitive = manager.get_sensitive_columns();
        assert!(sensitive.contains(&"email".to_string()));
        assert!(sensitive.contains(&"ssn".to_string()));
        assert_eq!(sensitive.len(), 6);
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let manager = PolicyConfigManager::new(Some(PathBuf::from("/nonexistent/policy.toml")));
        assert_eq!(manager.get_default_epsilon(), 1.0);
    }

    #[test]
    fn test_classification_rule_defaults() {
        let manager = PolicyConfigManager::new(None);
        assert_eq!(
            manager
                .get_classification_rule(DataClassification::Restricted)
                .epsilon,
            0.1
        );
        assert!(
            manager
                .get_classification_rule(DataClassification::Public)
                .allow_raw
        );
    }

    #[test]
    fn test_column_pattern_matching() {
        let mut document = PolicyDocument::default();
        document.column_patterns.push(ColumnPatternConfig {
            pattern: "ssn.*".to_string(),
            classification: DataClassification::Restricted,
            privacy_method: "DeID".to_string(),
            params: ActionParams::default(),
        });
        let manager = PolicyConfigManager::from_document(document);

        let patterns = manager.get_column_patterns();
        assert_eq!(patterns.len(), 1);
        assert!(patterns[0].matches("ssn_number"));
        assert!(patterns[0].matches("SSN"));
        assert!(!patterns[0].matches("user_ssn"));
    }

    #[test]
    fn test_update_config_visible_to_readers() {
        let manager = PolicyConfigManager::new(None);
        manager.update_config(|doc| doc.default_epsilon = 0.25);
        assert_eq!(manager.get_default_epsilon(), 0.25);
    }

    #[test]
    fn test_role_config_lookup() {
        let mut document = PolicyDocument::default();
        document.roles.insert(
            "analyst".to_string(),
            RoleConfig {
                epsilon: 0.5,
                denied_tables: vec!["salaries".to_string()],
                ..Default::default()
            },
        );
        let manager = PolicyConfigManager::from_document(document);

        let role = manager.get_role_config("analyst").unwrap();
        assert_eq!(role.name, "analyst");
        assert_eq!(role.epsilon, 0.5);
        assert!(manager.get_role_config("missing").is_none());
    }
}
