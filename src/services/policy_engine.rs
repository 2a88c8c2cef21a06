//! Policy evaluation: maps an `AnalysisResult` plus caller role to a
//! `PolicyDecision`. First match wins, in this order: invalid SQL, role
//! table denial, role allow-list, column patterns, aggregation, sensitive
//! columns, pass-through.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use crate::models::{
    AnalysisResult, DataClassification, DecisionParams, PolicyAction, PolicyDecision,
};
use crate::services::policy_config::{ColumnPattern, PolicyConfigManager, RoleConfig};

pub struct PolicyEngine {
    config: Arc<PolicyConfigManager>,
    sensitive_columns: Arc<RwLock<Vec<String>>>,
}

impl PolicyEngine {
    /// Builds the engine and subscribes it to config reloads so the cached
    /// sensitive-column set refreshes atomically.
    pub fn new(config: Arc<PolicyConfigManager>) -> Self {
        let sensitive_columns = Arc::new(RwLock::new(Self::lowered(
            config.get_sensitive_columns(),
        )));

        let cache = Arc::clone(&sensitive_columns);
        config.on_reload(move |_old, new| {
            if let Ok(mut guard) = cache.write() {
                *guard = Self::lowered(new.sensitive_columns.clone());
            }
        });

        Self {
            config,
            sensitive_columns,
        }
    }

    fn lowered(columns: Vec<String>) -> Vec<String> {
        columns.into_iter().map(|c| c.to_lowercase()).collect()
    }

    pub fn evaluate(
        &self,
        analysis: &AnalysisResult,
        user_role: Option<&str>,
    ) -> PolicyDecision {
        if !analysis.is_valid {
            let message = analysis
                .error
                .as_deref()
                .unwrap_or("analysis failed")
                .to_string();
            return PolicyDecision::reject(format!("Invalid SQL: {}", message));
        }

        let role_config = user_role.and_then(|role| self.config.get_role_config(role));

        if let Some(role) = &role_config {
            if let Some(rejection) = self.check_table_access(analysis, role) {
                return rejection;
            }
        }

        let classification = self.highest_classification(analysis);

        if let Some(mut decision) = self.check_column_patterns(analysis) {
            decision.classification = Some(classification);
            decision.role_applied = user_role.map(String::from);
            return decision;
        }

        if analysis.is_aggregate_query {
            let mut decision = self.create_dp_decision(analysis, role_config.as_ref(), classification);
            decision.role_applied = user_role.map(String::from);
            return decision;
        }

        if self.has_sensitive_columns(analysis) || self.has_role_denied_columns(analysis, role_config.as_ref()) {
            let mut decision = self.create_deid_decision(analysis, role_config.as_ref());
            decision.classification = Some(classification);
            decision.role_applied = user_role.map(String::from);
            return decision;
        }

        PolicyDecision {
            action: PolicyAction::Pass,
            params: DecisionParams::default(),
            matched_rule: None,
            reason: "No privacy protection required".to_string(),
            classification: Some(classification),
            role_applied: user_role.map(String::from),
        }
    }

    fn check_table_access(
        &self,
        analysis: &AnalysisResult,
        role: &RoleConfig,
    ) -> Option<PolicyDecision> {
        for table in &analysis.tables {
            if role.denied_tables.contains(table) {
                return Some(
                    PolicyDecision::reject(format!("Access denied to table: {}", table))
                        .with_rule("role_table_deny"),
                );
            }
        }

        if !role.allowed_tables.is_empty() {
            for table in &analysis.tables {
                if !role.allowed_tables.contains(table) {
                    return Some(
                        PolicyDecision::reject(format!("Table not in allowed list: {}", table))
                            .with_rule("role_table_allow"),
                    );
                }
            }
        }

        None
    }

    /// Most severe classification across the queried tables; PUBLIC when no
    /// table policy is configured.
    fn highest_classification(&self, analysis: &AnalysisResult) -> DataClassification {
        analysis
            .tables
            .iter()
            .filter_map(|table| self.config.get_table_policy(table))
            .map(|policy| policy.classification)
            .max()
            .unwrap_or(DataClassification::Public)
    }

    fn check_column_patterns(&self, analysis: &AnalysisResult) -> Option<PolicyDecision> {
        let patterns = self.config.get_column_patterns();
        for column in &analysis.select_columns {
            for pattern in &patterns {
                if pattern.matches(column) {
                    return Some(self.pattern_decision(pattern, column));
                }
            }
        }
        None
    }

    /// Config patterns may name DP/DeID/MASK/ENCRYPT; MASK and ENCRYPT are
    /// modeled as DeID variants.
    fn pattern_decision(&self, pattern: &ColumnPattern, column: &str) -> PolicyDecision {
        let matched_rule = format!("pattern:{}", pattern.pattern);
        let reason = format!("Column {} matches pattern {}", column, pattern.pattern);

        match pattern.privacy_method.to_uppercase().as_str() {
            "DP" => PolicyDecision {
                action: PolicyAction::Dp,
                params: DecisionParams {
                    epsilon: Some(
                        pattern
                            .params
                            .epsilon
                            .unwrap_or_else(|| self.config.get_default_epsilon()),
                    ),
                    delta: Some(pattern.params.delta.unwrap_or(1e-5)),
                    sensitivity: Some(1.0),
                    mechanism: Some(
                        pattern
                            .params
                            .mechanism
                            .clone()
                            .unwrap_or_else(|| "laplace".to_string()),
                    ),
                    method: None,
                    columns: vec![column.to_string()],
                },
                matched_rule: Some(matched_rule),
                reason,
                classification: Some(pattern.classification),
                role_applied: None,
            },
            method_name => {
                let default_method = match method_name {
                    "MASK" => "mask_name",
                    _ => "hash",
                };
                PolicyDecision {
                    action: PolicyAction::DeId,
                    params: DecisionParams {
                        method: Some(
                            pattern
                                .params
                                .method
                                .clone()
                                .unwrap_or_else(|| default_method.to_string()),
                        ),
                        columns: vec![column.to_string()],
                        ..Default::default()
                    },
                    matched_rule: Some(matched_rule),
                    reason,
                    classification: Some(pattern.classification),
                    role_applied: None,
                }
            }
        }
    }

    fn has_sensitive_columns(&self, analysis: &AnalysisResult) -> bool {
        let Ok(sensitive) = self.sensitive_columns.read() else {
            return false;
        };
        analysis
            .select_columns
            .iter()
            .any(|column| sensitive.contains(&column.to_lowercase()))
    }

    fn has_role_denied_columns(
        &self,
        analysis: &AnalysisResult,
        role: Option<&RoleConfig>,
    ) -> bool {
        let Some(role) = role else {
            return false;
        };
        let denied: HashSet<String> = role
            .denied_columns
            .iter()
            .map(|c| c.to_lowercase())
            .collect();
        analysis
            .select_columns
            .iter()
            .any(|column| denied.contains(&column.to_lowercase()))
    }

    fn create_dp_decision(
        &self,
        analysis: &AnalysisResult,
        role: Option<&RoleConfig>,
        classification: DataClassification,
    ) -> PolicyDecision {
        let mut epsilon = self.config.get_default_epsilon();
        let mut delta = 1e-5;
        if let Some(role) = role {
            epsilon = role.epsilon;
            delta = role.delta;
        }

        // The classification tier caps epsilon at its stricter value.
        let class_epsilon = self.config.get_classification_rule(classification).epsilon;
        epsilon = epsilon.min(class_epsilon);

        let aggregations: Vec<&str> = analysis
            .aggregations
            .iter()
            .map(|agg| agg.keyword())
            .collect();

        PolicyDecision {
            action: PolicyAction::Dp,
            params: DecisionParams {
                epsilon: Some(epsilon),
                delta: Some(delta),
                sensitivity: Some(1.0),
                mechanism: Some("laplace".to_string()),
                method: None,
                columns: Vec::new(),
            },
            matched_rule: Some("aggregation_rule".to_string()),
            reason: format!("Aggregation detected: {}", aggregations.join(", ")),
            classification: Some(classification),
            role_applied: None,
        }
    }

    fn create_deid_decision(
        &self,
        analysis: &AnalysisResult,
        role: Option<&RoleConfig>,
    ) -> PolicyDecision {
        let mut columns: Vec<String> = Vec::new();
        if let Ok(sensitive) = self.sensitive_columns.read() {
            for column in &analysis.select_columns {
                if sensitive.contains(&column.to_lowercase()) {
                    columns.push(column.clone());
                }
            }
        }

        if let Some(role) = role {
            let denied: HashSet<String> = role
                .denied_columns
                .iter()
                .map(|c| c.to_lowercase())
                .collect();
            for column in &analysis.select_columns {
                if denied.contains(&column.to_lowercase()) && !columns.contains(column) {
                    columns.push(column.clone());
                }
            }
        }

        PolicyDecision {
            action: PolicyAction::DeId,
            params: DecisionParams {
                method: Some("hash".to_string()),
                columns: columns.clone(),
                ..Default::default()
            },
            matched_rule: Some("sensitive_column_rule".to_string()),
            reason: format!("Sensitive columns detected: {}", columns.join(", ")),
            classification: None,
            role_applied: None,
        }
    }

    /// Most restrictive action wins; multiple DP decisions merge to the
    /// minimum epsilon.
    pub fn resolve_policy_conflicts(&self, decisions: Vec<PolicyDecision>) -> PolicyDecision {
        let Some(winner) = decisions
            .iter()
            .max_by_key(|d| d.action.priority())
            .cloned()
        else {
            return PolicyDecision::pass("No policies to apply");
        };

        let mut winner = winner;
        if winner.action == PolicyAction::Dp {
            let min_epsilon = decisions
                .iter()
                .filter(|d| d.action == PolicyAction::Dp)
                .filter_map(|d| d.params.epsilon)
                .fold(f64::INFINITY, f64::min);
            if min_epsilon.is_finite() && Some(min_epsilon) != winner.params.epsilon {
                winner.params.epsilon = Some(min_epsilon);
                winner
                    .reason
                    .push_str(&format!(" (most restrictive epsilon: {})", min_epsilon));
            }
        }
        winner
    }

    pub fn add_sensitive_column(&self, column: &str) {
        if let Ok(mut sensitive) = self.sensitive_columns.write() {
            let lowered = column.to_lowercase();
            if !sensitive.contains(&lowered) {
                sensitive.push(lowered);
            }
        }
    }

    pub fn remove_sensitive_column(&self, column: &str) {
        if let Ok(mut sensitive) = self.sensitive_columns.write() {
            let lowered = column.to_lowercase();
            sensitive.retain(|c| c != &lowered);
        }
    }

    pub fn sensitive_columns(&self) -> Vec<String> {
        self.sensitive_columns
            .read()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}
