// Policy engine decision ordering and configuration interplay.

use std::sync::Arc;

use crate::models::{DataClassification, PolicyAction, PolicyDecision};
use crate::services::policy_config::{
    ActionParams, ColumnPatternConfig, PolicyConfigManager, PolicyDocument, RoleConfig,
    TablePolicy,
};
use crate::services::{PolicyEngine, SqlAnalyzer};

fn engine_with(document: PolicyDocument) -> (Arc<PolicyConfigManager>, PolicyEngine) {
    let config = Arc::new(PolicyConfigManager::from_document(document));
    let engine = PolicyEngine::new(Arc::clone(&config));
    (config, engine)
}

#[test]
fn test_invalid_analysis_rejected_first() {
    let (_, engine) = engine_with(PolicyDocument::default());
    let analysis = crate::models::AnalysisResult::invalid("", "empty SQL statement");

    let decision = engine.evaluate(&analysis, Some("admin"));
    assert_eq!(decision.action, PolicyAction::Reject);
    assert!(decision.reason.contains("empty SQL statement"));
}

#[test]
fn test_role_deny_takes_precedence_over_aggregation() {
    let mut document = PolicyDocument::default();
    document.roles.insert(
        "intern".to_string(),
        RoleConfig {
            denied_tables: vec!["salaries".to_string()],
            ..Default::default()
        },
    );
    let (_, engine) = engine_with(document);

    let analysis = SqlAnalyzer::new().analyze("SELECT COUNT(*) FROM salaries");
    let decision = engine.evaluate(&analysis, Some("intern"));

    assert_eq!(decision.action, PolicyAction::Reject);
    assert_eq!(decision.matched_rule.as_deref(), Some("role_table_deny"));
}

#[test]
fn test_allow_list_rejects_unlisted_tables() {
    let mut document = PolicyDocument::default();
    document.roles.insert(
        "analyst".to_string(),
        RoleConfig {
            allowed_tables: vec!["orders".to_string()],
            ..Default::default()
        },
    );
    let (_, engine) = engine_with(document);

    let allowed = SqlAnalyzer::new().analyze("SELECT COUNT(*) FROM orders");
    assert_eq!(
        engine.evaluate(&allowed, Some("analyst")).action,
        PolicyAction::Dp
    );

    let denied = SqlAnalyzer::new().analyze("SELECT COUNT(*) FROM users");
    let decision = engine.evaluate(&denied, Some("analyst"));
    assert_eq!(decision.action, PolicyAction::Reject);
    assert_eq!(decision.matched_rule.as_deref(), Some("role_table_allow"));
}

#[test]
fn test_column_pattern_beats_aggregation_rule() {
    let mut document = PolicyDocument::default();
    document.column_patterns.push(ColumnPatternConfig {
        pattern: "salary_.*".to_string(),
        classification: DataClassification::Restricted,
        privacy_method: "DP".to_string(),
        params: ActionParams {
            epsilon: Some(0.1),
            ..Default::default()
        },
    });
    let (_, engine) = engine_with(document);

    let analysis = SqlAnalyzer::new().analyze("SELECT salary_band FROM employees");
    let decision = engine.evaluate(&analysis, None);

    assert_eq!(decision.action, PolicyAction::Dp);
    assert_eq!(decision.params.epsilon, Some(0.1));
    assert!(decision.matched_rule.as_deref().unwrap().starts_with("pattern:"));
}

#[test]
fn test_mask_pattern_modeled_as_deid() {
    let mut document = PolicyDocument::default();
    document.column_patterns.push(ColumnPatternConfig {
        pattern: "nickname".to_string(),
        classification: DataClassification::Internal,
        privacy_method: "MASK".to_string(),
        params: ActionParams::default(),
    });
    let (_, engine) = engine_with(document);

    let analysis = SqlAnalyzer::new().analyze("SELECT nickname FROM users");
    let decision = engine.evaluate(&analysis, None);

    assert_eq!(decision.action, PolicyAction::DeId);
    assert_eq!(decision.params.method.as_deref(), Some("mask_name"));
    assert_eq!(decision.params.columns, vec!["nickname"]);
}

#[test]
fn test_classification_caps_epsilon() {
    let mut document = PolicyDocument::default();
    document.table_policies.insert(
        "patients".to_string(),
        TablePolicy {
            classification: DataClassification::Restricted,
            ..Default::default()
        },
    );
    let (_, engine) = engine_with(document);

    let analysis = SqlAnalyzer::new().analyze("SELECT COUNT(*) FROM patients");
    let decision = engine.evaluate(&analysis, None);

    assert_eq!(decision.action, PolicyAction::Dp);
    // Restricted tier caps epsilon at 0.1 even though the default is 1.0
    assert_eq!(decision.params.epsilon, Some(0.1));
    assert_eq!(decision.classification, Some(DataClassification::Restricted));
}

#[test]
fn test_highest_classification_wins_across_tables() {
    let mut document = PolicyDocument::default();
    document.table_policies.insert(
        "users".to_string(),
        TablePolicy {
            classification: DataClassification::Internal,
            ..Default::default()
        },
    );
    document.table_policies.insert(
        "payments".to_string(),
        TablePolicy {
            classification: DataClassification::Confidential,
            ..Default::default()
        },
    );
    let (_, engine) = engine_with(document);

    let analysis = SqlAnalyzer::new()
        .analyze("SELECT COUNT(*) FROM users u JOIN payments p ON u.id = p.user_id");
    let decision = engine.evaluate(&analysis, None);
    assert_eq!(
        decision.classification,
        Some(DataClassification::Confidential)
    );
    assert_eq!(decision.params.epsilon, Some(0.5));
}

#[test]
fn test_role_epsilon_applies_to_dp() {
    let mut document = PolicyDocument::default();
    document.roles.insert(
        "analyst".to_string(),
        RoleConfig {
            epsilon: 0.5,
            delta: 1e-6,
            ..Default::default()
        },
    );
    let (_, engine) = engine_with(document);

    let analysis = SqlAnalyzer::new().analyze("SELECT COUNT(*) FROM orders");
    let decision = engine.evaluate(&analysis, Some("analyst"));

    assert_eq!(decision.params.epsilon, Some(0.5));
    assert_eq!(decision.params.delta, Some(1e-6));
    assert_eq!(decision.role_applied.as_deref(), Some("analyst"));
}

#[test]
fn test_role_denied_columns_trigger_deid() {
    let mut document = PolicyDocument::default();
    document.sensitive_columns = vec![];
    document.roles.insert(
        "intern".to_string(),
        RoleConfig {
            denied_columns: vec!["address".to_string()],
            ..Default::default()
        },
    );
    let (_, engine) = engine_with(document);

    let analysis = SqlAnalyzer::new().analyze("SELECT address, city FROM users");
    let decision = engine.evaluate(&analysis, Some("intern"));

    assert_eq!(decision.action, PolicyAction::DeId);
    assert_eq!(decision.params.columns, vec!["address"]);
}

#[test]
fn test_pass_when_nothing_matches() {
    let (_, engine) = engine_with(PolicyDocument::default());
    let analysis = SqlAnalyzer::new().analyze("SELECT status FROM orders");
    let decision = engine.evaluate(&analysis, None);

    assert_eq!(decision.action, PolicyAction::Pass);
    assert_eq!(decision.classification, Some(DataClassification::Public));
}

#[test]
fn test_conflict_resolution_precedence_and_min_epsilon() {
    let (_, engine) = engine_with(PolicyDocument::default());

    let mut dp_loose = PolicyDecision::pass("");
    dp_loose.action = PolicyAction::Dp;
    dp_loose.params.epsilon = Some(1.0);

    let mut dp_tight = PolicyDecision::pass("");
    dp_tight.action = PolicyAction::Dp;
    dp_tight.params.epsilon = Some(0.2);

    let resolved = engine.resolve_policy_conflicts(vec![
        PolicyDecision::pass("ok"),
        dp_loose.clone(),
        dp_tight,
    ]);
    assert_eq!(resolved.action, PolicyAction::Dp);
    assert_eq!(resolved.params.epsilon, Some(0.2));

    let resolved = engine.resolve_policy_conflicts(vec![
        dp_loose,
        PolicyDecision::reject("denied"),
    ]);
    assert_eq!(resolved.action, PolicyAction::Reject);

    let resolved = engine.resolve_policy_conflicts(vec![]);
    assert_eq!(resolved.action, PolicyAction::Pass);
}

#[test]
fn test_dynamic_sensitive_columns() {
    let (_, engine) = engine_with(PolicyDocument::default());
    let analyzer = SqlAnalyzer::new();

    let analysis = analyzer.analyze("SELECT device_id FROM sessions");
    assert_eq!(engine.evaluate(&analysis, None).action, PolicyAction::Pass);

    engine.add_sensitive_column("device_id");
    assert_eq!(engine.evaluate(&analysis, None).action, PolicyAction::DeId);

    engine.remove_sensitive_column("device_id");
    assert_eq!(engine.evaluate(&analysis, None).action, PolicyAction::Pass);
}

