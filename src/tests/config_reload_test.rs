// Policy reload behavior against a real backing file.

use std::path::PathBuf;
use std::sync::Arc;

use crate::models::PolicyAction;
use crate::services::policy_config::PolicyConfigManager;
use crate::services::{PolicyEngine, SqlAnalyzer};

fn temp_policy_path(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("veil-policy-{}-{}.toml", name, std::process::id()))
}

const INITIAL: &str = r#"
default_epsilon = 1.0
sensitive_columns = ["email"]
"#;

const UPDATED: &str = r#"
default_epsilon = 0.5
sensitive_columns = ["email", "badge"]
"#;

#[test]
fn test_reload_swaps_document_and_notifies_engine() {
    let path = temp_policy_path("reload");
    std::fs::write(&path, INITIAL).unwrap();

    let config = Arc::new(PolicyConfigManager::new(Some(path.clone())));
    let engine = PolicyEngine::new(Arc::clone(&config));
    let analyzer = SqlAnalyzer::new();

    let analysis = analyzer.analyze("SELECT badge FROM visits");
    assert_eq!(engine.evaluate(&analysis, None).action, PolicyAction::Pass);
    assert_eq!(config.get_default_epsilon(), 1.0);

    std::fs::write(&path, UPDATED).unwrap();
    config.reload();

    // The engine's cached sensitive set refreshed with the new document
    assert_eq!(engine.evaluate(&analysis, None).action, PolicyAction::DeId);
    assert_eq!(config.get_default_epsilon(), 0.5);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_reload_failure_keeps_previous_document() {
    let path = temp_policy_path("bad-reload");
    std::fs::write(&path, INITIAL).unwrap();

    let config = Arc::new(PolicyConfigManager::new(Some(path.clone())));
    assert_eq!(config.get_default_epsilon(), 1.0);

    std::fs::write(&path, "default_epsilon = \"not a number").unwrap();
    config.reload();

    // Parse failure is swallowed; the old document stays installed
    assert_eq!(config.get_default_epsilon(), 1.0);
    assert_eq!(config.get_sensitive_columns(), vec!["email"]);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn test_readers_see_old_or_new_never_mixed() {
    // Two paired fields move together across the swap; a torn read would
    // observe epsilon from one document and columns from the other.
    let path = temp_policy_path("atomic");
    std::fs::write(&path, INITIAL).unwrap();
    let config = Arc::new(PolicyConfigManager::new(Some(path.clone())));

    let reader_config = Arc::clone(&config);
    let reader = std::thread::spawn(move || {
        for _ in 0..2000 {
            let snapshot = reader_config.current();
            let consistent = if snapshot.default_epsilon == 1.0 {
                snapshot.sensitive_columns == vec!["email"]
            } else {
                snapshot.sensitive_columns == vec!["email", "badge"]
            };
            assert!(consistent, "torn read of the policy document");
        }
    });

    for i in 0..50 {
        let content = if i % 2 == 0 { UPDATED } else { INITIAL };
        std::fs::write(&path, content).unwrap();
        config.reload();
    }

    reader.join().unwrap();
    let _ = std::fs::remove_file(&path);
}
