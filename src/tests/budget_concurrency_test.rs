// Budget invariants under concurrent consumption.

use std::sync::Arc;

use crate::services::BudgetManager;

#[tokio::test]
async fn test_concurrent_consume_never_oversubscribes() {
    // 10 tasks each want 0.3 out of a 1.0 budget: exactly
    // floor(1.0 / 0.3) = 3 may succeed.
    let manager = Arc::new(BudgetManager::new(1.0, None, None));

    let mut handles = Vec::new();
    for i in 0..10 {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            manager.consume_budget(
                "alice",
                0.3,
                Some(&format!("q{}", i)),
                Some("SELECT COUNT(*) FROM users"),
                "laplace",
            )
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.unwrap() {
            successes += 1;
        }
    }

    assert_eq!(successes, 3);
    let status = manager.get_budget_status("alice");
    assert!(status.consumed_budget <= status.total_budget);
    assert!((status.consumed_budget - 0.9).abs() < 1e-9);
}

#[tokio::test]
async fn test_concurrent_mixed_epsilons_never_exceed_total() {
    let manager = Arc::new(BudgetManager::new(2.0, None, None));

    let epsilons = [0.9, 0.8, 0.7, 0.6, 0.5, 0.4];
    let mut handles = Vec::new();
    for (i, epsilon) in epsilons.into_iter().enumerate() {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            if manager.consume_budget("bob", epsilon, Some(&format!("q{}", i)), None, "laplace") {
                epsilon
            } else {
                0.0
            }
        }));
    }

    let mut consumed = 0.0;
    for handle in handles {
        consumed += handle.await.unwrap();
    }

    assert!(consumed <= 2.0 + 1e-9);
    let status = manager.get_budget_status("bob");
    assert!((status.consumed_budget - consumed).abs() < 1e-9);
    assert!(status.consumed_budget <= status.total_budget);
}

#[tokio::test]
async fn test_concurrent_users_are_independent() {
    let manager = Arc::new(BudgetManager::new(1.0, None, None));

    let mut handles = Vec::new();
    for user in ["u1", "u2", "u3", "u4"] {
        let manager = Arc::clone(&manager);
        handles.push(tokio::spawn(async move {
            let mut successes = 0;
            for i in 0..4 {
                if manager.consume_budget(user, 0.25, Some(&format!("{}-{}", user, i)), None, "laplace") {
                    successes += 1;
                }
            }
            successes
        }));
    }

    for handle in handles {
        assert_eq!(handle.await.unwrap(), 4);
    }
    for user in ["u1", "u2", "u3", "u4"] {
        assert_eq!(manager.get_remaining_budget(user), 0.0);
    }
}
