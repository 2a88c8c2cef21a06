//! Per-user privacy budget accounting.
//!
//! All operations run under one manager-wide mutex so check+consume is a
//! single critical section: two concurrent DP requests for the same user
//! cannot both succeed when only one has budget left.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::models::{
    BudgetAccount, BudgetCheckResult, BudgetStatus, BudgetTransaction, ResetSchedule,
};

pub const DEFAULT_BUDGET: f64 = 1.0;

struct BudgetLedger {
    accounts: HashMap<String, BudgetAccount>,
    transactions: HashMap<String, Vec<BudgetTransaction>>,
}

pub struct BudgetManager {
    ledger: Mutex<BudgetLedger>,
    default_budget: f64,
    role_budgets: HashMap<String, f64>,
    default_reset_schedule: ResetSchedule,
}

impl Default for BudgetManager {
    fn default() -> Self {
        Self::new(DEFAULT_BUDGET, None, None)
    }
}

impl BudgetManager {
    pub fn new(
        default_budget: f64,
        role_budgets: Option<HashMap<String, f64>>,
        default_reset_schedule: Option<ResetSchedule>,
    ) -> Self {
        let mut role_budgets = role_budgets.unwrap_or_else(|| {
            let mut defaults = HashMap::new();
            defaults.insert("admin".to_string(), 10.0);
            defaults.insert("analyst".to_string(), 5.0);
            defaults
        });
        // The "default" role always mirrors the constructor budget.
        role_budgets.insert("default".to_string(), default_budget);

        Self {
            ledger: Mutex::new(BudgetLedger {
                accounts: HashMap::new(),
                transactions: HashMap::new(),
            }),
            default_budget,
            role_budgets,
            default_reset_schedule: default_reset_schedule.unwrap_or_default(),
        }
    }

    fn get_or_create_account<'a>(
        &self,
        ledger: &'a mut BudgetLedger,
        user_id: &str,
        role: &str,
    ) -> &'a mut BudgetAccount {
        if !ledger.accounts.contains_key(user_id) {
            let total_budget = self
                .role_budgets
                .get(role)
                .copied()
                .unwrap_or(self.default_budget);
            let mut account = BudgetAccount::new(user_id, total_budget, role);
            account.reset_schedule = self.default_reset_schedule.clone();
            ledger.accounts.insert(user_id.to_string(), account);
            ledger.transactions.insert(user_id.to_string(), Vec::new());
        }
        ledger
            .accounts
            .get_mut(user_id)
            .expect("account inserted above")
    }

    /// DAILY/WEEKLY/MONTHLY reset once the period has elapsed since the last
    /// reset. First observation only stamps `last_reset`.
    fn check_and_reset_if_needed(account: &mut BudgetAccount) {
        let Some(period_days) = account.reset_schedule.frequency.period_days() else {
            return;
        };

        let now = Utc::now();
        let Some(last_reset) = account.last_reset else {
            account.last_reset = Some(now);
            return;
        };

        if now - last_reset >= Duration::days(period_days) {
            tracing::info!(
                "Budget reset for user {} ({:?} schedule)",
                account.user_id,
                account.reset_schedule.frequency
            );
            account.consumed_budget = 0.0;
            account.last_reset = Some(now);
            account.updated_at = now;
        }
    }

    pub fn check_budget(&self, user_id: &str, epsilon: f64) -> BudgetCheckResult {
        self.check_budget_for_role(user_id, "default", epsilon)
    }

    pub fn check_budget_for_role(
        &self,
        user_id: &str,
        role: &str,
        epsilon: f64,
    ) -> BudgetCheckResult {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, role);
        Self::check_and_reset_if_needed(account);

        let remaining = account.remaining_budget();
        let allowed = remaining >= epsilon;
        let message = if allowed {
            format!(
                "Budget check passed. Remaining: {:.4}, Requested: {:.4}",
                remaining, epsilon
            )
        } else {
            format!(
                "Insufficient budget. Remaining: {:.4}, Requested: {:.4}",
                remaining, epsilon
            )
        };

        BudgetCheckResult {
            allowed,
            remaining_budget: remaining,
            requested_budget: epsilon,
            message,
        }
    }

    /// Debit epsilon and append a transaction. Returns false (no side
    /// effect) when the remaining budget is insufficient.
    pub fn consume_budget(
        &self,
        user_id: &str,
        epsilon: f64,
        query_id: Option<&str>,
        query_sql: Option<&str>,
        privacy_mechanism: &str,
    ) -> bool {
        self.consume_budget_for_role(user_id, "default", epsilon, query_id, query_sql, privacy_mechanism)
    }

    pub fn consume_budget_for_role(
        &self,
        user_id: &str,
        role: &str,
        epsilon: f64,
        query_id: Option<&str>,
        query_sql: Option<&str>,
        privacy_mechanism: &str,
    ) -> bool {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, role);
        Self::check_and_reset_if_needed(account);

        if account.remaining_budget() < epsilon {
            return false;
        }

        account.consumed_budget += epsilon;
        account.updated_at = Utc::now();

        let transaction = BudgetTransaction {
            transaction_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            query_id: query_id
                .map(String::from)
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            epsilon_consumed: epsilon,
            timestamp: Utc::now(),
            query_hash: query_sql.map(Self::hash_query).unwrap_or_default(),
            privacy_mechanism: privacy_mechanism.to_string(),
            description: format!("Budget consumed: {:.4}", epsilon),
        };
        ledger
            .transactions
            .entry(user_id.to_string())
            .or_default()
            .push(transaction);

        true
    }

    /// Credit back a previously consumed epsilon (compensating transaction
    /// for a failed execution). Never drives consumption below zero.
    pub fn refund_budget(&self, user_id: &str, epsilon: f64, query_id: &str) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, "default");
        account.consumed_budget = (account.consumed_budget - epsilon).max(0.0);
        account.updated_at = Utc::now();

        let transaction = BudgetTransaction {
            transaction_id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            query_id: query_id.to_string(),
            epsilon_consumed: -epsilon,
            timestamp: Utc::now(),
            query_hash: String::new(),
            privacy_mechanism: "refund".to_string(),
            description: format!("Budget refunded after execution failure: {:.4}", epsilon),
        };
        ledger
            .transactions
            .entry(user_id.to_string())
            .or_default()
            .push(transaction);
    }

    pub fn get_remaining_budget(&self, user_id: &str) -> f64 {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, "default");
        Self::check_and_reset_if_needed(account);
        account.remaining_budget()
    }

    pub fn get_budget_status(&self, user_id: &str) -> BudgetStatus {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, "default");
        Self::check_and_reset_if_needed(account);
        BudgetStatus::from(&*account)
    }

    /// Newest-first transaction history.
    pub fn get_budget_history(&self, user_id: &str, limit: usize) -> Vec<BudgetTransaction> {
        let ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(transactions) = ledger.transactions.get(user_id) else {
            return Vec::new();
        };
        let mut history: Vec<BudgetTransaction> = transactions.clone();
        history.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        history.truncate(limit);
        history
    }

    pub fn reset_budget(&self, user_id: &str) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, "default");
        let now = Utc::now();
        account.consumed_budget = 0.0;
        account.last_reset = Some(now);
        account.updated_at = now;
    }

    pub fn set_budget(&self, user_id: &str, total_budget: f64) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, "default");
        account.total_budget = total_budget;
        account.updated_at = Utc::now();
    }

    pub fn set_reset_schedule(&self, user_id: &str, schedule: ResetSchedule) {
        let mut ledger = self.ledger.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let account = self.get_or_create_account(&mut ledger, user_id, "default");
        account.reset_schedule = schedule;
        account.updated_at = Utc::now();
    }

    /// SHA-256 of the whitespace-normalized lowercased SQL, 16 hex chars.
    fn hash_query(sql: &str) -> String {
        let normalized = sql
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        crate::utils::sha256_hex_truncated(normalized.as_bytes(), 16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResetFrequency;

    #[test]
    fn test_check_and_consume() {
        let manager = BudgetManager::default();

        let check = manager.check_budget("alice", 0.5);
        assert!(check.allowed);
        assert_eq!(check.remaining_budget, 1.0);

        assert!(manager.consume_budget("alice", 0.5, Some("q1"), Some("SELECT 1"), "laplace"));
        assert_eq!(manager.get_remaining_budget("alice"), 0.5);

        // Second consume of 0.6 exceeds the remainder
        assert!(!manager.consume_budget("alice", 0.6, Some("q2"), None, "laplace"));
        assert_eq!(manager.get_remaining_budget("alice"), 0.5);
    }

    #[test]
    fn test_role_budget_assignment() {
        let manager = BudgetManager::default();
        assert!(manager.check_budget_for_role("admin-user", "admin", 8.0).allowed);
        assert!(!manager.check_budget_for_role("plain-user", "default", 8.0).allowed);
    }

    #[test]
    fn test_default_role_key_mirrors_constructor_budget() {
        let mut roles = HashMap::new();
        roles.insert("default".to_string(), 99.0);
        let manager = BudgetManager::new(2.0, Some(roles), None);
        // The "default" entry is overwritten with the constructor budget.
        assert_eq!(manager.get_budget_status("bob").total_budget, 2.0);
    }

    #[test]
    fn test_reset_idempotent() {
        let manager = BudgetManager::default();
        manager.consume_budget("alice", 0.7, None, None, "laplace");
        manager.reset_budget("alice");
        let first = manager.get_budget_status("alice");
        manager.reset_budget("alice");
        let second = manager.get_budget_status("alice");

        assert_eq!(first.consumed_budget, 0.0);
        assert_eq!(second.consumed_budget, 0.0);
        assert_eq!(first.total_budget, second.total_budget);
    }

    #[test]
    fn test_history_newest_first() {
        let manager = BudgetManager::default();
        manager.consume_budget("alice", 0.1, Some("q1"), None, "laplace");
        manager.consume_budget("alice", 0.2, Some("q2"), None, "laplace");
        manager.consume_budget("alice", 0.3, Some("q3"), None, "gaussian");

        let history = manager.get_budget_history("alice", 2);
        assert_eq!(history.len(), 2);
        assert!(history[0].timestamp >= history[1].timestamp);
    }

    #[test]
    fn test_query_hash_is_normalized() {
        let h1 = BudgetManager::hash_query("SELECT  *   FROM users");
        let h2 = BudgetManager::hash_query("select * from USERS");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
    }

    #[test]
    fn test_never_schedule_skips_reset() {
        let manager = BudgetManager::new(
            1.0,
            None,
            Some(ResetSchedule {
                frequency: ResetFrequency::Never,
                ..Default::default()
            }),
        );
        manager.consume_budget("alice", 0.4, None, None, "laplace");
        let status = manager.get_budget_status("alice");
        assert_eq!(status.consumed_budget, 0.4);
        assert!(status.last_reset.is_none());
    }

    #[test]
    fn test_refund_restores_budget() {
        let manager = BudgetManager::default();
        manager.consume_budget("alice", 0.8, Some("q1"), None, "laplace");
        manager.refund_budget("alice", 0.8, "q1");
        assert_eq!(manager.get_remaining_budget("alice"), 1.0);

        let history = manager.get_budget_history("alice", 10);
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|t| t.epsilon_consumed < 0.0));
    }
}
