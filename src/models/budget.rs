use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetFrequency {
    Daily,
    Weekly,
    Monthly,
    Never,
}

impl ResetFrequency {
    /// Reset period in days; None when the budget never resets.
    pub fn period_days(&self) -> Option<i64> {
        match self {
            ResetFrequency::Daily => Some(1),
            ResetFrequency::Weekly => Some(7),
            ResetFrequency::Monthly => Some(30),
            ResetFrequency::Never => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetSchedule {
    pub frequency: ResetFrequency,
    pub reset_time: String,
    pub timezone: String,
}

impl Default for ResetSchedule {
    fn default() -> Self {
        Self {
            frequency: ResetFrequency::Daily,
            reset_time: "00:00:00".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

/// Per-user privacy budget account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetAccount {
    pub user_id: String,
    pub total_budget: f64,
    pub consumed_budget: f64,
    pub role: String,
    pub reset_schedule: ResetSchedule,
    pub last_reset: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BudgetAccount {
    pub fn new(user_id: impl Into<String>, total_budget: f64, role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            total_budget,
            consumed_budget: 0.0,
            role: role.into(),
            reset_schedule: ResetSchedule::default(),
            last_reset: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.total_budget - self.consumed_budget).max(0.0)
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining_budget() <= 0.0
    }
}

/// Append-only record of one epsilon debit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetTransaction {
    pub transaction_id: String,
    pub user_id: String,
    pub query_id: String,
    pub epsilon_consumed: f64,
    pub timestamp: DateTime<Utc>,
    pub query_hash: String,
    pub privacy_mechanism: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetCheckResult {
    pub allowed: bool,
    pub remaining_budget: f64,
    pub requested_budget: f64,
    pub message: String,
}

/// Wire shape for the budget status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub user_id: String,
    pub total_budget: f64,
    pub consumed_budget: f64,
    pub remaining_budget: f64,
    pub role: String,
    pub reset_schedule: ResetSchedule,
    pub last_reset: Option<DateTime<Utc>>,
    pub is_exhausted: bool,
}

impl From<&BudgetAccount> for BudgetStatus {
    fn from(account: &BudgetAccount) -> Self {
        Self {
            user_id: account.user_id.clone(),
            total_budget: account.total_budget,
            consumed_budget: account.consumed_budget,
            remaining_budget: account.remaining_budget(),
            role: account.role.clone(),
            reset_schedule: account.reset_schedule.clone(),
            last_reset: account.last_reset,
            is_exhausted: account.is_exhausted(),
        }
    }
}
