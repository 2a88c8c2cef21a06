//! In-memory executor with canned tables for development and tests.

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::models::{
    Aggregation, AnalysisResult, ExecutionResult, PolicyAction, PolicyDecision, QueryContext,
};
use crate::utils::{ApiError, ApiResult};

use super::QueryExecutor;

pub struct MockExecutor {
    tables: Value,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self {
            tables: json!({
                "users": [
                    {"id": 1, "name": "张三", "email": "zhangsan@example.com", "age": 28, "phone": "13812345678"},
                    {"id": 2, "name": "李四", "email": "lisi@example.com", "age": 35, "phone": "13987654321"},
                    {"id": 3, "name": "王五", "email": "wangwu@example.com", "age": 42, "phone": "13611112222"},
                    {"id": 4, "name": "John Doe", "email": "john@example.com", "age": 30, "phone": "13522223333"},
                    {"id": 5, "name": "Jane Smith", "email": "jane@example.com", "age": 25, "phone": "13633334444"},
                ],
                "orders": [
                    {"id": 1, "user_id": 1, "amount": 100.0, "status": "completed"},
                    {"id": 2, "user_id": 2, "amount": 250.5, "status": "pending"},
                    {"id": 3, "user_id": 1, "amount": 75.0, "status": "completed"},
                ],
            }),
        }
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a table's rows (tests shape scenarios with this).
    pub fn with_table(mut self, name: &str, rows: Value) -> Self {
        if let Value::Object(tables) = &mut self.tables {
            tables.insert(name.to_string(), rows);
        }
        self
    }

    fn table_rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .get(table)
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default()
    }

    fn aggregate_value(&self, analysis: &AnalysisResult, rows: &[Value]) -> Value {
        // COUNT counts rows; SUM adds the `amount` column when present.
        // Everything else falls back to the row count, which keeps the
        // mock deterministic.
        if analysis.aggregations.contains(&Aggregation::Sum) {
            let total: f64 = rows
                .iter()
                .filter_map(|row| row.get("amount").and_then(Value::as_f64))
                .sum();
            return json!(total);
        }
        json!(rows.len())
    }
}

#[async_trait]
impl QueryExecutor for MockExecutor {
    async fn execute(
        &self,
        _sql: &str,
        analysis: &AnalysisResult,
        decision: &PolicyDecision,
        _context: &QueryContext,
    ) -> ApiResult<ExecutionResult> {
        if decision.action == PolicyAction::Reject {
            return Err(ApiError::policy_rejection(decision.reason.clone()));
        }

        let Some(table) = analysis.tables.first() else {
            return Err(ApiError::invalid_sql("no table referenced"));
        };
        let rows = self.table_rows(table);

        if analysis.is_aggregate_query {
            let value = self.aggregate_value(analysis, &rows);
            return Ok(ExecutionResult {
                data: value,
                row_count: 1,
            });
        }

        let row_count = rows.len();
        Ok(ExecutionResult {
            data: Value::Array(rows),
            row_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sql_analyzer::SqlAnalyzer;

    fn decision_pass() -> PolicyDecision {
        PolicyDecision::pass("test")
    }

    #[tokio::test]
    async fn test_count_returns_row_count() {
        let executor = MockExecutor::new();
        let analysis = SqlAnalyzer::new().analyze("SELECT COUNT(*) FROM users");
        let result = executor
            .execute("SELECT COUNT(*) FROM users", &analysis, &decision_pass(), &QueryContext::default())
            .await
            .unwrap();
        assert_eq!(result.data, json!(5));
    }

    #[tokio::test]
    async fn test_select_returns_rows() {
        let executor = MockExecutor::new();
        let analysis = SqlAnalyzer::new().analyze("SELECT name, email FROM users");
        let result = executor
            .execute("SELECT name, email FROM users", &analysis, &decision_pass(), &QueryContext::default())
            .await
            .unwrap();
        assert_eq!(result.row_count, 5);
        assert!(result.data.is_array());
    }

    #[tokio::test]
    async fn test_sum_adds_amounts() {
        let executor = MockExecutor::new();
        let analysis = SqlAnalyzer::new().analyze("SELECT SUM(amount) FROM orders");
        let result = executor
            .execute("SELECT SUM(amount) FROM orders", &analysis, &decision_pass(), &QueryContext::default())
            .await
            .unwrap();
        assert_eq!(result.data, json!(425.5));
    }

    #[tokio::test]
    async fn test_unknown_table_is_empty() {
        let executor = MockExecutor::new();
        let analysis = SqlAnalyzer::new().analyze("SELECT * FROM missing");
        let result = executor
            .execute("SELECT * FROM missing", &analysis, &decision_pass(), &QueryContext::default())
            .await
            .unwrap();
        assert_eq!(result.row_count, 0);
    }

    #[tokio::test]
    async fn test_reject_decision_refused() {
        let executor = MockExecutor::new();
        let analysis = SqlAnalyzer::new().analyze("SELECT * FROM users");
        let rejected = PolicyDecision::reject("denied");
        assert!(executor
            .execute("SELECT * FROM users", &analysis, &rejected, &QueryContext::default())
            .await
            .is_err());
    }
}
