//! MySQL-protocol executor backend.
//!
//! Aggregate queries return the first column of the first row as a scalar;
//! everything else returns rows as JSON objects keyed by column name.

use async_trait::async_trait;
use mysql_async::prelude::Queryable;
use mysql_async::{OptsBuilder, Pool, Row, SslOpts};
use serde_json::{Map, Value};

use crate::models::{AnalysisResult, ExecutionResult, PolicyAction, PolicyDecision, QueryContext};
use crate::utils::{ApiError, ApiResult};

use super::QueryExecutor;

#[derive(Debug, Clone)]
pub struct MySqlBackendConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

pub struct MySqlExecutor {
    pool: Pool,
}

impl MySqlExecutor {
    pub fn new(config: &MySqlBackendConfig) -> ApiResult<Self> {
        let constraints = mysql_async::PoolConstraints::new(2, 20)
            .ok_or_else(|| ApiError::internal_error("invalid MySQL pool constraints"))?;

        let opts = OptsBuilder::default()
            .ip_or_hostname(&config.host)
            .tcp_port(config.port)
            .user(Some(&config.user))
            .pass(config.password.clone())
            .db_name(config.database.clone())
            .prefer_socket(false)
            .ssl_opts(None::<SslOpts>)
            .tcp_keepalive(Some(30_000_u32))
            .tcp_nodelay(true)
            .pool_opts(
                mysql_async::PoolOpts::default()
                    .with_constraints(constraints)
                    .with_inactive_connection_ttl(std::time::Duration::from_secs(300)),
            );

        Ok(Self {
            pool: Pool::new(opts),
        })
    }

    fn row_to_object(row: &Row) -> Map<String, Value> {
        let mut object = Map::new();
        for (i, column) in row.columns_ref().iter().enumerate() {
            let value: Option<String> = row.get(i);
            object.insert(
                column.name_str().to_string(),
                value.map(Value::String).unwrap_or(Value::Null),
            );
        }
        object
    }

    /// First column of the first row, parsed numerically when possible.
    fn scalar_from_rows(rows: &[Row]) -> Value {
        let Some(row) = rows.first() else {
            return Value::Null;
        };
        let value: Option<String> = row.get(0);
        match value {
            Some(text) => {
                if let Ok(number) = text.parse::<i64>() {
                    Value::from(number)
                } else if let Ok(number) = text.parse::<f64>() {
                    Value::from(number)
                } else {
                    Value::String(text)
                }
            }
            None => Value::Null,
        }
    }
}

#[async_trait]
impl QueryExecutor for MySqlExecutor {
    async fn execute(
        &self,
        sql: &str,
        analysis: &AnalysisResult,
        decision: &PolicyDecision,
        _context: &QueryContext,
    ) -> ApiResult<ExecutionResult> {
        if decision.action == PolicyAction::Reject {
            return Err(ApiError::policy_rejection(decision.reason.clone()));
        }

        let mut conn = self.pool.get_conn().await.map_err(|e| {
            tracing::error!("Failed to get connection from pool: {}", e);
            ApiError::executor_error(format!("Failed to get connection: {}", e))
        })?;

        let rows: Vec<Row> = conn.query(sql).await.map_err(|e| {
            tracing::error!("MySQL query execution failed: {}", e);
            ApiError::executor_error(format!("SQL execution failed: {}", e))
        })?;
        drop(conn);

        tracing::debug!("Query returned {} rows", rows.len());

        if analysis.is_aggregate_query {
            return Ok(ExecutionResult {
                data: Self::scalar_from_rows(&rows),
                row_count: rows.len(),
            });
        }

        let objects: Vec<Value> = rows
            .iter()
            .map(|row| Value::Object(Self::row_to_object(row)))
            .collect();
        let row_count = objects.len();
        Ok(ExecutionResult {
            data: Value::Array(objects),
            row_count,
        })
    }
}
