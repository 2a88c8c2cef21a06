//! Query execution backends.
//!
//! The core depends only on the [`QueryExecutor`] trait: execute a statement
//! already cleared by policy, returning a scalar for aggregate queries and a
//! list of records otherwise. Two backends ship with the crate — an
//! in-memory mock for development and tests, and a MySQL-protocol backend.

pub mod mock;
pub mod mysql;

use async_trait::async_trait;

use crate::models::{AnalysisResult, ExecutionResult, PolicyDecision, QueryContext};
use crate::utils::ApiResult;

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute only runs for non-REJECT decisions; implementations must
    /// refuse a REJECT decision defensively.
    async fn execute(
        &self,
        sql: &str,
        analysis: &AnalysisResult,
        decision: &PolicyDecision,
        context: &QueryContext,
    ) -> ApiResult<ExecutionResult>;
}

pub use mock::MockExecutor;
pub use mysql::MySqlExecutor;
