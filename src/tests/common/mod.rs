// Common test utilities and helpers

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{AnalysisResult, ExecutionResult, PolicyDecision, QueryContext};
use crate::privacy::SensitivityAnalyzer;
use crate::services::executor::{MockExecutor, QueryExecutor};
use crate::services::policy_config::{PolicyConfigManager, PolicyDocument};
use crate::services::query_driver::{DriverOptions, QueryDriver};
use crate::services::{
    AuditLogger, BudgetManager, PerformanceMonitor, PolicyEngine, QueryCache,
};
use crate::utils::{ApiError, ApiResult};

/// Everything a pipeline test needs, wired like the composition root.
pub struct TestHarness {
    pub policy_config: Arc<PolicyConfigManager>,
    pub policy_engine: Arc<PolicyEngine>,
    pub budget_manager: Arc<BudgetManager>,
    pub audit_logger: Arc<AuditLogger>,
    pub cache: Arc<QueryCache>,
    pub monitor: Arc<PerformanceMonitor>,
    pub driver: Arc<QueryDriver>,
}

pub fn build_harness(
    default_budget: f64,
    document: PolicyDocument,
    executor: Arc<dyn QueryExecutor>,
) -> TestHarness {
    build_harness_with_options(
        default_budget,
        document,
        executor,
        DriverOptions::default(),
    )
}

pub fn build_harness_with_options(
    default_budget: f64,
    document: PolicyDocument,
    executor: Arc<dyn QueryExecutor>,
    options: DriverOptions,
) -> TestHarness {
    let policy_config = Arc::new(PolicyConfigManager::from_document(document));
    let policy_engine = Arc::new(PolicyEngine::new(Arc::clone(&policy_config)));
    let budget_manager = Arc::new(BudgetManager::new(default_budget, None, None));
    let audit_logger = Arc::new(AuditLogger::new(10_000));
    let cache = Arc::new(QueryCache::new(1000, 50.0, Duration::from_secs(300)));
    let monitor = Arc::new(PerformanceMonitor::new(1000, 1000.0));

    let driver = Arc::new(
        QueryDriver::new(
            Arc::clone(&policy_engine),
            Arc::clone(&budget_manager),
            SensitivityAnalyzer::new(),
            executor,
            Arc::clone(&audit_logger),
            Arc::clone(&cache),
            Arc::clone(&monitor),
            options,
        )
        .with_rng_seed(42),
    );

    TestHarness {
        policy_config,
        policy_engine,
        budget_manager,
        audit_logger,
        cache,
        monitor,
        driver,
    }
}

pub fn default_harness() -> TestHarness {
    build_harness(
        1.0,
        PolicyDocument::default(),
        Arc::new(MockExecutor::new()),
    )
}

/// Executor that always fails, for refund-path tests.
pub struct FailingExecutor;

#[async_trait]
impl QueryExecutor for FailingExecutor {
    async fn execute(
        &self,
        _sql: &str,
        _analysis: &AnalysisResult,
        _decision: &PolicyDecision,
        _context: &QueryContext,
    ) -> ApiResult<ExecutionResult> {
        Err(ApiError::executor_error("backend unavailable"))
    }
}
