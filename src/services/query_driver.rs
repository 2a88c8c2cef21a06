//! Request pipeline orchestration.
//!
//! Each request runs the same strictly ordered stages: analyze, decide,
//! account budget (DP only), scale sensitivity for multi-table shapes,
//! execute, transform, audit. Budget is debited before execution; a failed
//! execution refunds the exact debit (configurable) so no successful answer
//! means no budget spent.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::models::{
    Aggregation, AnalysisResult, PolicyAction, PolicyDecision, PrivacyInfo, PrivacyMethod,
    ProtectedData, QueryContext, QueryResponse, ResponseType,
};
use crate::privacy::{deid::DeIdRewriter, mechanisms, SensitivityAnalyzer};
use crate::services::audit_log_service::AuditLogger;
use crate::services::budget_service::BudgetManager;
use crate::services::executor::QueryExecutor;
use crate::services::performance_monitor::{PerformanceMonitor, QueryPhase};
use crate::services::policy_engine::PolicyEngine;
use crate::services::query_cache::QueryCache;
use crate::services::sql_analyzer::SqlAnalyzer;

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub budget_enabled: bool,
    /// Refund the debited epsilon when the executor fails, so a request
    /// that never produced an answer costs nothing.
    pub refund_on_failure: bool,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            budget_enabled: true,
            refund_on_failure: true,
        }
    }
}

pub struct QueryDriver {
    analyzer: SqlAnalyzer,
    policy_engine: Arc<PolicyEngine>,
    budget_manager: Arc<BudgetManager>,
    sensitivity_analyzer: SensitivityAnalyzer,
    executor: Arc<dyn QueryExecutor>,
    audit_logger: Arc<AuditLogger>,
    cache: Arc<QueryCache>,
    monitor: Arc<PerformanceMonitor>,
    deid_rewriter: DeIdRewriter,
    rng: Mutex<ChaCha20Rng>,
    options: DriverOptions,
}

impl QueryDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        policy_engine: Arc<PolicyEngine>,
        budget_manager: Arc<BudgetManager>,
        sensitivity_analyzer: SensitivityAnalyzer,
        executor: Arc<dyn QueryExecutor>,
        audit_logger: Arc<AuditLogger>,
        cache: Arc<QueryCache>,
        monitor: Arc<PerformanceMonitor>,
        options: DriverOptions,
    ) -> Self {
        Self {
            analyzer: SqlAnalyzer::new(),
            policy_engine,
            budget_manager,
            sensitivity_analyzer,
            executor,
            audit_logger,
            cache,
            monitor,
            deid_rewriter: DeIdRewriter::new(),
            rng: Mutex::new(ChaCha20Rng::from_entropy()),
            options,
        }
    }

    /// Deterministic noise for tests.
    pub fn with_rng_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(ChaCha20Rng::seed_from_u64(seed));
        self
    }

    pub async fn process_query(&self, sql: &str, mut context: QueryContext) -> QueryResponse {
        let query_id = context
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id = context.effective_user_id().to_string();

        self.monitor.start_query(&query_id, &user_id);
        let response = self
            .run_pipeline(sql, &mut context, &query_id, &user_id)
            .await;
        if let Some(error) = &response.data.error {
            self.monitor.record_error(&query_id, error);
        }
        self.monitor.end_query(&query_id);
        response
    }

    async fn run_pipeline(
        &self,
        sql: &str,
        context: &mut QueryContext,
        query_id: &str,
        user_id: &str,
    ) -> QueryResponse {
        // Stage 1: analysis, served from the cache when the statement was
        // seen before.
        let started = Instant::now();
        let analysis = self.cached_analysis(sql, query_id);
        self.monitor.record_phase_time(
            query_id,
            QueryPhase::Analysis,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        self.audit_logger.log_query_submitted(
            query_id,
            user_id,
            sql,
            analysis.tables.clone(),
            analysis.select_columns.clone(),
            analysis.is_aggregate_query,
            !analysis.joins.is_empty(),
            !analysis.subqueries.is_empty(),
        );

        if !analysis.is_valid {
            let reason = analysis
                .error
                .clone()
                .unwrap_or_else(|| "invalid SQL".to_string());
            self.audit_logger
                .log_query_rejected(query_id, user_id, sql, &reason);
            return QueryResponse::error(ProtectedData {
                response_type: ResponseType::Error,
                original_query: sql.to_string(),
                protected_result: None,
                privacy_info: PrivacyInfo::none("SQL analysis failed"),
                error: Some(reason),
            });
        }

        // Stage 2: policy decision.
        let started = Instant::now();
        let decision = self
            .policy_engine
            .evaluate(&analysis, context.user_role.as_deref());
        self.monitor.record_phase_time(
            query_id,
            QueryPhase::Policy,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        if decision.action == PolicyAction::Reject {
            self.audit_logger
                .log_query_rejected(query_id, user_id, sql, &decision.reason);
            return QueryResponse::error(ProtectedData {
                response_type: ResponseType::Error,
                original_query: sql.to_string(),
                protected_result: None,
                privacy_info: PrivacyInfo::none("Query rejected by policy"),
                error: Some(decision.reason.clone()),
            });
        }

        // Stage 3: budget accounting, DP only.
        let epsilon = decision.params.epsilon.unwrap_or(1.0);
        let mut budget_consumed = false;
        if decision.action == PolicyAction::Dp && self.options.budget_enabled {
            let role = context.user_role.as_deref().unwrap_or("default");
            let check = self
                .budget_manager
                .check_budget_for_role(user_id, role, epsilon);
            if !check.allowed {
                self.audit_logger
                    .log_query_rejected(query_id, user_id, sql, "insufficient_budget");
                return QueryResponse::error(ProtectedData {
                    response_type: ResponseType::BudgetError,
                    original_query: sql.to_string(),
                    protected_result: None,
                    privacy_info: PrivacyInfo {
                        method: "None".to_string(),
                        remaining_budget: Some(check.remaining_budget),
                        requested_budget: Some(check.requested_budget),
                        reason: Some(check.message.clone()),
                        ..Default::default()
                    },
                    error: Some("insufficient_budget".to_string()),
                });
            }

            budget_consumed = self.budget_manager.consume_budget_for_role(
                user_id,
                role,
                epsilon,
                Some(query_id),
                Some(sql),
                decision.params.mechanism.as_deref().unwrap_or("laplace"),
            );
            if !budget_consumed {
                // A concurrent debit won the race between check and consume.
                let recheck = self
                    .budget_manager
                    .check_budget_for_role(user_id, role, epsilon);
                self.audit_logger
                    .log_query_rejected(query_id, user_id, sql, "insufficient_budget");
                return QueryResponse::error(ProtectedData {
                    response_type: ResponseType::BudgetError,
                    original_query: sql.to_string(),
                    protected_result: None,
                    privacy_info: PrivacyInfo {
                        method: "None".to_string(),
                        remaining_budget: Some(recheck.remaining_budget),
                        requested_budget: Some(recheck.requested_budget),
                        reason: Some(recheck.message.clone()),
                        ..Default::default()
                    },
                    error: Some("insufficient_budget".to_string()),
                });
            }
            let remaining = self.budget_manager.get_remaining_budget(user_id);
            self.audit_logger
                .log_budget_consumed(user_id, query_id, epsilon, remaining);
        }

        // Stage 4: multi-table sensitivity uplift.
        let uplift = Self::multi_table_uplift(&analysis);
        context.metadata.insert(
            "multi_table_sensitivity".to_string(),
            json!(uplift),
        );
        let effective_sensitivity = self.base_sensitivity(&analysis)
            * decision.params.sensitivity.unwrap_or(1.0)
            * uplift;

        // Stage 5: execution.
        let started = Instant::now();
        let execution = self
            .executor
            .execute(sql, &analysis, &decision, context)
            .await;
        self.monitor.record_phase_time(
            query_id,
            QueryPhase::Execution,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        let execution = match execution {
            Ok(result) => result,
            Err(err) => {
                let message = err.to_string();
                if budget_consumed && self.options.refund_on_failure {
                    self.budget_manager.refund_budget(user_id, epsilon, query_id);
                    let restored = self.budget_manager.get_remaining_budget(user_id);
                    self.audit_logger
                        .log_budget_reset(user_id, restored, "execution_refund");
                }
                self.audit_logger.log_system_error(
                    user_id,
                    "executor_error",
                    &message,
                    Some(query_id),
                );
                return QueryResponse::error(ProtectedData {
                    response_type: ResponseType::Error,
                    original_query: sql.to_string(),
                    protected_result: None,
                    privacy_info: PrivacyInfo::none("Execution failed"),
                    error: Some(message),
                });
            }
        };
        self.monitor
            .record_result_size(query_id, execution.data.to_string().len());

        // Stage 6: privacy transformation.
        let started = Instant::now();
        let data = self.transform(
            sql,
            &decision,
            execution.data,
            epsilon,
            effective_sensitivity,
            query_id,
            user_id,
        );
        self.monitor.record_phase_time(
            query_id,
            QueryPhase::Privacy,
            started.elapsed().as_secs_f64() * 1000.0,
        );

        QueryResponse::success(data)
    }

    fn cached_analysis(&self, sql: &str, query_id: &str) -> AnalysisResult {
        let key = QueryCache::cache_key(sql, None);
        if let Some(cached) = self.cache.get(&key) {
            if let Ok(analysis) = serde_json::from_value::<AnalysisResult>(cached) {
                self.monitor.record_cache_hit(query_id, true);
                return analysis;
            }
        }

        let analysis = self.analyzer.analyze(sql);
        if let Ok(value) = serde_json::to_value(&analysis) {
            self.cache.set(&key, value, None);
        }
        analysis
    }

    /// s = 1 + 0.5·joins, ×1.2 per outer join, ×(1 + 0.3·subqueries),
    /// ×(1 + 0.2·window functions)
    fn multi_table_uplift(analysis: &AnalysisResult) -> f64 {
        let mut sensitivity = 1.0 + 0.5 * analysis.joins.len() as f64;
        for _ in 0..analysis.outer_join_count() {
            sensitivity *= 1.2;
        }
        sensitivity *= 1.0 + 0.3 * analysis.subqueries.len() as f64;
        sensitivity *= 1.0 + 0.2 * analysis.window_functions.len() as f64;
        sensitivity
    }

    /// Base L1 sensitivity for the query's aggregations; the aggregate
    /// argument column is looked up in the configured bounds.
    fn base_sensitivity(&self, analysis: &AnalysisResult) -> f64 {
        analysis
            .aggregations
            .iter()
            .map(|aggregation| {
                let column = Self::aggregate_argument(analysis, *aggregation);
                self.sensitivity_analyzer
                    .analyze(*aggregation, column.as_deref())
            })
            .fold(1.0, f64::max)
    }

    fn aggregate_argument(analysis: &AnalysisResult, aggregation: Aggregation) -> Option<String> {
        let needle = format!("{}(", aggregation.keyword());
        for column in &analysis.select_columns {
            let upper = column.to_uppercase();
            if let Some(pos) = upper.find(&needle) {
                let rest = &column[pos + needle.len()..];
                if let Some(end) = rest.find(')') {
                    let arg = rest[..end].trim();
                    if !arg.is_empty() && arg != "*" {
                        return Some(arg.to_string());
                    }
                }
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn transform(
        &self,
        sql: &str,
        decision: &PolicyDecision,
        data: Value,
        epsilon: f64,
        sensitivity: f64,
        query_id: &str,
        user_id: &str,
    ) -> ProtectedData {
        match decision.action {
            PolicyAction::Dp => {
                let mechanism = decision
                    .params
                    .mechanism
                    .clone()
                    .unwrap_or_else(|| "laplace".to_string());
                let delta = decision.params.delta.unwrap_or(1e-5);
                let noised = self.apply_dp(&data, epsilon, delta, sensitivity, &mechanism);

                self.audit_logger.log_privacy_applied(
                    query_id,
                    user_id,
                    PrivacyMethod::DifferentialPrivacy,
                    Some(epsilon),
                    Some(delta),
                    Some(sensitivity),
                    decision.params.columns.clone(),
                );

                let budget_status = if self.options.budget_enabled {
                    Some(self.budget_manager.get_budget_status(user_id))
                } else {
                    None
                };

                let mut method = mechanism.clone();
                if let Some(first) = method.get_mut(0..1) {
                    first.make_ascii_uppercase();
                }

                ProtectedData {
                    response_type: ResponseType::Dp,
                    original_query: sql.to_string(),
                    protected_result: Some(noised),
                    privacy_info: PrivacyInfo {
                        method,
                        epsilon: Some(epsilon),
                        delta: Some(delta),
                        sensitivity: Some(sensitivity),
                        budget_status,
                        ..Default::default()
                    },
                    error: None,
                }
            }
            PolicyAction::DeId => {
                let columns = decision.params.columns.clone();
                let protected = match &data {
                    Value::Array(rows) => {
                        let maps: Vec<Map<String, Value>> = rows
                            .iter()
                            .filter_map(|row| row.as_object().cloned())
                            .collect();
                        let rewritten = self.deid_rewriter.apply_deid(&maps, &columns);
                        Value::Array(rewritten.into_iter().map(Value::Object).collect())
                    }
                    other => other.clone(),
                };

                self.audit_logger.log_privacy_applied(
                    query_id,
                    user_id,
                    PrivacyMethod::Deidentification,
                    None,
                    None,
                    None,
                    columns.clone(),
                );

                ProtectedData {
                    response_type: ResponseType::DeId,
                    original_query: sql.to_string(),
                    protected_result: Some(protected),
                    privacy_info: PrivacyInfo {
                        method: "DeIdentification".to_string(),
                        columns_processed: columns.clone(),
                        methods_used: self.deid_rewriter.methods_used(&columns),
                        ..Default::default()
                    },
                    error: None,
                }
            }
            _ => ProtectedData {
                response_type: ResponseType::Pass,
                original_query: sql.to_string(),
                protected_result: Some(data),
                privacy_info: PrivacyInfo::none("No protection required"),
                error: None,
            },
        }
    }

    /// Add calibrated noise to every numeric value in the result.
    fn apply_dp(
        &self,
        data: &Value,
        epsilon: f64,
        delta: f64,
        sensitivity: f64,
        mechanism: &str,
    ) -> Value {
        let mut rng = self
            .rng
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut noise = |value: f64| -> Value {
            let noised = match mechanism {
                "gaussian" => {
                    mechanisms::add_gaussian_noise(&mut *rng, value, epsilon, delta, sensitivity)
                }
                _ => mechanisms::add_laplace_noise(&mut *rng, value, epsilon, sensitivity),
            };
            match noised {
                Ok(noised) => json!(noised),
                Err(_) => json!(value),
            }
        };

        match data {
            Value::Number(number) => number.as_f64().map(&mut noise).unwrap_or_else(|| data.clone()),
            Value::Object(object) => {
                let mut result = Map::new();
                for (key, value) in object {
                    match value.as_f64() {
                        Some(number) if value.is_number() => {
                            result.insert(key.clone(), noise(number));
                        }
                        _ => {
                            result.insert(key.clone(), value.clone());
                        }
                    }
                }
                Value::Object(result)
            }
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| match item {
                        Value::Object(object) => {
                            let mut result = Map::new();
                            for (key, value) in object {
                                match value.as_f64() {
                                    Some(number) if value.is_number() => {
                                        result.insert(key.clone(), noise(number));
                                    }
                                    _ => {
                                        result.insert(key.clone(), value.clone());
                                    }
                                }
                            }
                            Value::Object(result)
                        }
                        Value::Number(number) => number
                            .as_f64()
                            .map(&mut noise)
                            .unwrap_or_else(|| item.clone()),
                        other => other.clone(),
                    })
                    .collect(),
            ),
            other => other.clone(),
        }
    }
}
