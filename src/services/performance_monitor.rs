//! Per-query performance tracking and aggregate statistics.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct QueryMetrics {
    pub query_id: String,
    pub user_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub analysis_time_ms: f64,
    pub policy_time_ms: f64,
    pub execution_time_ms: f64,
    pub privacy_time_ms: f64,
    pub total_time_ms: f64,
    pub result_size_bytes: usize,
    pub cache_hit: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub enum QueryPhase {
    Analysis,
    Policy,
    Execution,
    Privacy,
}

struct MonitorState {
    metrics: VecDeque<QueryMetrics>,
    active: HashMap<String, QueryMetrics>,
    total_queries: u64,
    total_time_ms: f64,
    cache_hits: u64,
    slow_queries: u64,
    errors: u64,
}

pub struct PerformanceMonitor {
    state: Mutex<MonitorState>,
    max_metrics: usize,
    slow_query_threshold_ms: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceStatistics {
    pub total_queries: u64,
    pub total_time_ms: f64,
    pub average_time_ms: f64,
    pub cache_hits: u64,
    pub cache_hit_rate: f64,
    pub slow_queries: u64,
    pub slow_query_rate: f64,
    pub errors: u64,
    pub error_rate: f64,
    pub active_queries: usize,
    pub percentiles: Percentiles,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Percentiles {
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

impl PerformanceMonitor {
    pub fn new(max_metrics: usize, slow_query_threshold_ms: f64) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                metrics: VecDeque::new(),
                active: HashMap::new(),
                total_queries: 0,
                total_time_ms: 0.0,
                cache_hits: 0,
                slow_queries: 0,
                errors: 0,
            }),
            max_metrics: max_metrics.max(1),
            slow_query_threshold_ms,
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn start_query(&self, query_id: &str, user_id: &str) {
        let metrics = QueryMetrics {
            query_id: query_id.to_string(),
            user_id: user_id.to_string(),
            start_time: Utc::now(),
            end_time: None,
            analysis_time_ms: 0.0,
            policy_time_ms: 0.0,
            execution_time_ms: 0.0,
            privacy_time_ms: 0.0,
            total_time_ms: 0.0,
            result_size_bytes: 0,
            cache_hit: false,
            error: None,
        };
        self.lock_state()
            .active
            .insert(query_id.to_string(), metrics);
    }

    pub fn record_phase_time(&self, query_id: &str, phase: QueryPhase, time_ms: f64) {
        let mut state = self.lock_state();
        if let Some(metrics) = state.active.get_mut(query_id) {
            match phase {
                QueryPhase::Analysis => metrics.analysis_time_ms = time_ms,
                QueryPhase::Policy => metrics.policy_time_ms = time_ms,
                QueryPhase::Execution => metrics.execution_time_ms = time_ms,
                QueryPhase::Privacy => metrics.privacy_time_ms = time_ms,
            }
        }
    }

    pub fn record_cache_hit(&self, query_id: &str, hit: bool) {
        let mut state = self.lock_state();
        if let Some(metrics) = state.active.get_mut(query_id) {
            metrics.cache_hit = hit;
        }
    }

    pub fn record_result_size(&self, query_id: &str, size_bytes: usize) {
        let mut state = self.lock_state();
        if let Some(metrics) = state.active.get_mut(query_id) {
            metrics.result_size_bytes = size_bytes;
        }
    }

    pub fn record_error(&self, query_id: &str, error: &str) {
        let mut state = self.lock_state();
        if let Some(metrics) = state.active.get_mut(query_id) {
            metrics.error = Some(error.to_string());
        }
    }

    /// Finalize the metrics record; total time is derived from the
    /// start/end timestamps.
    pub fn end_query(&self, query_id: &str) -> Option<QueryMetrics> {
        let mut state = self.lock_state();
        let mut metrics = state.active.remove(query_id)?;

        let end = Utc::now();
        metrics.end_time = Some(end);
        metrics.total_time_ms =
            (end - metrics.start_time).num_microseconds().unwrap_or(0) as f64 / 1000.0;

        state.total_queries += 1;
        state.total_time_ms += metrics.total_time_ms;
        if metrics.cache_hit {
            state.cache_hits += 1;
        }
        if metrics.total_time_ms > self.slow_query_threshold_ms {
            state.slow_queries += 1;
        }
        if metrics.error.is_some() {
            state.errors += 1;
        }

        state.metrics.push_back(metrics.clone());
        while state.metrics.len() > self.max_metrics {
            state.metrics.pop_front();
        }

        Some(metrics)
    }

    pub fn get_metrics(&self, limit: usize) -> Vec<QueryMetrics> {
        let state = self.lock_state();
        state
            .metrics
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_metrics_by_user(&self, user_id: &str, limit: usize) -> Vec<QueryMetrics> {
        let state = self.lock_state();
        state
            .metrics
            .iter()
            .rev()
            .filter(|m| m.user_id == user_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn get_slow_queries(&self, limit: usize) -> Vec<QueryMetrics> {
        let state = self.lock_state();
        state
            .metrics
            .iter()
            .rev()
            .filter(|m| m.total_time_ms > self.slow_query_threshold_ms)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn is_slow_query(&self, total_time_ms: f64) -> bool {
        total_time_ms > self.slow_query_threshold_ms
    }

    fn percentiles(times: &[f64]) -> Percentiles {
        if times.is_empty() {
            return Percentiles {
                p50: 0.0,
                p90: 0.0,
                p95: 0.0,
                p99: 0.0,
            };
        }
        let mut sorted = times.to_vec();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let n = sorted.len();
        let pick = |q: f64| sorted[((n as f64 * q) as usize).min(n - 1)];
        Percentiles {
            p50: pick(0.5),
            p90: pick(0.9),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }

    pub fn get_statistics(&self) -> PerformanceStatistics {
        let state = self.lock_state();
        let total = state.total_queries;
        let times: Vec<f64> = state.metrics.iter().map(|m| m.total_time_ms).collect();

        let rate = |count: u64| {
            if total > 0 {
                count as f64 / total as f64
            } else {
                0.0
            }
        };

        PerformanceStatistics {
            total_queries: total,
            total_time_ms: state.total_time_ms,
            average_time_ms: if total > 0 {
                state.total_time_ms / total as f64
            } else {
                0.0
            },
            cache_hits: state.cache_hits,
            cache_hit_rate: rate(state.cache_hits),
            slow_queries: state.slow_queries,
            slow_query_rate: rate(state.slow_queries),
            errors: state.errors,
            error_rate: rate(state.errors),
            active_queries: state.active.len(),
            percentiles: Self::percentiles(&times),
        }
    }

    pub fn clear(&self) {
        let mut state = self.lock_state();
        state.metrics.clear();
        state.active.clear();
        state.total_queries = 0;
        state.total_time_ms = 0.0;
        state.cache_hits = 0;
        state.slow_queries = 0;
        state.errors = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_lifecycle() {
        let monitor = PerformanceMonitor::new(100, 1000.0);
        monitor.start_query("q1", "alice");
        monitor.record_phase_time("q1", QueryPhase::Analysis, 1.5);
        monitor.record_phase_time("q1", QueryPhase::Execution, 10.0);
        monitor.record_cache_hit("q1", true);
        monitor.record_result_size("q1", 256);

        let metrics = monitor.end_query("q1").unwrap();
        assert_eq!(metrics.analysis_time_ms, 1.5);
        assert_eq!(metrics.execution_time_ms, 10.0);
        assert!(metrics.cache_hit);
        assert!(metrics.end_time.is_some());
        assert!(metrics.total_time_ms >= 0.0);

        let stats = monitor.get_statistics();
        assert_eq!(stats.total_queries, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.active_queries, 0);
    }

    #[test]
    fn test_end_unknown_query_returns_none() {
        let monitor = PerformanceMonitor::new(100, 1000.0);
        assert!(monitor.end_query("missing").is_none());
    }

    #[test]
    fn test_error_counting() {
        let monitor = PerformanceMonitor::new(100, 1000.0);
        monitor.start_query("q1", "alice");
        monitor.record_error("q1", "backend unavailable");
        monitor.end_query("q1");

        let stats = monitor.get_statistics();
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.error_rate, 1.0);
    }

    #[test]
    fn test_metrics_ring_is_bounded() {
        let monitor = PerformanceMonitor::new(5, 1000.0);
        for i in 0..10 {
            let id = format!("q{}", i);
            monitor.start_query(&id, "alice");
            monitor.end_query(&id);
        }
        assert_eq!(monitor.get_metrics(100).len(), 5);
        assert_eq!(monitor.get_statistics().total_queries, 10);
    }

    #[test]
    fn test_per_user_listing() {
        let monitor = PerformanceMonitor::new(100, 1000.0);
        for (id, user) in [("q1", "alice"), ("q2", "bob"), ("q3", "alice")] {
            monitor.start_query(id, user);
            monitor.end_query(id);
        }
        assert_eq!(monitor.get_metrics_by_user("alice", 10).len(), 2);
        assert_eq!(monitor.get_metrics_by_user("bob", 10).len(), 1);
    }
}
