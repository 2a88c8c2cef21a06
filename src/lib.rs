//! Veil Library
//!
//! This library contains all the core modules for the Veil privacy-enforcing
//! SQL query mediator.

use std::sync::Arc;

pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod privacy;
pub mod services;
pub mod utils;

#[cfg(test)]
mod tests;

// Re-export commonly used types
pub use config::Config;
pub use services::{
    AuditLogger, BudgetManager, DistributedBudgetSync, DistributedCoordinator, PerformanceMonitor,
    PolicyConfigManager, PolicyEngine, QueryCache, QueryDriver, RateLimiter, SqlAnalyzer,
};
pub use utils::{ApiError, ApiResult};

/// Application shared state
///
/// Design Philosophy: Keep it simple - Rust's type system IS our DI container.
/// No need for Service Container pattern with dyn Any.
/// All services are wrapped in Arc for cheap cloning and thread safety.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,

    pub policy_config: Arc<PolicyConfigManager>,
    pub policy_engine: Arc<PolicyEngine>,
    pub budget_manager: Arc<BudgetManager>,
    pub audit_logger: Arc<AuditLogger>,
    pub query_cache: Arc<QueryCache>,
    pub performance_monitor: Arc<PerformanceMonitor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub query_driver: Arc<QueryDriver>,

    pub budget_sync: Option<Arc<DistributedBudgetSync>>,
    pub coordinator: Option<Arc<DistributedCoordinator>>,
}
