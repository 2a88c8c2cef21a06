pub mod audit_log_service;
pub mod budget_service;
pub mod budget_sync;
pub mod coordinator;
pub mod executor;
pub mod load_balancer;
pub mod performance_monitor;
pub mod policy_config;
pub mod policy_engine;
pub mod query_cache;
pub mod query_driver;
pub mod rate_limiter;
pub mod sql_analyzer;

pub use audit_log_service::{AuditLogger, AuditStatistics};
pub use budget_service::BudgetManager;
pub use budget_sync::{BudgetState, DistributedBudgetSync, SyncOperation, SyncOperationType};
pub use coordinator::{DistributedCoordinator, InstanceStatus, ServiceInstance};
pub use executor::{MockExecutor, MySqlExecutor, QueryExecutor};
pub use load_balancer::{LoadBalancer, LoadBalancingStrategy};
pub use performance_monitor::{PerformanceMonitor, QueryMetrics, QueryPhase};
pub use policy_config::{PolicyConfigManager, PolicyDocument, RoleConfig};
pub use policy_engine::PolicyEngine;
pub use query_cache::QueryCache;
pub use query_driver::{DriverOptions, QueryDriver};
pub use rate_limiter::{RateLimitResult, RateLimiter};
pub use sql_analyzer::SqlAnalyzer;
