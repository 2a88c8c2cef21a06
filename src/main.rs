use axum::{
    middleware as axum_middleware,
    routing::{delete, get, post, put},
    Router,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use veil::config::Config;
use veil::models::ResetSchedule;
use veil::privacy::SensitivityAnalyzer;
use veil::services::executor::{mysql::MySqlBackendConfig, MockExecutor, MySqlExecutor, QueryExecutor};
use veil::services::query_driver::DriverOptions;
use veil::services::{
    AuditLogger, BudgetManager, DistributedBudgetSync, DistributedCoordinator, PerformanceMonitor,
    PolicyConfigManager, PolicyEngine, QueryCache, QueryDriver, RateLimiter,
};
use veil::{handlers, middleware, AppState};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    let config = Config::load()?;

    let log_filter = tracing_subscriber::EnvFilter::new(&config.logging.level);
    let registry = tracing_subscriber::registry().with(log_filter);

    if let Some(log_file) = &config.logging.file {
        let log_path = std::path::Path::new(log_file);
        if let Some(parent) = log_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let log_dir = log_path.parent().and_then(|p| p.to_str()).unwrap_or("logs");
        let file_name = log_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("veil.log");
        let file_prefix = file_name.strip_suffix(".log").unwrap_or(file_name);

        let file_appender = tracing_appender::rolling::daily(log_dir, file_prefix);
        let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    tracing::info!("Veil starting up");
    tracing::info!("Configuration loaded successfully");

    // Policy configuration, optionally hot-reloaded from disk
    let policy_config = Arc::new(PolicyConfigManager::new(
        config.privacy.policy_config.as_ref().map(PathBuf::from),
    ));
    if config.privacy.hot_reload {
        policy_config.start_watcher();
        tracing::info!("Policy hot-reload watcher started");
    }

    let policy_engine = Arc::new(PolicyEngine::new(Arc::clone(&policy_config)));

    let budget_manager = Arc::new(BudgetManager::new(
        config.budget.default_budget,
        Some(config.budget.role_budgets.clone()),
        Some(ResetSchedule {
            frequency: config.budget.reset_frequency_parsed(),
            ..Default::default()
        }),
    ));

    let audit_logger = Arc::new(AuditLogger::new(config.audit.max_entries));
    let query_cache = Arc::new(QueryCache::new(
        config.cache.max_entries,
        config.cache.max_memory_mb,
        Duration::from_secs(config.cache.ttl_secs),
    ));
    let performance_monitor = Arc::new(PerformanceMonitor::new(10_000, 1_000.0));
    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit.requests_per_second,
        config.rate_limit.requests_per_minute,
        config.rate_limit.user_requests_per_minute,
    ));

    let mut sensitivity_analyzer = SensitivityAnalyzer::new();
    for (column, bounds) in &config.privacy.column_bounds {
        sensitivity_analyzer.set_bounds(column.clone(), bounds[0], bounds[1]);
    }

    let executor: Arc<dyn QueryExecutor> = match config.executor.mode.as_str() {
        "mysql" => {
            let backend = MySqlBackendConfig {
                host: config.executor.host.clone(),
                port: config.executor.port,
                user: config.executor.user.clone(),
                password: config.executor.password.clone(),
                database: config.executor.database.clone(),
            };
            tracing::info!(
                "Using MySQL executor backend at {}:{}",
                backend.host,
                backend.port
            );
            Arc::new(MySqlExecutor::new(&backend)?)
        }
        _ => {
            tracing::info!("Using mock executor backend");
            Arc::new(MockExecutor::new())
        }
    };

    let query_driver = Arc::new(QueryDriver::new(
        Arc::clone(&policy_engine),
        Arc::clone(&budget_manager),
        sensitivity_analyzer,
        Arc::clone(&executor),
        Arc::clone(&audit_logger),
        Arc::clone(&query_cache),
        Arc::clone(&performance_monitor),
        DriverOptions {
            budget_enabled: config.budget.enabled,
            refund_on_failure: config.privacy.refund_on_failure,
        },
    ));

    // Distributed mode: budget sync loop + instance coordinator
    let (budget_sync, coordinator) = if config.distributed.enabled {
        let instance_id = if config.distributed.instance_id.is_empty() {
            format!("veil_{}", &Uuid::new_v4().simple().to_string()[..12])
        } else {
            config.distributed.instance_id.clone()
        };
        tracing::info!("Distributed mode enabled (instance {})", instance_id);

        let sync = Arc::new(DistributedBudgetSync::new(
            instance_id,
            Duration::from_secs_f64(config.distributed.sync_interval_secs),
            Duration::from_secs_f64(config.distributed.lock_timeout_secs),
        ));

        // Deliver pending operations to every configured peer.
        let peers = config.distributed.peers.clone();
        if !peers.is_empty() {
            let client = reqwest::Client::new();
            let delivery_sync = Arc::clone(&sync);
            sync.on_sync(move |operations| {
                if operations.is_empty() {
                    return;
                }
                let client = client.clone();
                let peers = peers.clone();
                let delivery_sync = Arc::clone(&delivery_sync);
                tokio::spawn(async move {
                    for peer in &peers {
                        let url = format!("{}/api/sync/operations", peer);
                        match client.post(&url).json(&operations).send().await {
                            Ok(_) => tracing::debug!(
                                "Delivered {} operations to {}",
                                operations.len(),
                                peer
                            ),
                            Err(e) => {
                                tracing::warn!("Operation delivery to {} failed: {}", peer, e)
                            }
                        }
                    }
                    delivery_sync.clear_pending_operations();
                });
            });
        }
        sync.start_sync();

        let coordinator = Arc::new(DistributedCoordinator::new(
            Duration::from_secs_f64(config.distributed.heartbeat_interval_secs),
            Duration::from_secs_f64(config.distributed.health_check_timeout_secs),
            config.distributed.max_health_check_failures,
        ));
        coordinator.start_health_check();

        (Some(sync), Some(coordinator))
    } else {
        (None, None)
    };

    let app_state = Arc::new(AppState {
        config: config.clone(),
        policy_config: Arc::clone(&policy_config),
        policy_engine: Arc::clone(&policy_engine),
        budget_manager: Arc::clone(&budget_manager),
        audit_logger: Arc::clone(&audit_logger),
        query_cache: Arc::clone(&query_cache),
        performance_monitor: Arc::clone(&performance_monitor),
        rate_limiter: Arc::clone(&rate_limiter),
        query_driver: Arc::clone(&query_driver),
        budget_sync: budget_sync.clone(),
        coordinator: coordinator.clone(),
    });

    let query_routes = if config.rate_limit.enabled {
        let rate_limit_state = middleware::RateLimitState {
            limiter: Arc::clone(&rate_limiter),
        };
        Router::new()
            .route("/api/query", post(handlers::query::process_query))
            .layer(axum_middleware::from_fn_with_state(
                rate_limit_state,
                middleware::rate_limit_middleware,
            ))
            .with_state(Arc::clone(&app_state))
    } else {
        Router::new()
            .route("/api/query", post(handlers::query::process_query))
            .with_state(Arc::clone(&app_state))
    };

    let api_routes = Router::new()
        .route("/api/budget/:user_id", get(handlers::budget::get_budget))
        .route("/api/budget/:user_id", put(handlers::budget::set_budget))
        .route("/api/budget/:user_id/reset", post(handlers::budget::reset_budget))
        .route("/api/budget/:user_id/history", get(handlers::budget::get_history))
        .route("/api/audit/logs", get(handlers::audit::list_logs))
        .route("/api/audit/statistics", get(handlers::audit::statistics))
        .route("/api/audit/export", get(handlers::audit::export))
        .route("/api/audit/verify", get(handlers::audit::verify))
        .route("/api/system/cache", get(handlers::system::cache_statistics))
        .route("/api/system/performance", get(handlers::system::performance_statistics))
        .route("/api/system/slow-queries", get(handlers::system::slow_queries))
        .route("/api/system/rate-limit", get(handlers::system::rate_limit_statistics))
        .route("/api/policy/reload", post(handlers::system::reload_policy))
        .route(
            "/api/policy/sensitive-columns/:column",
            post(handlers::system::add_sensitive_column)
                .delete(handlers::system::remove_sensitive_column),
        )
        .with_state(Arc::clone(&app_state));

    let distributed_routes = if config.distributed.enabled {
        Router::new()
            .route("/api/sync/operations", post(handlers::sync::apply_operations))
            .route("/api/sync/state", post(handlers::sync::exchange_state))
            .route("/api/sync/statistics", get(handlers::sync::sync_statistics))
            .route(
                "/api/cluster/instances",
                post(handlers::sync::register_instance).get(handlers::sync::list_instances),
            )
            .route(
                "/api/cluster/instances/:instance_id",
                delete(handlers::sync::deregister_instance),
            )
            .route(
                "/api/cluster/instances/:instance_id/heartbeat",
                post(handlers::sync::heartbeat),
            )
            .route("/api/cluster/health", get(handlers::sync::cluster_health))
            .with_state(Arc::clone(&app_state))
    } else {
        Router::new()
    };

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check));

    let app = Router::new()
        .merge(query_routes)
        .merge(api_routes)
        .merge(distributed_routes)
        .merge(health_routes)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);
    tracing::info!("Veil is ready to serve requests");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop background loops with a bounded join before exiting.
    if config.privacy.hot_reload {
        policy_config.stop_watcher().await;
    }
    if let Some(sync) = &budget_sync {
        sync.stop_sync().await;
    }
    if let Some(coordinator) = &coordinator {
        coordinator.stop_health_check().await;
    }
    tracing::info!("Veil shut down cleanly");

    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn ready_check() -> &'static str {
    "READY"
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Shutdown signal received");
}
