use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub privacy: PrivacyConfig,
    pub budget: BudgetConfig,
    pub audit: AuditConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub executor: ExecutorConfig,
    pub distributed: DistributedConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

/// Privacy-core settings: where the policy document lives and how the
/// driver behaves around it
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PrivacyConfig {
    /// Path to the policy TOML document (rules, roles, patterns, ...)
    pub policy_config: Option<String>,
    /// Watch the policy file and hot-reload on change
    pub hot_reload: bool,
    /// Refund the debited epsilon when the executor fails
    pub refund_on_failure: bool,
    /// Value bounds per column, used for SUM/AVG sensitivity:
    /// [privacy.column_bounds] salary = [0.0, 100000.0]
    pub column_bounds: HashMap<String, [f64; 2]>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub enabled: bool,
    pub default_budget: f64,
    /// Per-role total budgets; the "default" key mirrors default_budget
    pub role_budgets: HashMap<String, f64>,
    /// daily | weekly | monthly | never
    pub reset_frequency: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Maximum in-memory audit entries before head truncation
    pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: usize,
    pub max_memory_mb: f64,
    pub ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_second: usize,
    pub requests_per_minute: usize,
    pub user_requests_per_minute: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// mock | mysql
    pub mode: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DistributedConfig {
    pub enabled: bool,
    /// Instance id; generated when empty
    pub instance_id: String,
    pub sync_interval_secs: f64,
    pub lock_timeout_secs: f64,
    pub heartbeat_interval_secs: f64,
    pub health_check_timeout_secs: f64,
    pub max_health_check_failures: u32,
    /// Peer base URLs for operation delivery, e.g. "http://10.0.0.2:8080"
    pub peers: Vec<String>,
}

/// Command line arguments for configuration overrides
#[derive(Parser, Debug, Clone)]
#[command(name = "veil")]
#[command(version, about = "Veil - Privacy-Enforcing SQL Query Mediator")]
pub struct CommandLineArgs {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<String>,

    /// Server host (overrides config file)
    #[arg(long, value_name = "HOST")]
    pub server_host: Option<String>,

    /// Server port (overrides config file)
    #[arg(long, value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Logging level (overrides config file, e.g., "info,veil=debug")
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Path to the policy document (overrides config file)
    #[arg(long, value_name = "PATH")]
    pub policy_config: Option<String>,

    /// Default per-user privacy budget (overrides config file)
    #[arg(long, value_name = "EPSILON")]
    pub default_budget: Option<f64>,

    /// Executor mode: mock or mysql (overrides config file)
    #[arg(long, value_name = "MODE")]
    pub executor_mode: Option<String>,

    /// Enable distributed mode (overrides config file)
    #[arg(long, value_name = "BOOL")]
    pub distributed: Option<bool>,
}

impl Config {
    /// Load configuration with command line, environment variable, and file support
    ///
    /// Loading order (priority from highest to lowest):
    /// 1. Command line arguments
    /// 2. Environment variables (prefixed with APP_)
    /// 3. Configuration file (config.toml)
    /// 4. Default values
    pub fn load() -> Result<Self, anyhow::Error> {
        let cli_args = CommandLineArgs::parse();
        Self::load_with_args(&cli_args)
    }

    pub fn load_with_args(cli_args: &CommandLineArgs) -> Result<Self, anyhow::Error> {
        let config_path = cli_args.config.clone().or_else(Self::find_config_file);
        let mut config = if let Some(config_path) = config_path {
            Self::from_toml(&config_path)?
        } else {
            tracing::warn!("Configuration file not found, using defaults");
            Config::default()
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(cli_args);
        config.validate()?;

        Ok(config)
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - APP_SERVER_HOST: Server host (default: 0.0.0.0)
    /// - APP_SERVER_PORT: Server port (default: 8080)
    /// - APP_LOG_LEVEL: Logging level (e.g., "info,veil=debug")
    /// - APP_POLICY_CONFIG: Policy document path
    /// - APP_DEFAULT_BUDGET: Default per-user privacy budget
    /// - APP_EXECUTOR_MODE: mock | mysql
    /// - APP_DISTRIBUTED_ENABLED: Enable distributed mode (true/false)
    fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("APP_SERVER_HOST") {
            self.server.host = host;
            tracing::info!("Override server.host from env: {}", self.server.host);
        }

        if let Ok(port) = std::env::var("APP_SERVER_PORT") {
            if let Ok(port) = port.parse() {
                self.server.port = port;
                tracing::info!("Override server.port from env: {}", self.server.port);
            }
        }

        if let Ok(level) = std::env::var("APP_LOG_LEVEL") {
            self.logging.level = level;
            tracing::info!("Override logging.level from env: {}", self.logging.level);
        }

        if let Ok(path) = std::env::var("APP_POLICY_CONFIG") {
            self.privacy.policy_config = Some(path);
            tracing::info!("Override privacy.policy_config from env");
        }

        if let Ok(budget) = std::env::var("APP_DEFAULT_BUDGET") {
            match budget.parse() {
                Ok(value) => {
                    self.budget.default_budget = value;
                    tracing::info!(
                        "Override budget.default_budget from env: {}",
                        self.budget.default_budget
                    );
                }
                Err(e) => tracing::warn!(
                    "Invalid APP_DEFAULT_BUDGET '{}': {} (keep {})",
                    budget,
                    e,
                    self.budget.default_budget
                ),
            }
        }

        if let Ok(mode) = std::env::var("APP_EXECUTOR_MODE") {
            self.executor.mode = mode;
            tracing::info!("Override executor.mode from env: {}", self.executor.mode);
        }

        if let Ok(enabled) = std::env::var("APP_DISTRIBUTED_ENABLED") {
            if let Ok(value) = enabled.parse() {
                self.distributed.enabled = value;
                tracing::info!(
                    "Override distributed.enabled from env: {}",
                    self.distributed.enabled
                );
            }
        }
    }

    /// Apply command line argument overrides (highest priority)
    fn apply_cli_overrides(&mut self, args: &CommandLineArgs) {
        if let Some(host) = &args.server_host {
            self.server.host = host.clone();
            tracing::info!("Override server.host from CLI: {}", self.server.host);
        }

        if let Some(port) = args.server_port {
            self.server.port = port;
            tracing::info!("Override server.port from CLI: {}", self.server.port);
        }

        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
            tracing::info!("Override logging.level from CLI: {}", self.logging.level);
        }

        if let Some(path) = &args.policy_config {
            self.privacy.policy_config = Some(path.clone());
            tracing::info!("Override privacy.policy_config from CLI");
        }

        if let Some(budget) = args.default_budget {
            self.budget.default_budget = budget;
            tracing::info!(
                "Override budget.default_budget from CLI: {}",
                self.budget.default_budget
            );
        }

        if let Some(mode) = &args.executor_mode {
            self.executor.mode = mode.clone();
            tracing::info!("Override executor.mode from CLI: {}", self.executor.mode);
        }

        if let Some(enabled) = args.distributed {
            self.distributed.enabled = enabled;
            tracing::info!(
                "Override distributed.enabled from CLI: {}",
                self.distributed.enabled
            );
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), anyhow::Error> {
        if self.server.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }

        if self.budget.default_budget <= 0.0 {
            anyhow::bail!("budget.default_budget must be > 0");
        }

        match self.budget.reset_frequency.as_str() {
            "daily" | "weekly" | "monthly" | "never" => {}
            other => anyhow::bail!("budget.reset_frequency must be daily|weekly|monthly|never, got '{}'", other),
        }

        match self.executor.mode.as_str() {
            "mock" | "mysql" => {}
            other => anyhow::bail!("executor.mode must be mock|mysql, got '{}'", other),
        }

        if self.audit.max_entries == 0 {
            anyhow::bail!("audit.max_entries must be > 0");
        }

        if self.rate_limit.enabled
            && (self.rate_limit.requests_per_second == 0
                || self.rate_limit.requests_per_minute == 0
                || self.rate_limit.user_requests_per_minute == 0)
        {
            anyhow::bail!("rate_limit windows must be > 0 when rate limiting is enabled");
        }

        for (column, bounds) in &self.privacy.column_bounds {
            if bounds[1] < bounds[0] {
                anyhow::bail!(
                    "privacy.column_bounds.{} has upper < lower ({} < {})",
                    column,
                    bounds[1],
                    bounds[0]
                );
            }
        }

        Ok(())
    }

    fn find_config_file() -> Option<String> {
        let possible_paths =
            ["conf/config.toml", "config.toml", "./conf/config.toml", "./config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                return Some(path.to_string());
            }
        }
        None
    }

    fn from_toml(path: &str) -> Result<Self, anyhow::Error> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: "0.0.0.0".to_string(), port: 8080 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info,veil=debug".to_string(),
            file: Some("logs/veil.log".to_string()),
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            policy_config: Some("conf/policy.toml".to_string()),
            hot_reload: false,
            refund_on_failure: true,
            column_bounds: HashMap::new(),
        }
    }
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_budget: 1.0,
            role_budgets: HashMap::new(),
            reset_frequency: "daily".to_string(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_entries: 1000, max_memory_mb: 50.0, ttl_secs: 300 }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: 10,
            requests_per_minute: 100,
            user_requests_per_minute: 50,
        }
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: "mock".to_string(),
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: None,
            database: None,
        }
    }
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            instance_id: String::new(),
            sync_interval_secs: 1.0,
            lock_timeout_secs: 5.0,
            heartbeat_interval_secs: 5.0,
            health_check_timeout_secs: 10.0,
            max_health_check_failures: 3,
            peers: Vec::new(),
        }
    }
}

impl BudgetConfig {
    pub fn reset_frequency_parsed(&self) -> crate::models::ResetFrequency {
        match self.reset_frequency.as_str() {
            "weekly" => crate::models::ResetFrequency::Weekly,
            "monthly" => crate::models::ResetFrequency::Monthly,
            "never" => crate::models::ResetFrequency::Never,
            _ => crate::models::ResetFrequency::Daily,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.budget.default_budget, 1.0);
        assert_eq!(config.executor.mode, "mock");
    }

    #[test]
    fn test_invalid_reset_frequency_rejected() {
        let mut config = Config::default();
        config.budget.reset_frequency = "hourly".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut config = Config::default();
        config
            .privacy
            .column_bounds
            .insert("salary".to_string(), [100.0, 0.0]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_parsing() {
        let raw = r#"
            [server]
            host = "127.0.0.1"
            port = 9090

            [budget]
            default_budget = 2.5
            reset_frequency = "weekly"

            [budget.role_budgets]
            admin = 10.0
            analyst = 5.0

            [privacy.column_bounds]
            salary = [0.0, 100000.0]

            [rate_limit]
            requests_per_second = 20
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.budget.default_budget, 2.5);
        assert_eq!(config.budget.role_budgets["admin"], 10.0);
        assert_eq!(config.privacy.column_bounds["salary"], [0.0, 100000.0]);
        assert_eq!(config.rate_limit.requests_per_second, 20);
        // Unspecified sections fall back to defaults
        assert_eq!(config.cache.max_entries, 1000);
    }
}
