//! Configuration management for the Herald service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use herald_delivery::{
    ClientConfig, DrainConfig, FormatterConfig, RetryPolicy, DEFAULT_BATCH_SIZE,
    DEFAULT_DRAIN_CONCURRENCY,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "herald.toml";

/// Log filter used when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,herald=debug,tower_http=debug";

/// Service configuration with defaults, file, and environment overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`herald.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// Every setting has a working default except `OPERATOR_SECRET`. Without it
/// the service starts, but every internal route answers 401.
///
/// # Example
///
/// ```no_run
/// use herald_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Timeout in seconds for health and event-feed requests.
    ///
    /// The drain trigger is bounded by `drain_hard_timeout_secs` instead.
    ///
    /// Environment variable: `REQUEST_TIMEOUT`
    #[serde(default = "default_request_timeout", alias = "REQUEST_TIMEOUT")]
    pub request_timeout: u64,
    /// Bearer secret required on `/internal/*` routes.
    ///
    /// Environment variable: `OPERATOR_SECRET`
    #[serde(default, alias = "OPERATOR_SECRET", skip_serializing_if = "Option::is_none")]
    pub operator_secret: Option<String>,

    // Delivery
    /// Per-call timeout for outbound webhook requests in milliseconds.
    ///
    /// Environment variable: `DELIVERY_TIMEOUT_MS`
    #[serde(default = "default_delivery_timeout_ms", alias = "DELIVERY_TIMEOUT_MS")]
    pub delivery_timeout_ms: u64,

    // Retry
    /// Attempts per delivery before it is marked failed.
    ///
    /// Environment variable: `MAX_DELIVERY_ATTEMPTS`
    #[serde(default = "default_max_attempts", alias = "MAX_DELIVERY_ATTEMPTS")]
    pub max_delivery_attempts: u32,
    /// Base delay for exponential backoff in seconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_SECS`
    #[serde(default = "default_base_delay_secs", alias = "RETRY_BASE_DELAY_SECS")]
    pub retry_base_delay_secs: u64,
    /// Upper bound on the backoff delay in seconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_SECS`
    #[serde(default = "default_max_delay_secs", alias = "RETRY_MAX_DELAY_SECS")]
    pub retry_max_delay_secs: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER_FACTOR`
    #[serde(default = "default_jitter_factor", alias = "RETRY_JITTER_FACTOR")]
    pub retry_jitter_factor: f64,

    // Drain
    /// Time budget of one drain run in seconds.
    ///
    /// Environment variable: `DRAIN_BUDGET_SECS`
    #[serde(default = "default_drain_budget_secs", alias = "DRAIN_BUDGET_SECS")]
    pub drain_budget_secs: u64,
    /// Hard ceiling on the drain trigger request in seconds.
    ///
    /// Must exceed the drain budget plus one delivery timeout, the longest a
    /// run can take.
    ///
    /// Environment variable: `DRAIN_HARD_TIMEOUT_SECS`
    #[serde(default = "default_drain_hard_timeout_secs", alias = "DRAIN_HARD_TIMEOUT_SECS")]
    pub drain_hard_timeout_secs: u64,
    /// Delivery attempts in flight during a drain.
    ///
    /// Environment variable: `DRAIN_CONCURRENCY`
    #[serde(default = "default_drain_concurrency", alias = "DRAIN_CONCURRENCY")]
    pub drain_concurrency: usize,
    /// Records fetched per drain query.
    ///
    /// Environment variable: `DRAIN_BATCH_SIZE`
    #[serde(default = "default_drain_batch_size", alias = "DRAIN_BATCH_SIZE")]
    pub drain_batch_size: usize,
    /// Age in seconds after which an unfinished claim is returned to pending.
    ///
    /// Environment variable: `STALE_CLAIM_SECS`
    #[serde(default = "default_stale_claim_secs", alias = "STALE_CLAIM_SECS")]
    pub stale_claim_secs: u64,

    // Formatting
    /// Base URL for integration logos in Discord footers.
    ///
    /// Environment variable: `ASSET_BASE_URL`
    #[serde(default = "default_asset_base_url", alias = "ASSET_BASE_URL")]
    pub asset_base_url: String,

    // Logging
    /// Log filter directives.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment
    /// variable overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or the merged values
    /// fail validation.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to delivery client configuration.
    pub fn to_client_config(&self) -> ClientConfig {
        ClientConfig {
            timeout: Duration::from_millis(self.delivery_timeout_ms),
            ..ClientConfig::default()
        }
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_delivery_attempts,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            jitter_factor: self.retry_jitter_factor,
        }
    }

    /// Convert to drain scheduler configuration.
    pub fn to_drain_config(&self) -> DrainConfig {
        DrainConfig {
            batch_size: self.drain_batch_size,
            concurrency: self.drain_concurrency,
            stale_claim_threshold: Duration::from_secs(self.stale_claim_secs),
        }
    }

    /// Convert to payload formatter configuration.
    pub fn to_formatter_config(&self) -> FormatterConfig {
        FormatterConfig { asset_base_url: self.asset_base_url.clone() }
    }

    /// Time budget handed to each drain run.
    pub fn drain_budget(&self) -> Duration {
        Duration::from_secs(self.drain_budget_secs)
    }

    /// Ceiling the drain trigger races the run against.
    pub fn drain_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_hard_timeout_secs)
    }

    /// Timeout applied to health and event-feed requests.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Whether an operator secret is set.
    pub fn has_operator_secret(&self) -> bool {
        self.operator_secret.as_deref().is_some_and(|s| !s.trim().is_empty())
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.request_timeout == 0 {
            anyhow::bail!("request_timeout must be greater than 0");
        }

        if self.delivery_timeout_ms == 0 {
            anyhow::bail!("delivery_timeout_ms must be greater than 0");
        }

        if self.max_delivery_attempts == 0 {
            anyhow::bail!("max_delivery_attempts must be greater than 0");
        }

        if self.retry_base_delay_secs == 0 {
            anyhow::bail!("retry_base_delay_secs must be greater than 0");
        }

        if self.retry_max_delay_secs < self.retry_base_delay_secs {
            anyhow::bail!("retry_max_delay_secs cannot be less than retry_base_delay_secs");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter_factor) {
            anyhow::bail!("retry_jitter_factor must be between 0.0 and 1.0");
        }

        if self.drain_budget_secs == 0 {
            anyhow::bail!("drain_budget_secs must be greater than 0");
        }

        let longest_run_ms =
            self.drain_budget_secs.saturating_mul(1000).saturating_add(self.delivery_timeout_ms);
        if longest_run_ms >= self.drain_hard_timeout_secs.saturating_mul(1000) {
            anyhow::bail!(
                "drain_hard_timeout_secs must exceed drain_budget_secs plus delivery_timeout_ms"
            );
        }

        if self.delivery_timeout_ms >= self.drain_budget_secs.saturating_mul(1000) {
            anyhow::bail!("delivery_timeout_ms must be shorter than the drain budget");
        }

        if self.drain_concurrency == 0 {
            anyhow::bail!("drain_concurrency must be greater than 0");
        }

        if self.drain_batch_size == 0 {
            anyhow::bail!("drain_batch_size must be greater than 0");
        }

        if self.stale_claim_secs.saturating_mul(1000) <= self.delivery_timeout_ms {
            anyhow::bail!("stale_claim_secs must exceed the delivery timeout");
        }

        if !self.asset_base_url.starts_with("http://") && !self.asset_base_url.starts_with("https://")
        {
            anyhow::bail!("asset_base_url must be an http(s) URL");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            host: default_host(),
            port: default_port(),
            request_timeout: default_request_timeout(),
            operator_secret: None,
            delivery_timeout_ms: default_delivery_timeout_ms(),
            max_delivery_attempts: default_max_attempts(),
            retry_base_delay_secs: default_base_delay_secs(),
            retry_max_delay_secs: default_max_delay_secs(),
            retry_jitter_factor: default_jitter_factor(),
            drain_budget_secs: default_drain_budget_secs(),
            drain_hard_timeout_secs: default_drain_hard_timeout_secs(),
            drain_concurrency: default_drain_concurrency(),
            drain_batch_size: default_drain_batch_size(),
            stale_claim_secs: default_stale_claim_secs(),
            asset_base_url: default_asset_base_url(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/herald".to_string()
}

fn default_max_connections() -> u32 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout() -> u64 {
    30
}

fn default_delivery_timeout_ms() -> u64 {
    10_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_secs() -> u64 {
    30
}

fn default_max_delay_secs() -> u64 {
    3600
}

fn default_jitter_factor() -> f64 {
    0.0
}

fn default_drain_budget_secs() -> u64 {
    45
}

fn default_drain_hard_timeout_secs() -> u64 {
    60
}

fn default_drain_concurrency() -> usize {
    DEFAULT_DRAIN_CONCURRENCY
}

fn default_drain_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_stale_claim_secs() -> u64 {
    300
}

fn default_asset_base_url() -> String {
    herald_delivery::format::DEFAULT_ASSET_BASE_URL.to_string()
}

fn default_log_level() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
