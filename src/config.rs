//! Runtime configuration, read from the environment with sensible defaults.

use std::path::PathBuf;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

/// Settings for the isolated per-instance pools. Webhook traffic gets at
/// most `max_size` connections per instance.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    /// Time allowed to establish a new connection.
    pub connect_timeout: Duration,
    /// Time a caller may wait for a free connection before failing.
    pub wait_timeout: Duration,
    /// Time allowed to recycle an idle connection on checkout.
    pub recycle_timeout: Duration,
    /// Server-side statement timeout, applied per connection.
    pub statement_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_size: 3,
            connect_timeout: Duration::from_secs(5),
            wait_timeout: Duration::from_secs(8),
            recycle_timeout: Duration::from_secs(10),
            statement_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: String,
    /// Public base used when building shareable webhook URLs.
    pub base_url: String,
    pub data_dir: PathBuf,
    /// Token gating the issuance/admin surface. Admin routes refuse all
    /// requests when unset.
    pub admin_token: Option<String>,
    pub sweep_interval: Duration,
    pub pool: PoolSettings,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3080".to_string(),
            base_url: "http://localhost:3080".to_string(),
            data_dir: PathBuf::from("data"),
            admin_token: None,
            sweep_interval: Duration::from_secs(300),
            pool: PoolSettings::default(),
        }
    }
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_or("WEBHOOK_BIND_ADDR", defaults.bind_addr),
            base_url: env_or("WEBHOOK_BASE_URL", defaults.base_url),
            data_dir: std::env::var("WEBHOOK_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            admin_token: std::env::var("WEBHOOK_ADMIN_TOKEN").ok().filter(|t| !t.is_empty()),
            sweep_interval: Duration::from_secs(env_or("WEBHOOK_POOL_SWEEP_SECS", 300)),
            pool: PoolSettings {
                max_size: env_or("WEBHOOK_POOL_MAX_SIZE", defaults.pool.max_size),
                connect_timeout: Duration::from_secs(env_or("WEBHOOK_POOL_CONNECT_SECS", 5)),
                wait_timeout: Duration::from_secs(env_or("WEBHOOK_POOL_WAIT_SECS", 8)),
                recycle_timeout: Duration::from_secs(env_or("WEBHOOK_POOL_RECYCLE_SECS", 10)),
                statement_timeout_ms: env_or("WEBHOOK_STATEMENT_TIMEOUT_MS", 30_000),
            },
        }
    }
}
