use std::time::Duration;

// Runtime configuration for the worker process, loaded once from the
// environment (and a .env file if present).
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub admin_addr: Option<String>,
    pub migrate_on_startup: bool,
    pub reap_stale_after: Option<Duration>,
    pub max_attempts: i32,
    /// Off unless `ENRICH_HANDLER_TIMEOUT_SECS` is set.
    pub handler_timeout: Option<Duration>,
    pub log_format: LogFormat,
    pub db: DbSettings,
}

/// Connection pool settings, shared by the worker and `enrichctl`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DbSettings {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    /// Run `SET jit = OFF` on every new connection.
    pub disable_jit: bool,
}

impl Default for DbSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_DB_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS),
            disable_jit: true,
        }
    }
}

impl DbSettings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let max_connections = get("ENRICH_DB_MAX_CONNECTIONS")
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS)
            .clamp(1, 32);

        let acquire_timeout_secs = get("ENRICH_DB_ACQUIRE_TIMEOUT_SECS")
            .and_then(|s| s.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_DB_ACQUIRE_TIMEOUT_SECS)
            .clamp(1, 60);

        let disable_jit = get("ENRICH_DISABLE_JIT")
            .map(|v| parse_bool(&v))
            .unwrap_or(true);

        Self {
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
            disable_jit,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 700;
pub const DEFAULT_BATCH_SIZE: usize = 30;
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 4;
pub const DEFAULT_DB_ACQUIRE_TIMEOUT_SECS: u64 = 10;

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is missing"))?;

        let worker_id = env_or_fallback("ENRICH_WORKER_ID", "WORKER_ID")
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "worker-1".to_string());

        let poll_interval_ms = env_or_fallback("ENRICH_POLL_INTERVAL_MS", "POLL_INTERVAL_MS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_POLL_INTERVAL_MS)
            .max(10);

        let batch_size = env_or_fallback("ENRICH_BATCH_SIZE", "BATCH_SIZE")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(DEFAULT_BATCH_SIZE)
            .clamp(1, 500);

        let admin_addr = env_or_fallback("ENRICH_ADMIN_ADDR", "ADMIN_ADDR")
            .and_then(|s| normalize_optional_addr(&s));

        let migrate_on_startup = env_bool("ENRICH_MIGRATE_ON_STARTUP").unwrap_or(false);

        let reap_stale_after = std::env::var("ENRICH_REAP_STALE_AFTER_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let max_attempts = std::env::var("ENRICH_MAX_ATTEMPTS")
            .ok()
            .and_then(|s| s.parse::<i32>().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS)
            .max(1);

        let handler_timeout = std::env::var("ENRICH_HANDLER_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let log_format = match std::env::var("ENRICH_LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            database_url,
            worker_id,
            poll_interval: Duration::from_millis(poll_interval_ms),
            batch_size,
            admin_addr,
            migrate_on_startup,
            reap_stale_after,
            max_attempts,
            handler_timeout,
            log_format,
            db: DbSettings::from_env(),
        })
    }
}

fn env_or_fallback(primary: &str, fallback: &str) -> Option<String> {
    std::env::var(primary)
        .ok()
        .filter(|s| !s.trim().is_empty())
        .or_else(|| std::env::var(fallback).ok().filter(|s| !s.trim().is_empty()))
}

fn env_bool(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| parse_bool(&v))
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
