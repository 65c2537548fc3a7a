//! Application configuration loaded from environment variables.

use std::time::Duration;

use saga::{ExecutorConfig, RecoveryConfig};

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("json") {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        }
    }
}

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST`: bind address (default: `"0.0.0.0"`)
/// - `PORT`: listen port (default: `3000`)
/// - `RUST_LOG`: tracing filter directive (default: `"info"`)
/// - `LOG_FORMAT`: `json` for structured logs, anything else for pretty output
/// - `DATABASE_URL`: PostgreSQL step log; the in-memory log is used when unset
/// - `WORKER_ID`: lease owner name for this process (default: random)
/// - `ACTION_TIMEOUT_MS`: bound on a single action call (default: `30000`)
/// - `COMPENSATION_ATTEMPTS`: tries per compensation (default: `3`)
/// - `LEASE_TTL_MS`: recovery lease lifetime (default: `30000`)
/// - `RECOVERY_INTERVAL_MS`: pause between recovery scans (default: `10000`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub database_url: Option<String>,
    pub worker_id: String,
    pub action_timeout_ms: u64,
    pub compensation_attempts: u32,
    pub lease_ttl_ms: u64,
    pub recovery_interval_ms: u64,
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.parse().ok())
        }

        Self {
            host: lookup("HOST").unwrap_or(defaults.host),
            port: parsed(&lookup, "PORT").unwrap_or(defaults.port),
            log_level: lookup("RUST_LOG").unwrap_or(defaults.log_level),
            log_format: lookup("LOG_FORMAT")
                .map(|v| LogFormat::parse(&v))
                .unwrap_or(defaults.log_format),
            database_url: lookup("DATABASE_URL").filter(|url| !url.is_empty()),
            worker_id: lookup("WORKER_ID").unwrap_or(defaults.worker_id),
            action_timeout_ms: parsed(&lookup, "ACTION_TIMEOUT_MS").unwrap_or(defaults.action_timeout_ms),
            compensation_attempts: parsed(&lookup, "COMPENSATION_ATTEMPTS")
                .unwrap_or(defaults.compensation_attempts),
            lease_ttl_ms: parsed(&lookup, "LEASE_TTL_MS").unwrap_or(defaults.lease_ttl_ms),
            recovery_interval_ms: parsed(&lookup, "RECOVERY_INTERVAL_MS")
                .unwrap_or(defaults.recovery_interval_ms),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig::default()
            .with_action_timeout(Duration::from_millis(self.action_timeout_ms))
            .with_compensation_attempts(self.compensation_attempts)
            .with_lease_ttl(Duration::from_millis(self.lease_ttl_ms))
    }

    pub fn recovery_config(&self) -> RecoveryConfig {
        RecoveryConfig::default()
            .with_worker_id(self.worker_id.clone())
            .with_lease_ttl(Duration::from_millis(self.lease_ttl_ms))
            .with_scan_interval(Duration::from_millis(self.recovery_interval_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            database_url: None,
            worker_id: format!("worker-{}", uuid::Uuid::new_v4()),
            action_timeout_ms: 30_000,
            compensation_attempts: 3,
            lease_ttl_ms: 30_000,
            recovery_interval_ms: 10_000,
        }
    }
}
