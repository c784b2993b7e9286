use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value {value:?}")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub ledger_backend: LedgerBackend,
    pub redis_url: Option<String>,
    pub database_url: Option<String>,
    pub fleet_source: FleetSource,
    pub fleet_refresh: Duration,
    pub check_period: Duration,
    pub check_threshold: u32,
    pub liveness_timeout: Duration,
    pub probe_timeout: Duration,
    pub commit_timeout: Duration,
    pub agent_attempts: u32,
    pub agent_retry: Duration,
    pub notify_retries: u32,
    pub notify_retry: Duration,
    pub notify_queue_cap: usize,
    pub deallocation_notify_url: Option<String>,
    pub status_notify_url: Option<String>,
    pub request_deadline: Option<Duration>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            bind_addr: parsed("BROKER_ADDR", None)?
                .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 8095))),
            log_filter: std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,compute_broker=debug".into()),
            ledger_backend: LedgerBackend::from_env()?,
            redis_url: non_empty("REDIS_URL"),
            database_url: non_empty("DATABASE_URL"),
            fleet_source: FleetSource::from_env(),
            fleet_refresh: secs("BROKER_FLEET_REFRESH_SECS", 600)?,
            check_period: secs("BROKER_CHECK_PERIOD_SECS", 180)?,
            check_threshold: parsed("BROKER_CHECK_THRESHOLD", Some(20))?.unwrap_or(20),
            liveness_timeout: secs("BROKER_LIVENESS_TIMEOUT_SECS", 60)?,
            probe_timeout: secs("BROKER_PROBE_TIMEOUT_SECS", 100)?,
            commit_timeout: secs("BROKER_COMMIT_TIMEOUT_SECS", 100)?,
            agent_attempts: parsed("BROKER_AGENT_ATTEMPTS", Some(8))?.unwrap_or(8),
            agent_retry: secs("BROKER_AGENT_RETRY_SECS", 10)?,
            notify_retries: parsed("BROKER_NOTIFY_RETRIES", Some(3))?.unwrap_or(3),
            notify_retry: secs("BROKER_NOTIFY_RETRY_SECS", 15)?,
            notify_queue_cap: parsed("BROKER_NOTIFY_QUEUE_CAP", Some(10_000))?.unwrap_or(10_000),
            deallocation_notify_url: non_empty("BROKER_DEALLOCATION_NOTIFY_URL"),
            status_notify_url: non_empty("BROKER_STATUS_NOTIFY_URL"),
            request_deadline: parsed::<u64>("BROKER_REQUEST_DEADLINE_SECS", None)?
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        })
    }
}

fn non_empty(var: &str) -> Option<String> {
    std::env::var(var).ok().filter(|v| !v.trim().is_empty())
}

fn parsed<T: FromStr>(var: &'static str, default: Option<T>) -> Result<Option<T>, ConfigError> {
    match non_empty(var) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn secs(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(
        parsed(var, Some(default))?.unwrap_or(default),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    Auto,
    Postgres,
    Redis,
    InMemory,
}

impl LedgerBackend {
    fn from_env() -> Result<Self, ConfigError> {
        match std::env::var("BROKER_LEDGER_BACKEND") {
            Ok(value) => Self::parse(&value),
            Err(_) => Ok(LedgerBackend::Auto),
        }
    }

    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim() {
            "" | "auto" => Ok(LedgerBackend::Auto),
            "postgres" => Ok(LedgerBackend::Postgres),
            "redis" => Ok(LedgerBackend::Redis),
            "memory" => Ok(LedgerBackend::InMemory),
            _ => Err(ConfigError::Invalid {
                var: "BROKER_LEDGER_BACKEND",
                value: value.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetSource {
    Http(String),
    File(String),
    Empty,
}

impl FleetSource {
    fn from_env() -> Self {
        if let Some(url) = non_empty("BROKER_FLEET_URL") {
            return FleetSource::Http(url);
        }
        match non_empty("BROKER_FLEET_FILE") {
            Some(path) => FleetSource::File(path),
            None => FleetSource::Empty,
        }
    }
}
