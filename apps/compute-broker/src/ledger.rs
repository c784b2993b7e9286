use std::sync::Arc;

use broker_sdk::ledger::{InMemoryLedger, Ledger};
use tracing::{info, warn};

use crate::config::{AppConfig, LedgerBackend};
use crate::ledger_postgres::PostgresLedger;
use crate::ledger_redis::RedisLedger;

pub type LedgerHandle = Arc<dyn Ledger>;

/// Picks the configured backend. `Auto` tries Postgres, then Redis, then
/// memory; an explicit backend that cannot start falls back to memory.
pub async fn build_ledger(cfg: &AppConfig) -> LedgerHandle {
    let want_pg = matches!(cfg.ledger_backend, LedgerBackend::Auto | LedgerBackend::Postgres);
    let want_redis = matches!(cfg.ledger_backend, LedgerBackend::Auto | LedgerBackend::Redis);

    if want_pg {
        match cfg.database_url.as_deref() {
            Some(url) => match PostgresLedger::connect(url).await {
                Ok(ledger) => {
                    info!("allocation ledger: postgres");
                    return Arc::new(ledger);
                }
                Err(err) => warn!(error = %err, "failed to init postgres ledger"),
            },
            None if cfg.ledger_backend == LedgerBackend::Postgres => {
                warn!("BROKER_LEDGER_BACKEND=postgres but DATABASE_URL missing")
            }
            None => {}
        }
    }
    if want_redis {
        match cfg.redis_url.as_deref() {
            Some(url) => match RedisLedger::connect(url) {
                Ok(ledger) => {
                    info!("allocation ledger: redis");
                    return Arc::new(ledger);
                }
                Err(err) => warn!(error = %err, "failed to init redis ledger"),
            },
            None if cfg.ledger_backend == LedgerBackend::Redis => {
                warn!("BROKER_LEDGER_BACKEND=redis but REDIS_URL missing")
            }
            None => {}
        }
    }
    if cfg.ledger_backend != LedgerBackend::InMemory {
        warn!("allocation ledger falling back to in-memory; grants will not survive restart");
    }
    InMemoryLedger::new()
}
