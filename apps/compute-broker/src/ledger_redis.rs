use std::collections::HashMap;

use async_trait::async_trait;
use broker_sdk::ledger::{Ledger, LedgerError};
use broker_sdk::model::Grant;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::warn;

use crate::metrics;

const ALLOCATIONS: &str = "broker:allocation";
const AUDIT: &str = "broker:allocation:audit";
const MAX_AUDIT_LEN: isize = 10_000;

/// Grants as JSON in a hash keyed by agent id; released grants go to a capped list.
pub struct RedisLedger {
    client: redis::Client,
}

impl RedisLedger {
    pub fn connect(url: &str) -> Result<Self, LedgerError> {
        let client = redis::Client::open(url).map_err(unavailable)?;
        Ok(Self { client })
    }

    async fn conn(&self) -> Result<ConnectionManager, LedgerError> {
        self.client
            .get_connection_manager()
            .await
            .map_err(unavailable)
    }
}

fn unavailable(err: impl std::fmt::Display) -> LedgerError {
    LedgerError::Unavailable(err.to_string())
}

fn decode(agent_id: &str, payload: &str) -> Result<Grant, LedgerError> {
    serde_json::from_str(payload).map_err(|e| LedgerError::Corrupt {
        agent_id: agent_id.to_string(),
        reason: e.to_string(),
    })
}

async fn push_audit(conn: &mut ConnectionManager, grant: &Grant) -> Result<(), LedgerError> {
    let audit = serde_json::to_string(grant).map_err(unavailable)?;
    let _: () = redis::pipe()
        .rpush(AUDIT, audit)
        .ignore()
        .ltrim(AUDIT, -MAX_AUDIT_LEN, -1)
        .ignore()
        .query_async(conn)
        .await
        .map_err(unavailable)?;
    Ok(())
}

/// The grant is gone once HDEL commits; a failed audit write is reported
/// but does not turn the removal into an error.
fn settle_delete(grant: Grant, audit: Result<(), LedgerError>) -> Grant {
    if let Err(err) = audit {
        metrics::LEDGER_ERRORS.with_label_values(&["audit"]).inc();
        warn!(agent_id = %grant.agent_id, error = %err, "released grant not written to audit list");
    }
    grant
}

#[async_trait]
impl Ledger for RedisLedger {
    async fn put(&self, grant: Grant) -> Result<(), LedgerError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&grant).map_err(unavailable)?;
        let _: () = conn
            .hset(ALLOCATIONS, &grant.agent_id, payload)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError> {
        let mut conn = self.conn().await?;
        let payload: Option<String> = conn.hget(ALLOCATIONS, agent_id).await.map_err(unavailable)?;
        payload.map(|p| decode(agent_id, &p)).transpose()
    }

    async fn delete(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError> {
        let mut conn = self.conn().await?;
        // HGET + HDEL in one MULTI so a concurrent put cannot slip between them.
        let (payload, _removed): (Option<String>, i64) = redis::pipe()
            .atomic()
            .hget(ALLOCATIONS, agent_id)
            .hdel(ALLOCATIONS, agent_id)
            .query_async(&mut conn)
            .await
            .map_err(unavailable)?;
        let Some(payload) = payload else {
            return Ok(None);
        };
        let grant = decode(agent_id, &payload)?.released();
        let audit = push_audit(&mut conn, &grant).await;
        Ok(Some(settle_delete(grant, audit)))
    }

    async fn list(&self) -> Result<Vec<Grant>, LedgerError> {
        let mut conn = self.conn().await?;
        let entries: HashMap<String, String> =
            conn.hgetall(ALLOCATIONS).await.map_err(unavailable)?;
        let mut grants = entries
            .iter()
            .map(|(agent_id, payload)| decode(agent_id, payload))
            .collect::<Result<Vec<_>, _>>()?;
        grants.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(grants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use broker_sdk::model::GrantStatus;

    fn released_grant() -> Grant {
        Grant {
            agent_id: "audited".into(),
            lease_uuid: uuid::Uuid::new_v4(),
            public_key: "pk".into(),
            connection: None,
            resource_label: "cpu".into(),
            ssh_key: None,
            created_at: chrono::Utc::now(),
            status: GrantStatus::Released,
        }
    }

    #[test]
    fn failed_audit_still_reports_removal() {
        let grant = released_grant();
        let before = metrics::LEDGER_ERRORS.with_label_values(&["audit"]).get();
        let settled = settle_delete(
            grant.clone(),
            Err(LedgerError::Unavailable("connection reset".into())),
        );
        assert_eq!(settled, grant);
        assert_eq!(
            metrics::LEDGER_ERRORS.with_label_values(&["audit"]).get(),
            before + 1
        );
    }

    #[tokio::test]
    #[ignore]
    async fn redis_ledger_roundtrip() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let ledger = RedisLedger::connect(&url).expect("redis");
        let grant = Grant {
            agent_id: format!("redis-agent-{}", uuid::Uuid::new_v4()),
            lease_uuid: uuid::Uuid::new_v4(),
            public_key: "pk".into(),
            connection: None,
            resource_label: "cpu".into(),
            ssh_key: None,
            created_at: chrono::Utc::now(),
            status: GrantStatus::Active,
        };
        ledger.put(grant.clone()).await.unwrap();
        assert!(ledger.list().await.unwrap().iter().any(|g| g.agent_id == grant.agent_id));
        let removed = ledger.delete(&grant.agent_id).await.unwrap().unwrap();
        assert_eq!(removed.status, GrantStatus::Released);
        assert!(ledger.delete(&grant.agent_id).await.unwrap().is_none());
    }
}
