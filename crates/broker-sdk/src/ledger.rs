use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::model::Grant;

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("ledger record for {agent_id} is corrupt: {reason}")]
    Corrupt { agent_id: String, reason: String },
}

/// Durable store of current grants keyed by agent id.
///
/// `put` overwrites any prior record for the agent, so the store never holds
/// two active grants for one agent. Callers serialize writes per agent.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn put(&self, grant: Grant) -> Result<(), LedgerError>;

    async fn get(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError>;

    /// Remove the agent's grant, returning it marked released. The removed
    /// record is kept in the backend's audit trail.
    async fn delete(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError>;

    async fn list(&self) -> Result<Vec<Grant>, LedgerError>;
}

/// In-memory adapter for tests and single-process runs.
#[derive(Default)]
pub struct InMemoryLedger {
    current: Mutex<HashMap<String, Grant>>,
    released: Mutex<Vec<Grant>>,
}

impl InMemoryLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn released(&self) -> Vec<Grant> {
        self.released.lock().await.clone()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn put(&self, grant: Grant) -> Result<(), LedgerError> {
        self.current
            .lock()
            .await
            .insert(grant.agent_id.clone(), grant);
        Ok(())
    }

    async fn get(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError> {
        Ok(self.current.lock().await.get(agent_id).cloned())
    }

    async fn delete(&self, agent_id: &str) -> Result<Option<Grant>, LedgerError> {
        let removed = self.current.lock().await.remove(agent_id);
        let removed = removed.map(Grant::released);
        if let Some(grant) = &removed {
            self.released.lock().await.push(grant.clone());
        }
        Ok(removed)
    }

    async fn list(&self) -> Result<Vec<Grant>, LedgerError> {
        let mut grants: Vec<Grant> = self.current.lock().await.values().cloned().collect();
        grants.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(grants)
    }
}
