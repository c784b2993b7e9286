use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;

/// Per-agent async mutexes. Commit, release and revocation for the same agent
/// serialize on the agent's entry; different agents never contend.
#[derive(Clone, Default)]
pub struct AgentLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl AgentLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, agent_id: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock();
            map.entry(agent_id.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }

    /// Drops entries nobody holds or waits on.
    pub fn prune(&self) {
        self.inner
            .lock()
            .retain(|_, entry| Arc::strong_count(entry) > 1);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
