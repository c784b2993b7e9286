use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_sdk::model::AgentCandidate;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::FleetSource;

#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    #[error("fleet fetch failed: {0}")]
    Fetch(String),
    #[error("fleet listing malformed: {0}")]
    Decode(String),
}

/// Read-only source of the agents the broker may lease.
#[async_trait]
pub trait FleetDirectory: Send + Sync {
    async fn fetch(&self) -> Result<Vec<AgentCandidate>, FleetError>;
}

pub struct HttpFleetDirectory {
    http: reqwest::Client,
    url: String,
}

impl HttpFleetDirectory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl FleetDirectory for HttpFleetDirectory {
    async fn fetch(&self) -> Result<Vec<AgentCandidate>, FleetError> {
        let res = self
            .http
            .get(&self.url)
            .send()
            .await
            .map_err(|e| FleetError::Fetch(e.to_string()))?;
        if !res.status().is_success() {
            return Err(FleetError::Fetch(format!("http status {}", res.status())));
        }
        res.json()
            .await
            .map_err(|e| FleetError::Decode(e.to_string()))
    }
}

/// JSON array of candidates on disk, re-read on every refresh.
pub struct FileFleetDirectory {
    path: PathBuf,
}

impl FileFleetDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl FleetDirectory for FileFleetDirectory {
    async fn fetch(&self) -> Result<Vec<AgentCandidate>, FleetError> {
        let raw = tokio::fs::read(&self.path)
            .await
            .map_err(|e| FleetError::Fetch(format!("{}: {e}", self.path.display())))?;
        serde_json::from_slice(&raw).map_err(|e| FleetError::Decode(e.to_string()))
    }
}

/// Fixed listing; also what tests plug in.
#[derive(Default)]
pub struct StaticFleetDirectory {
    agents: RwLock<Vec<AgentCandidate>>,
}

impl StaticFleetDirectory {
    pub fn new(agents: Vec<AgentCandidate>) -> Arc<Self> {
        Arc::new(Self {
            agents: RwLock::new(agents),
        })
    }

    pub fn replace(&self, agents: Vec<AgentCandidate>) {
        *self.agents.write() = agents;
    }
}

#[async_trait]
impl FleetDirectory for StaticFleetDirectory {
    async fn fetch(&self) -> Result<Vec<AgentCandidate>, FleetError> {
        Ok(self.agents.read().clone())
    }
}

pub fn build_directory(source: &FleetSource) -> Arc<dyn FleetDirectory> {
    match source {
        FleetSource::Http(url) => Arc::new(HttpFleetDirectory::new(url.clone())),
        FleetSource::File(path) => Arc::new(FileFleetDirectory::new(path.clone())),
        FleetSource::Empty => {
            warn!("no BROKER_FLEET_URL or BROKER_FLEET_FILE set; fleet is empty");
            StaticFleetDirectory::new(Vec::new())
        }
    }
}

/// Last successfully fetched fleet. Readers get a cheap `Arc` clone; a failed
/// refresh keeps the previous listing.
#[derive(Clone)]
pub struct FleetSnapshot {
    directory: Arc<dyn FleetDirectory>,
    current: Arc<RwLock<Arc<Vec<AgentCandidate>>>>,
}

impl FleetSnapshot {
    pub fn new(directory: Arc<dyn FleetDirectory>) -> Self {
        Self {
            directory,
            current: Arc::new(RwLock::new(Arc::new(Vec::new()))),
        }
    }

    pub fn agents(&self) -> Arc<Vec<AgentCandidate>> {
        self.current.read().clone()
    }

    pub fn find(&self, agent_id: &str) -> Option<AgentCandidate> {
        self.current
            .read()
            .iter()
            .find(|agent| agent.agent_id == agent_id)
            .cloned()
    }

    pub async fn refresh(&self) -> Result<usize, FleetError> {
        let agents = self.directory.fetch().await?;
        let count = agents.len();
        *self.current.write() = Arc::new(agents);
        debug!(agents = count, "fleet snapshot refreshed");
        Ok(count)
    }

    pub fn spawn_refresh(&self, period: Duration) -> JoinHandle<()> {
        let snapshot = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(err) = snapshot.refresh().await {
                    warn!(error = %err, "fleet refresh failed; keeping previous snapshot");
                }
            }
        })
    }
}
