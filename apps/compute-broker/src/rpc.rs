use std::time::Duration;

use async_trait::async_trait;
use broker_sdk::model::{AgentCandidate, ContainerRequirement, ResourceRequirement};
use serde::{Deserialize, Serialize};

/// Request sent to an agent. `checking=true` is a non-binding probe;
/// `checking=false` commits (or, with `timeline=0`, deregisters).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub timeline: u32,
    pub device_requirement: serde_json::Value,
    pub checking: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_requirement: Option<ContainerRequirement>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker_action: Option<DockerAction>,
}

impl AgentRequest {
    pub fn probe(requirement: &ResourceRequirement) -> Self {
        Self {
            timeline: requirement.lease_days,
            device_requirement: requirement.device_requirement(),
            checking: true,
            public_key: None,
            docker_requirement: None,
            docker_action: None,
        }
    }

    pub fn commit(
        requirement: &ResourceRequirement,
        public_key: String,
        container: Option<ContainerRequirement>,
    ) -> Self {
        Self {
            checking: false,
            public_key: Some(public_key),
            docker_requirement: container,
            ..Self::probe(requirement)
        }
    }

    /// Liveness check: a one-day, empty-requirement probe.
    pub fn heartbeat() -> Self {
        Self {
            timeline: 1,
            device_requirement: serde_json::json!({}),
            checking: true,
            public_key: None,
            docker_requirement: None,
            docker_action: None,
        }
    }

    pub fn deregister(public_key: String) -> Self {
        Self {
            timeline: 0,
            device_requirement: serde_json::json!({}),
            checking: false,
            public_key: Some(public_key),
            docker_requirement: None,
            docker_action: None,
        }
    }

    pub fn container_action(public_key: String, action: DockerAction) -> Self {
        Self {
            docker_action: Some(action),
            ..Self::deregister(public_key)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerAction {
    pub action: ContainerAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerAction {
    Restart,
    Pause,
    Unpause,
    ExchangeKey,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Restart => "restart",
            ContainerAction::Pause => "pause",
            ContainerAction::Unpause => "unpause",
            ContainerAction::ExchangeKey => "exchange_key",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub status: bool,
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("agent did not answer within {0:?}")]
    Timeout(Duration),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("malformed agent response: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait AgentRpc: Send + Sync {
    async fn query(
        &self,
        agent: &AgentCandidate,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, RpcError>;
}

/// JSON over HTTP: `POST {address}/allocate`.
pub struct HttpAgentRpc {
    http: reqwest::Client,
}

impl HttpAgentRpc {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }

    fn endpoint(agent: &AgentCandidate) -> String {
        let base = agent.address.trim_end_matches('/');
        if base.contains("://") {
            format!("{base}/allocate")
        } else {
            format!("http://{base}/allocate")
        }
    }
}

impl Default for HttpAgentRpc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRpc for HttpAgentRpc {
    async fn query(
        &self,
        agent: &AgentCandidate,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, RpcError> {
        let call = async {
            let res = self
                .http
                .post(Self::endpoint(agent))
                .json(request)
                .send()
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?;
            if !res.status().is_success() {
                return Err(RpcError::Transport(format!("http status {}", res.status())));
            }
            res.json::<AgentResponse>()
                .await
                .map_err(|e| RpcError::Malformed(e.to_string()))
        };
        tokio::time::timeout(timeout, call)
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }
}
