use std::time::Duration;

use broker_sdk::model::Grant;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::engine::{AllocationEngine, ReleaseError, ledger_error, record_rpc};
use crate::rpc::{AgentRequest, ContainerAction, DockerAction};

pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    NotFound,
    ContainerOnline,
    ContainerOffline,
    NoResponse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AgentStatusReport {
    pub agent_id: String,
    pub status: AgentStatus,
}

/// Probe each agent once and report whether its container is running.
pub async fn check_status(
    engine: &AllocationEngine,
    agent_ids: &[String],
    timeout: Duration,
) -> Vec<AgentStatusReport> {
    let heartbeat = AgentRequest::heartbeat();
    join_all(agent_ids.iter().map(|agent_id| {
        let heartbeat = &heartbeat;
        async move {
            let Some(agent) = engine.fleet().find(agent_id) else {
                return AgentStatusReport {
                    agent_id: agent_id.clone(),
                    status: AgentStatus::NotFound,
                };
            };
            let answer = engine.rpc().query(&agent, heartbeat, timeout).await;
            record_rpc("status", &answer);
            let status = match answer {
                Ok(response) if response.status => AgentStatus::ContainerOffline,
                Ok(_) => AgentStatus::ContainerOnline,
                Err(_) => AgentStatus::NoResponse,
            };
            AgentStatusReport {
                agent_id: agent_id.clone(),
                status,
            }
        }
    }))
    .await
}

/// Forward a container action for a validated lease. The agent's answer is
/// logged only; a key exchange also updates the stored key.
pub async fn container_action(
    engine: &AllocationEngine,
    agent_id: &str,
    lease_uuid: &str,
    action: ContainerAction,
    ssh_key: Option<String>,
) -> Result<Grant, ReleaseError> {
    let _guard = engine.locks().lock(agent_id).await;
    let mut grant = engine.authorize(agent_id, lease_uuid).await?;

    match engine.fleet().find(agent_id) {
        Some(agent) => {
            let request = AgentRequest::container_action(
                grant.public_key.clone(),
                DockerAction {
                    action,
                    ssh_key: ssh_key.clone(),
                },
            );
            let answer = engine.rpc().query(&agent, &request, CONTROL_TIMEOUT).await;
            record_rpc(action.as_str(), &answer);
            match answer {
                Ok(response) => info!(
                    agent_id,
                    action = action.as_str(),
                    accepted = response.status,
                    "container action answered"
                ),
                Err(err) => warn!(agent_id, action = action.as_str(), error = %err, "container action unanswered"),
            }
        }
        None => warn!(agent_id, action = action.as_str(), "agent not in fleet; action not sent"),
    }

    if action == ContainerAction::ExchangeKey {
        if let Some(key) = ssh_key.filter(|k| !k.trim().is_empty()) {
            grant.ssh_key = Some(key);
            engine
                .ledger()
                .put(grant.clone())
                .await
                .inspect_err(|err| ledger_error("put", err))?;
        }
    }
    Ok(grant)
}
