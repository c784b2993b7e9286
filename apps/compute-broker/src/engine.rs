use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use broker_sdk::ledger::LedgerError;
use broker_sdk::matcher::match_candidates;
use broker_sdk::model::{
    AgentCandidate, Connection, ContainerRequirement, Grant, GrantStatus, ResourceRequirement,
};
use futures::future::join_all;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::crypto::KeyPair;
use crate::fleet::FleetSnapshot;
use crate::ledger::LedgerHandle;
use crate::locks::AgentLocks;
use crate::metrics;
use crate::retry::RetryPolicy;
use crate::rpc::{AgentRequest, AgentResponse, AgentRpc, RpcError};

/// Lease length requested when a caller names the agent directly.
pub const AGENT_LEASE_DAYS: u32 = 30;

#[derive(Debug, thiserror::Error)]
pub enum AllocationError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("no inventory: {0}")]
    NoInventory(String),
    #[error("commit failed: {0}")]
    CommitFailed(String),
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

impl AllocationError {
    fn label(&self) -> &'static str {
        match self {
            AllocationError::InvalidRequest(_) => "invalid",
            AllocationError::NoInventory(_) => "no_inventory",
            AllocationError::CommitFailed(_) => "commit_failed",
            AllocationError::Storage(_) => "storage",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReleaseError {
    #[error("no grant for agent {0}")]
    NotFound(String),
    #[error("lease uuid does not match the grant for agent {0}")]
    InvalidLease(String),
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

/// Why a single commit against one agent did not produce a grant.
#[derive(Debug, thiserror::Error)]
enum CommitError {
    #[error("agent already holds a grant")]
    AlreadyGranted,
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("agent refused the commit")]
    Refused,
    #[error("agent credentials unusable: {0}")]
    Credentials(String),
    #[error(transparent)]
    Storage(#[from] LedgerError),
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub probe_timeout: Duration,
    pub commit_timeout: Duration,
    pub agent_policy: RetryPolicy,
    pub agent_probe_timeout: Duration,
    pub agent_commit_timeout: Duration,
    pub release_policy: RetryPolicy,
    pub release_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            probe_timeout: Duration::from_secs(100),
            commit_timeout: Duration::from_secs(100),
            agent_policy: RetryPolicy::new(8, Duration::from_secs(10)),
            agent_probe_timeout: Duration::from_secs(30),
            agent_commit_timeout: Duration::from_secs(60),
            release_policy: RetryPolicy::new(3, Duration::from_secs(1)),
            release_timeout: Duration::from_secs(60),
        }
    }
}

/// Probe-then-commit allocation, release, and guarded revocation.
///
/// Every ledger write for an agent happens while that agent's lock is held,
/// and the ledger is re-read under the lock before a commit, so two
/// concurrent requests can never both grant the same agent.
pub struct AllocationEngine {
    ledger: LedgerHandle,
    rpc: Arc<dyn AgentRpc>,
    fleet: FleetSnapshot,
    locks: AgentLocks,
    cfg: EngineConfig,
}

impl AllocationEngine {
    pub fn new(
        ledger: LedgerHandle,
        rpc: Arc<dyn AgentRpc>,
        fleet: FleetSnapshot,
        locks: AgentLocks,
        cfg: EngineConfig,
    ) -> Self {
        Self {
            ledger,
            rpc,
            fleet,
            locks,
            cfg,
        }
    }

    pub fn ledger(&self) -> &LedgerHandle {
        &self.ledger
    }

    pub fn rpc(&self) -> &Arc<dyn AgentRpc> {
        &self.rpc
    }

    pub fn fleet(&self) -> &FleetSnapshot {
        &self.fleet
    }

    pub fn locks(&self) -> &AgentLocks {
        &self.locks
    }

    pub async fn allocate(
        &self,
        requirement: &ResourceRequirement,
        container: Option<ContainerRequirement>,
    ) -> Result<Grant, AllocationError> {
        let outcome = self.allocate_inner(requirement, container).await;
        record_outcome("spec", &outcome);
        outcome
    }

    async fn allocate_inner(
        &self,
        requirement: &ResourceRequirement,
        container: Option<ContainerRequirement>,
    ) -> Result<Grant, AllocationError> {
        requirement
            .validate()
            .map_err(|e| AllocationError::InvalidRequest(e.to_string()))?;

        let allocated: HashSet<String> = self
            .ledger
            .list()
            .await
            .inspect_err(|err| ledger_error("list", err))?
            .into_iter()
            .filter(Grant::is_active)
            .map(|grant| grant.agent_id)
            .collect();
        let fleet = self.fleet.agents();
        let matched: HashSet<String> = match_candidates(requirement, &fleet, &allocated)
            .into_iter()
            .collect();
        if matched.is_empty() {
            return Err(AllocationError::NoInventory(
                "no agent satisfies the requirement".into(),
            ));
        }
        let candidates: Vec<&AgentCandidate> = fleet
            .iter()
            .filter(|agent| matched.contains(&agent.agent_id))
            .collect();

        let probe = AgentRequest::probe(requirement);
        let answers = join_all(candidates.iter().map(|agent| {
            let probe = &probe;
            async move {
                let result = self.rpc.query(agent, probe, self.cfg.probe_timeout).await;
                record_rpc("probe", &result);
                (*agent, result)
            }
        }))
        .await;
        let affirmative: Vec<AgentCandidate> = answers
            .into_iter()
            .filter_map(|(agent, result)| match result {
                Ok(AgentResponse { status: true, .. }) => Some(agent.clone()),
                Ok(_) => {
                    debug!(agent_id = %agent.agent_id, "probe declined");
                    None
                }
                Err(err) => {
                    debug!(agent_id = %agent.agent_id, error = %err, "probe failed");
                    None
                }
            })
            .collect();
        if affirmative.is_empty() {
            return Err(AllocationError::NoInventory(format!(
                "none of {} matching agents accepted the probe",
                matched.len()
            )));
        }

        let mut last_failure = String::new();
        for agent in rank(affirmative) {
            match self
                .commit(
                    &agent,
                    requirement,
                    container.clone(),
                    None,
                    self.cfg.commit_timeout,
                )
                .await
            {
                Ok(grant) => return Ok(grant),
                Err(CommitError::Storage(err)) => return Err(err.into()),
                Err(err) => {
                    warn!(agent_id = %agent.agent_id, error = %err, "commit failed; trying next candidate");
                    last_failure = format!("{}: {err}", agent.agent_id);
                }
            }
        }
        Err(AllocationError::CommitFailed(format!(
            "every accepting agent failed to commit (last: {last_failure})"
        )))
    }

    /// Lease one named agent, retrying the whole probe and commit exchange
    /// under the agent policy.
    pub async fn allocate_by_agent(
        &self,
        agent_id: &str,
        ssh_key: Option<String>,
        container: Option<ContainerRequirement>,
    ) -> Result<Grant, AllocationError> {
        let outcome = self.allocate_by_agent_inner(agent_id, ssh_key, container).await;
        record_outcome("agent", &outcome);
        outcome
    }

    async fn allocate_by_agent_inner(
        &self,
        agent_id: &str,
        ssh_key: Option<String>,
        container: Option<ContainerRequirement>,
    ) -> Result<Grant, AllocationError> {
        let Some(agent) = self.fleet.find(agent_id) else {
            return Err(AllocationError::NoInventory(format!(
                "agent {agent_id} is not in the fleet"
            )));
        };
        let existing = self
            .ledger
            .get(agent_id)
            .await
            .inspect_err(|err| ledger_error("get", err))?;
        if existing.is_some_and(|grant| grant.is_active()) {
            return Err(AllocationError::NoInventory(format!(
                "agent {agent_id} is already allocated"
            )));
        }

        let requirement = ResourceRequirement::minimal(AGENT_LEASE_DAYS);
        let probe = AgentRequest::probe(&requirement);
        let (agent, probe, requirement) = (&agent, &probe, &requirement);
        let (container, ssh_key) = (&container, &ssh_key);
        // Ok(Err(_)) ends the retry loop early with a final answer.
        let try_once = move |attempt: u32| {
            let container = container.clone();
            let ssh_key = ssh_key.clone();
            async move {
                debug!(agent_id = %agent.agent_id, attempt, "allocate-by-agent attempt");
                let answer = self
                    .rpc
                    .query(agent, probe, self.cfg.agent_probe_timeout)
                    .await;
                record_rpc("probe", &answer);
                match answer {
                    Ok(AgentResponse { status: true, .. }) => {}
                    Ok(_) => return Err("agent declined the probe".to_string()),
                    Err(err) => return Err(err.to_string()),
                }
                match self
                    .commit(
                        agent,
                        requirement,
                        container,
                        ssh_key,
                        self.cfg.agent_commit_timeout,
                    )
                    .await
                {
                    Ok(grant) => Ok(Ok(grant)),
                    Err(CommitError::Storage(err)) => Ok(Err(AllocationError::Storage(err))),
                    Err(CommitError::AlreadyGranted) => Ok(Err(AllocationError::NoInventory(
                        format!("agent {} was allocated concurrently", agent.agent_id),
                    ))),
                    Err(err) => Err(err.to_string()),
                }
            }
        };
        match self.cfg.agent_policy.run(try_once).await {
            Ok(outcome) => outcome,
            Err(exhausted) => Err(AllocationError::CommitFailed(format!(
                "agent {agent_id} did not accept after {} attempts: {}",
                exhausted.attempts, exhausted.last
            ))),
        }
    }

    async fn commit(
        &self,
        agent: &AgentCandidate,
        requirement: &ResourceRequirement,
        container: Option<ContainerRequirement>,
        ssh_key: Option<String>,
        timeout: Duration,
    ) -> Result<Grant, CommitError> {
        let _guard = self.locks.lock(&agent.agent_id).await;
        let existing = self
            .ledger
            .get(&agent.agent_id)
            .await
            .inspect_err(|err| ledger_error("get", err))?;
        if existing.is_some_and(|grant| grant.is_active()) {
            return Err(CommitError::AlreadyGranted);
        }

        let keys = KeyPair::generate();
        let public_key = keys.public_key();
        let ssh_key = ssh_key.filter(|key| !key.trim().is_empty()).or_else(|| {
            container
                .as_ref()
                .map(|c| c.ssh_key.clone())
                .filter(|key| !key.is_empty())
        });
        // The requester's key rides along with the container settings.
        let container = match &ssh_key {
            Some(key) => Some(ContainerRequirement {
                ssh_key: key.clone(),
                ..container.unwrap_or_default()
            }),
            None => container,
        };
        let request = AgentRequest::commit(requirement, public_key.clone(), container);
        let response = self.rpc.query(agent, &request, timeout).await;
        record_rpc("commit", &response);
        let response = response?;
        if !response.status {
            return Err(CommitError::Refused);
        }
        let connection = connection_from(agent, &response, &keys)?;

        let grant = Grant {
            agent_id: agent.agent_id.clone(),
            lease_uuid: Uuid::new_v4(),
            public_key,
            connection: Some(connection),
            resource_label: agent.resource_label(),
            ssh_key,
            created_at: chrono::Utc::now(),
            status: GrantStatus::Active,
        };
        self.ledger
            .put(grant.clone())
            .await
            .inspect_err(|err| ledger_error("put", err))?;
        info!(
            agent_id = %grant.agent_id,
            lease_uuid = %grant.lease_uuid,
            resource = %grant.resource_label,
            "grant committed"
        );
        Ok(grant)
    }

    /// Release a grant held under `lease_uuid`. The agent is told to
    /// deregister on a best-effort basis; the ledger entry goes regardless.
    pub async fn release(&self, agent_id: &str, lease_uuid: &str) -> Result<Grant, ReleaseError> {
        let _guard = self.locks.lock(agent_id).await;
        let Some(grant) = self
            .ledger
            .get(agent_id)
            .await
            .inspect_err(|err| ledger_error("get", err))?
        else {
            return Err(ReleaseError::NotFound(agent_id.to_string()));
        };
        if !lease_matches(&grant, lease_uuid) {
            return Err(ReleaseError::InvalidLease(agent_id.to_string()));
        }

        match self.fleet.find(agent_id) {
            Some(agent) => {
                let request = AgentRequest::deregister(grant.public_key.clone());
                let (agent, request) = (&agent, &request);
                let deregistered = self
                    .cfg
                    .release_policy
                    .run(move |_| async move {
                        let result = self
                            .rpc
                            .query(agent, request, self.cfg.release_timeout)
                            .await;
                        record_rpc("deregister", &result);
                        match result {
                            Ok(AgentResponse { status: true, .. }) => Ok(()),
                            Ok(_) => Err("agent refused deregistration".to_string()),
                            Err(err) => Err(err.to_string()),
                        }
                    })
                    .await;
                if let Err(exhausted) = deregistered {
                    warn!(agent_id, error = %exhausted, "agent did not acknowledge deregistration");
                }
            }
            None => debug!(agent_id, "released agent is no longer in the fleet"),
        }

        let removed = self
            .ledger
            .delete(agent_id)
            .await
            .inspect_err(|err| ledger_error("delete", err))?;
        let released = removed.ok_or_else(|| ReleaseError::NotFound(agent_id.to_string()))?;
        info!(agent_id, lease_uuid = %released.lease_uuid, "grant released");
        Ok(released)
    }

    /// Delete the agent's grant only if it is still the one identified by
    /// `lease_uuid`. Returns the removed grant.
    pub async fn revoke_if_current(
        &self,
        agent_id: &str,
        lease_uuid: Uuid,
    ) -> Result<Option<Grant>, LedgerError> {
        let _guard = self.locks.lock(agent_id).await;
        let current = self
            .ledger
            .get(agent_id)
            .await
            .inspect_err(|err| ledger_error("get", err))?;
        match current {
            Some(grant) if grant.lease_uuid == lease_uuid => self
                .ledger
                .delete(agent_id)
                .await
                .inspect_err(|err| ledger_error("delete", err)),
            _ => Ok(None),
        }
    }

    /// Look up the active grant for `agent_id` and check the caller's lease.
    pub async fn authorize(&self, agent_id: &str, lease_uuid: &str) -> Result<Grant, ReleaseError> {
        let grant = self
            .ledger
            .get(agent_id)
            .await
            .inspect_err(|err| ledger_error("get", err))?
            .ok_or_else(|| ReleaseError::NotFound(agent_id.to_string()))?;
        if !lease_matches(&grant, lease_uuid) {
            return Err(ReleaseError::InvalidLease(agent_id.to_string()));
        }
        Ok(grant)
    }
}

fn lease_matches(grant: &Grant, lease_uuid: &str) -> bool {
    Uuid::parse_str(lease_uuid.trim()).is_ok_and(|uuid| uuid == grant.lease_uuid)
}

fn connection_from(
    agent: &AgentCandidate,
    response: &AgentResponse,
    keys: &KeyPair,
) -> Result<Connection, CommitError> {
    let blob = response
        .info
        .as_deref()
        .ok_or_else(|| CommitError::Credentials("missing info blob".into()))?;
    let creds = keys
        .decrypt_credentials(blob)
        .map_err(|e| CommitError::Credentials(e.to_string()))?;
    Ok(Connection {
        ip: response.ip.clone().unwrap_or_else(|| agent.host()),
        port: creds.port,
        username: creds.username,
        password: creds.password,
    })
}

/// Orders accepting agents for commit. All candidates score equally; the
/// stable sort keeps probe enumeration order.
pub fn rank(candidates: Vec<AgentCandidate>) -> Vec<AgentCandidate> {
    let mut scored: Vec<(u32, AgentCandidate)> = candidates
        .into_iter()
        .map(|agent| (score(&agent), agent))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0));
    scored.into_iter().map(|(_, agent)| agent).collect()
}

fn score(_agent: &AgentCandidate) -> u32 {
    1
}

fn record_outcome(mode: &str, outcome: &Result<Grant, AllocationError>) {
    let result = match outcome {
        Ok(_) => "ok",
        Err(err) => err.label(),
    };
    metrics::ALLOCATION_OUTCOMES
        .with_label_values(&[mode, result])
        .inc();
}

pub(crate) fn record_rpc<T>(phase: &str, result: &Result<T, RpcError>) {
    let label = match result {
        Ok(_) => "answered",
        Err(RpcError::Timeout(_)) => "timeout",
        Err(RpcError::Transport(_)) => "transport",
        Err(RpcError::Malformed(_)) => "malformed",
    };
    metrics::PROBE_OUTCOMES
        .with_label_values(&[phase, label])
        .inc();
}

pub(crate) fn ledger_error(kind: &str, err: &LedgerError) {
    warn!(op = kind, error = %err, "ledger operation failed");
    metrics::LEDGER_ERRORS.with_label_values(&[kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str) -> AgentCandidate {
        AgentCandidate {
            agent_id: id.into(),
            address: format!("http://{id}:8091"),
            capability: Default::default(),
        }
    }

    #[test]
    fn rank_keeps_enumeration_order() {
        let ranked = rank(vec![candidate("c"), candidate("a"), candidate("b")]);
        let ids: Vec<&str> = ranked.iter().map(|a| a.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn lease_comparison_parses_uuid() {
        let uuid = Uuid::new_v4();
        let grant = Grant {
            agent_id: "a".into(),
            lease_uuid: uuid,
            public_key: "pk".into(),
            connection: None,
            resource_label: "cpu".into(),
            ssh_key: None,
            created_at: chrono::Utc::now(),
            status: GrantStatus::Active,
        };
        assert!(lease_matches(&grant, &uuid.to_string().to_uppercase()));
        assert!(!lease_matches(&grant, "not-a-uuid"));
        assert!(!lease_matches(&grant, &Uuid::new_v4().to_string()));
    }
}
