#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use broker_sdk::ledger::InMemoryLedger;
use broker_sdk::model::{AdvertisedCapacity, AgentCandidate, ResourceRequirement};
use compute_broker::crypto::{self, Credentials};
use compute_broker::engine::{AllocationEngine, EngineConfig};
use compute_broker::fleet::{FleetSnapshot, StaticFleetDirectory};
use compute_broker::liveness::{LivenessSnapshot, Reconciler};
use compute_broker::locks::AgentLocks;
use compute_broker::notify::{NotificationService, NotificationTask, Notifier, NotifyError};
use compute_broker::notify_queue::InMemoryRetryQueue;
use compute_broker::retry::RetryPolicy;
use compute_broker::rpc::{AgentRequest, AgentResponse, AgentRpc, RpcError};
use compute_broker::state::AppState;
use parking_lot::Mutex;
use tokio::sync::watch;

pub type TestResult = Result<(), Box<dyn std::error::Error>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Yes,
    No,
    Hang,
    Fail,
}

/// How a fake agent answers each kind of request. For heartbeats `Yes`
/// means "occupied", which is what a healthy leased agent reports.
#[derive(Debug, Clone, Copy)]
pub struct AgentScript {
    pub probe: Reply,
    pub commit: Reply,
    pub heartbeat: Reply,
    pub deregister: Reply,
}

impl Default for AgentScript {
    fn default() -> Self {
        Self {
            probe: Reply::Yes,
            commit: Reply::Yes,
            heartbeat: Reply::Yes,
            deregister: Reply::Yes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Probe,
    Commit,
    Heartbeat,
    Deregister,
    Container,
}

fn classify(request: &AgentRequest) -> CallKind {
    if request.docker_action.is_some() {
        CallKind::Container
    } else if !request.checking && request.timeline == 0 {
        CallKind::Deregister
    } else if !request.checking {
        CallKind::Commit
    } else if request.timeline == 1 && request.device_requirement == serde_json::json!({}) {
        CallKind::Heartbeat
    } else {
        CallKind::Probe
    }
}

#[derive(Default)]
pub struct FakeRpc {
    scripts: Mutex<HashMap<String, AgentScript>>,
    calls: Mutex<Vec<(String, CallKind, AgentRequest)>>,
}

impl FakeRpc {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, agent_id: &str, script: AgentScript) {
        self.scripts.lock().insert(agent_id.to_string(), script);
    }

    pub fn set_heartbeat(&self, agent_id: &str, reply: Reply) {
        self.scripts
            .lock()
            .entry(agent_id.to_string())
            .or_default()
            .heartbeat = reply;
    }

    pub fn calls(&self, agent_id: &str, kind: CallKind) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(id, k, _)| id == agent_id && *k == kind)
            .count()
    }

    pub fn last_request(&self, agent_id: &str, kind: CallKind) -> Option<AgentRequest> {
        self.calls
            .lock()
            .iter()
            .rev()
            .find(|(id, k, _)| id == agent_id && *k == kind)
            .map(|(_, _, request)| request.clone())
    }
}

#[async_trait]
impl AgentRpc for FakeRpc {
    async fn query(
        &self,
        agent: &AgentCandidate,
        request: &AgentRequest,
        timeout: Duration,
    ) -> Result<AgentResponse, RpcError> {
        let kind = classify(request);
        self.calls
            .lock()
            .push((agent.agent_id.clone(), kind, request.clone()));
        let script = self
            .scripts
            .lock()
            .get(&agent.agent_id)
            .copied()
            .unwrap_or_default();
        let reply = match kind {
            CallKind::Probe => script.probe,
            CallKind::Commit => script.commit,
            CallKind::Heartbeat => script.heartbeat,
            CallKind::Deregister => script.deregister,
            CallKind::Container => Reply::Yes,
        };
        match reply {
            Reply::Hang => {
                tokio::time::sleep(timeout).await;
                Err(RpcError::Timeout(timeout))
            }
            Reply::Fail => Err(RpcError::Transport("connection refused".into())),
            Reply::No => Ok(AgentResponse {
                // A free agent answers status=true to a heartbeat.
                status: kind == CallKind::Heartbeat,
                ..AgentResponse::default()
            }),
            Reply::Yes => match kind {
                CallKind::Commit => {
                    let public_key = request
                        .public_key
                        .as_deref()
                        .ok_or_else(|| RpcError::Malformed("missing public key".into()))?;
                    let creds = Credentials {
                        username: "root".into(),
                        password: format!("pw-{}", agent.agent_id),
                        port: 4422,
                    };
                    let plaintext = serde_json::to_vec(&creds)
                        .map_err(|e| RpcError::Malformed(e.to_string()))?;
                    let info = crypto::encrypt(public_key, &plaintext)
                        .map_err(|e| RpcError::Malformed(e.to_string()))?;
                    Ok(AgentResponse {
                        status: true,
                        info: Some(info),
                        ..AgentResponse::default()
                    })
                }
                CallKind::Heartbeat => Ok(AgentResponse::default()),
                _ => Ok(AgentResponse {
                    status: true,
                    ..AgentResponse::default()
                }),
            },
        }
    }
}

#[derive(Default)]
pub struct FakeNotifier {
    down: std::sync::atomic::AtomicBool,
    attempts: std::sync::atomic::AtomicUsize,
    delivered: Mutex<Vec<NotificationTask>>,
}

impl FakeNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn delivered(&self) -> Vec<NotificationTask> {
        self.delivered.lock().clone()
    }

    pub fn count(&self, event: &str) -> usize {
        self.delivered
            .lock()
            .iter()
            .filter(|task| task.event.as_str() == event)
            .count()
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    async fn deliver(&self, task: &NotificationTask) -> Result<(), NotifyError> {
        self.attempts
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        if self.down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(NotifyError::Rejected(503));
        }
        self.delivered.lock().push(task.clone());
        Ok(())
    }
}

pub fn agent(id: &str, gpu: Option<(&str, f64)>) -> AgentCandidate {
    AgentCandidate {
        agent_id: id.into(),
        address: format!("http://{id}.fleet.test:8091"),
        capability: AdvertisedCapacity {
            cpu_count: 16,
            gpu_name: gpu.map(|(name, _)| name.to_string()),
            gpu_capacity_gb: gpu.map(|(_, gb)| gb).unwrap_or(0.0),
            gpu_count: u32::from(gpu.is_some()),
            ram_gb: 128.0,
            hard_disk_gb: 1000.0,
        },
    }
}

pub fn gpu_requirement(kind: &str, gb: u32) -> ResourceRequirement {
    ResourceRequirement {
        cpu_count: 4,
        gpu_type: Some(kind.into()),
        gpu_capacity_gb: gb,
        ram_gb: 32,
        hard_disk_gb: 100,
        lease_days: 30,
    }
}

pub struct Harness {
    pub engine: Arc<AllocationEngine>,
    pub ledger: Arc<InMemoryLedger>,
    pub rpc: Arc<FakeRpc>,
    pub directory: Arc<StaticFleetDirectory>,
    pub notifier: Arc<FakeNotifier>,
    pub queue: Arc<InMemoryRetryQueue>,
    pub notifications: NotificationService,
}

impl Harness {
    pub async fn new(agents: Vec<AgentCandidate>) -> Self {
        Self::with_config(agents, EngineConfig::default()).await
    }

    pub async fn with_config(agents: Vec<AgentCandidate>, cfg: EngineConfig) -> Self {
        let ledger = InMemoryLedger::new();
        let rpc = FakeRpc::new();
        let directory = StaticFleetDirectory::new(agents);
        let fleet = FleetSnapshot::new(directory.clone());
        fleet.refresh().await.expect("static fleet");
        let engine = Arc::new(AllocationEngine::new(
            ledger.clone(),
            rpc.clone(),
            fleet,
            AgentLocks::new(),
            cfg,
        ));
        let notifier = FakeNotifier::new();
        let queue = Arc::new(InMemoryRetryQueue::new(10_000));
        let notifications = NotificationService::new(
            notifier.clone(),
            queue.clone(),
            RetryPolicy::new(3, Duration::from_secs(15)),
        );
        Self {
            engine,
            ledger,
            rpc,
            directory,
            notifier,
            queue,
            notifications,
        }
    }

    pub fn reconciler(&self, threshold: u32) -> (Reconciler, watch::Receiver<LivenessSnapshot>) {
        Reconciler::new(
            self.engine.clone(),
            self.notifications.clone(),
            threshold,
            Duration::from_secs(60),
        )
    }

    pub fn app_state(&self, deadline: Option<Duration>) -> AppState {
        let (_, liveness) = self.reconciler(20);
        AppState::new(
            self.engine.clone(),
            self.notifications.clone(),
            liveness,
            deadline,
            Duration::from_secs(60),
        )
    }
}
