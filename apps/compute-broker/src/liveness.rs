use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use broker_sdk::model::Grant;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{AllocationEngine, record_rpc};
use crate::metrics;
use crate::notify::{NotificationEvent, NotificationService, NotificationTask};
use crate::rpc::AgentRequest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Healthy,
    Suspect,
    Deallocated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LivenessState {
    pub agent_id: String,
    pub lease_uuid: Uuid,
    pub consecutive_failures: u32,
    pub state: Health,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    WentOffline,
    CameOnline,
    Revoke,
}

/// Hysteresis over probe results: one failure marks a grant suspect, a
/// success clears it, `threshold` consecutive failures revoke it.
#[derive(Debug)]
pub struct LivenessTracker {
    threshold: u32,
    states: HashMap<String, LivenessState>,
}

impl LivenessTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            states: HashMap::new(),
        }
    }

    fn entry(&mut self, agent_id: &str, lease_uuid: Uuid) -> &mut LivenessState {
        let fresh = || LivenessState {
            agent_id: agent_id.to_string(),
            lease_uuid,
            consecutive_failures: 0,
            state: Health::Healthy,
        };
        let state = self
            .states
            .entry(agent_id.to_string())
            .or_insert_with(fresh);
        // A new lease on the same agent starts clean.
        if state.lease_uuid != lease_uuid {
            *state = fresh();
        }
        state
    }

    pub fn record_success(&mut self, agent_id: &str, lease_uuid: Uuid) -> Transition {
        let state = self.entry(agent_id, lease_uuid);
        // A revoke that failed on storage leaves the grant in place as Deallocated.
        let was_offline = matches!(state.state, Health::Suspect | Health::Deallocated);
        state.consecutive_failures = 0;
        state.state = Health::Healthy;
        if was_offline {
            Transition::CameOnline
        } else {
            Transition::Unchanged
        }
    }

    pub fn record_failure(&mut self, agent_id: &str, lease_uuid: Uuid) -> Transition {
        let threshold = self.threshold;
        let state = self.entry(agent_id, lease_uuid);
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        if state.consecutive_failures >= threshold {
            state.state = Health::Deallocated;
            return Transition::Revoke;
        }
        match state.state {
            Health::Healthy => {
                state.state = Health::Suspect;
                Transition::WentOffline
            }
            Health::Suspect | Health::Deallocated => Transition::Unchanged,
        }
    }

    pub fn forget(&mut self, agent_id: &str) {
        self.states.remove(agent_id);
    }

    /// Drops agents whose grant is gone from the ledger.
    pub fn retain(&mut self, granted: &HashSet<&str>) {
        self.states
            .retain(|agent_id, _| granted.contains(agent_id.as_str()));
    }

    pub fn get(&self, agent_id: &str) -> Option<&LivenessState> {
        self.states.get(agent_id)
    }

    pub fn snapshot(&self) -> LivenessSnapshot {
        Arc::new(self.states.clone())
    }
}

pub type LivenessSnapshot = Arc<HashMap<String, LivenessState>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub probed: usize,
    pub skipped: usize,
    pub offline: usize,
    pub online: usize,
    pub revoked: usize,
}

/// Periodic reconciliation of every grant against its agent's health. Owns
/// the tracker; readers see it only through the published snapshot.
pub struct Reconciler {
    engine: Arc<AllocationEngine>,
    notifications: NotificationService,
    tracker: LivenessTracker,
    probe_timeout: Duration,
    published: watch::Sender<LivenessSnapshot>,
}

impl Reconciler {
    pub fn new(
        engine: Arc<AllocationEngine>,
        notifications: NotificationService,
        threshold: u32,
        probe_timeout: Duration,
    ) -> (Self, watch::Receiver<LivenessSnapshot>) {
        let tracker = LivenessTracker::new(threshold);
        let (published, snapshot) = watch::channel(tracker.snapshot());
        (
            Self {
                engine,
                notifications,
                tracker,
                probe_timeout,
                published,
            },
            snapshot,
        )
    }

    pub fn tracker(&self) -> &LivenessTracker {
        &self.tracker
    }

    pub async fn run_cycle(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        let grants = match self.engine.ledger().list().await {
            Ok(grants) => grants,
            Err(err) => {
                warn!(error = %err, "liveness cycle could not list grants");
                self.notifications.sweep().await;
                return report;
            }
        };
        let granted: HashSet<&str> = grants.iter().map(|g| g.agent_id.as_str()).collect();
        self.tracker.retain(&granted);

        let fleet = self.engine.fleet();
        let heartbeat = AgentRequest::heartbeat();
        let mut targets = Vec::with_capacity(grants.len());
        for grant in grants.iter().filter(|g| g.is_active()) {
            match fleet.find(&grant.agent_id) {
                Some(agent) => targets.push((grant, agent)),
                None => {
                    debug!(agent_id = %grant.agent_id, "granted agent missing from fleet; skipping");
                    report.skipped += 1;
                }
            }
        }
        report.probed = targets.len();

        let rpc = self.engine.rpc();
        let timeout = self.probe_timeout;
        let results = join_all(targets.iter().map(|(grant, agent)| {
            let heartbeat = &heartbeat;
            async move {
                let answer = rpc.query(agent, heartbeat, timeout).await;
                record_rpc("heartbeat", &answer);
                // An occupied agent answers status=false; anything else means the workload is gone.
                let alive = matches!(answer, Ok(ref response) if !response.status);
                (*grant, alive)
            }
        }))
        .await;

        let mut outbox = Vec::new();
        for (grant, alive) in results {
            let transition = if alive {
                self.tracker.record_success(&grant.agent_id, grant.lease_uuid)
            } else {
                self.tracker.record_failure(&grant.agent_id, grant.lease_uuid)
            };
            match transition {
                Transition::Unchanged => {}
                Transition::WentOffline => {
                    report.offline += 1;
                    info!(agent_id = %grant.agent_id, lease_uuid = %grant.lease_uuid, "agent went offline");
                    outbox.push(task(NotificationEvent::Offline, grant));
                }
                Transition::CameOnline => {
                    report.online += 1;
                    info!(agent_id = %grant.agent_id, lease_uuid = %grant.lease_uuid, "agent back online");
                    outbox.push(task(NotificationEvent::Online, grant));
                }
                Transition::Revoke => {
                    match self
                        .engine
                        .revoke_if_current(&grant.agent_id, grant.lease_uuid)
                        .await
                    {
                        Ok(Some(_)) => {
                            report.revoked += 1;
                            metrics::REVOCATIONS.inc();
                            warn!(
                                agent_id = %grant.agent_id,
                                lease_uuid = %grant.lease_uuid,
                                "grant revoked after consecutive failed checks"
                            );
                            outbox.push(task(NotificationEvent::Deallocation, grant));
                            self.tracker.forget(&grant.agent_id);
                        }
                        Ok(None) => self.tracker.forget(&grant.agent_id),
                        Err(err) => {
                            warn!(agent_id = %grant.agent_id, error = %err, "revocation failed; retrying next cycle")
                        }
                    }
                }
            }
        }

        self.published.send_replace(self.tracker.snapshot());

        join_all(
            outbox
                .into_iter()
                .map(|task| self.notifications.notify(task)),
        )
        .await;
        let swept = self.notifications.sweep().await;
        if swept.delivered > 0 || swept.remaining > 0 {
            debug!(delivered = swept.delivered, remaining = swept.remaining, "retry queue swept");
        }
        self.engine.locks().prune();
        report
    }

    pub fn spawn(mut self, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.run_cycle().await;
                debug!(
                    probed = report.probed,
                    skipped = report.skipped,
                    offline = report.offline,
                    online = report.online,
                    revoked = report.revoked,
                    "liveness cycle complete"
                );
            }
        })
    }
}

fn task(event: NotificationEvent, grant: &Grant) -> NotificationTask {
    NotificationTask::new(
        event,
        grant.agent_id.clone(),
        grant.lease_uuid,
        serde_json::json!({ "resource": grant.resource_label }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_failure_is_offline_then_quiet() {
        let mut tracker = LivenessTracker::new(3);
        let lease = Uuid::new_v4();
        assert_eq!(tracker.record_failure("a", lease), Transition::WentOffline);
        assert_eq!(tracker.record_failure("a", lease), Transition::Unchanged);
        assert_eq!(tracker.get("a").unwrap().consecutive_failures, 2);
        assert_eq!(tracker.record_failure("a", lease), Transition::Revoke);
    }

    #[test]
    fn success_after_suspect_resets() {
        let mut tracker = LivenessTracker::new(3);
        let lease = Uuid::new_v4();
        assert_eq!(tracker.record_success("a", lease), Transition::Unchanged);
        tracker.record_failure("a", lease);
        tracker.record_failure("a", lease);
        assert_eq!(tracker.record_success("a", lease), Transition::CameOnline);
        let state = tracker.get("a").unwrap();
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.state, Health::Healthy);
    }

    #[test]
    fn success_after_unfinished_revoke_comes_online() {
        let mut tracker = LivenessTracker::new(2);
        let lease = Uuid::new_v4();
        tracker.record_failure("a", lease);
        assert_eq!(tracker.record_failure("a", lease), Transition::Revoke);
        assert_eq!(tracker.get("a").unwrap().state, Health::Deallocated);
        assert_eq!(tracker.record_success("a", lease), Transition::CameOnline);
        assert_eq!(tracker.get("a").unwrap().state, Health::Healthy);
    }

    #[test]
    fn new_lease_starts_clean() {
        let mut tracker = LivenessTracker::new(5);
        tracker.record_failure("a", Uuid::new_v4());
        tracker.record_failure("a", Uuid::new_v4());
        assert_eq!(tracker.get("a").unwrap().consecutive_failures, 1);
    }

    #[test]
    fn retain_drops_released_agents() {
        let mut tracker = LivenessTracker::new(5);
        tracker.record_failure("a", Uuid::new_v4());
        tracker.record_failure("b", Uuid::new_v4());
        tracker.retain(&["b"].into_iter().collect());
        assert!(tracker.get("a").is_none());
        assert!(tracker.get("b").is_some());
    }
}
