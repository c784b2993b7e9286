use std::collections::HashSet;

use broker_sdk::ledger::{Ledger, LedgerError};
use broker_sdk::matcher::ResourceQuery;
use broker_sdk::model::AgentCandidate;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::fleet::FleetSnapshot;
use crate::liveness::{Health, LivenessSnapshot};

pub const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub page_items: Vec<T>,
    pub page_number: usize,
    pub page_size: usize,
    pub next_page_number: Option<usize>,
}

/// 1-based paging. Without a page number the whole list is one page.
pub fn paginate<T>(items: Vec<T>, page_number: Option<usize>, page_size: Option<usize>) -> Page<T> {
    let Some(page_number) = page_number.filter(|n| *n > 0) else {
        let page_size = items.len();
        return Page {
            page_items: items,
            page_number: 1,
            page_size,
            next_page_number: None,
        };
    };
    let page_size = page_size.filter(|s| *s > 0).unwrap_or(DEFAULT_PAGE_SIZE);
    let start = (page_number - 1).saturating_mul(page_size);
    let end = start.saturating_add(page_size);
    let has_next = end < items.len();
    let page_items = items.into_iter().skip(start).take(page_size).collect();
    Page {
        page_items,
        page_number,
        page_size,
        next_page_number: has_next.then_some(page_number + 1),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantHealth {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GrantView {
    pub agent_id: String,
    pub lease_uuid: Uuid,
    pub resource: String,
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub ssh_command: Option<String>,
    pub ssh_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: GrantHealth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Available,
    Reserved,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceView {
    pub agent_id: String,
    pub host: String,
    pub cpu_count: u32,
    pub gpu_name: Option<String>,
    pub gpu_capacity_gb: f64,
    pub gpu_count: u32,
    pub ram_gb: f64,
    pub hard_disk_gb: f64,
    pub status: ReservationStatus,
}

impl ResourceView {
    fn new(agent: &AgentCandidate, status: ReservationStatus) -> Self {
        let cap = &agent.capability;
        Self {
            agent_id: agent.agent_id.clone(),
            host: agent.host(),
            cpu_count: cap.cpu_count,
            gpu_name: cap.gpu_name.clone(),
            gpu_capacity_gb: cap.gpu_capacity_gb,
            gpu_count: cap.gpu_count,
            ram_gb: cap.ram_gb,
            hard_disk_gb: cap.hard_disk_gb,
            status,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceStats {
    pub available: usize,
    pub reserved: usize,
    pub total: usize,
}

/// Active grants with their liveness, optionally narrowed to agents whose
/// advertised capacity matches `query`.
pub async fn list_active(
    ledger: &dyn Ledger,
    fleet: &FleetSnapshot,
    liveness: &LivenessSnapshot,
    query: Option<&ResourceQuery>,
) -> Result<Vec<GrantView>, LedgerError> {
    let grants = ledger.list().await?;
    Ok(grants
        .into_iter()
        .filter(|grant| grant.is_active())
        .filter(|grant| match query {
            None => true,
            Some(query) => fleet
                .find(&grant.agent_id)
                .is_some_and(|agent| query.matches(&agent.capability)),
        })
        .map(|grant| {
            let status = match liveness.get(&grant.agent_id).map(|s| s.state) {
                Some(Health::Suspect | Health::Deallocated) => GrantHealth::Offline,
                Some(Health::Healthy) | None => GrantHealth::Online,
            };
            let ssh_command = grant.ssh_command();
            let conn = grant.connection;
            GrantView {
                agent_id: grant.agent_id,
                lease_uuid: grant.lease_uuid,
                resource: grant.resource_label,
                ip: conn.as_ref().map(|c| c.ip.clone()),
                port: conn.as_ref().map(|c| c.port),
                username: conn.as_ref().map(|c| c.username.clone()),
                password: conn.map(|c| c.password),
                ssh_command,
                ssh_key: grant.ssh_key,
                created_at: grant.created_at,
                status,
            }
        })
        .collect())
}

/// Fleet agents matching `query`, each marked available or reserved.
pub async fn list_resources(
    ledger: &dyn Ledger,
    fleet: &FleetSnapshot,
    query: Option<&ResourceQuery>,
) -> Result<Vec<ResourceView>, LedgerError> {
    let reserved: HashSet<String> = ledger
        .list()
        .await?
        .into_iter()
        .filter(|grant| grant.is_active())
        .map(|grant| grant.agent_id)
        .collect();
    Ok(fleet
        .agents()
        .iter()
        .filter(|agent| query.is_none_or(|q| q.matches(&agent.capability)))
        .map(|agent| {
            let status = if reserved.contains(&agent.agent_id) {
                ReservationStatus::Reserved
            } else {
                ReservationStatus::Available
            };
            ResourceView::new(agent, status)
        })
        .collect())
}

pub fn resource_stats(resources: &[ResourceView]) -> ResourceStats {
    resources
        .iter()
        .fold(ResourceStats::default(), |mut stats, view| {
            match view.status {
                ReservationStatus::Available => stats.available += 1,
                ReservationStatus::Reserved => stats.reserved += 1,
            }
            stats.total += 1;
            stats
        })
}
