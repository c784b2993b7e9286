use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::model::{AdvertisedCapacity, AgentCandidate, ResourceRequirement};

/// Select agents whose advertised capacity satisfies `requirement` and that hold no grant.
/// Fleet enumeration order is preserved. An empty result means "no inventory".
///
/// The allocated set is a snapshot; callers must re-check at commit time.
pub fn match_candidates(
    requirement: &ResourceRequirement,
    fleet: &[AgentCandidate],
    allocated: &HashSet<String>,
) -> Vec<String> {
    fleet
        .iter()
        .filter(|agent| !allocated.contains(&agent.agent_id))
        .filter(|agent| satisfies(requirement, &agent.capability))
        .map(|agent| agent.agent_id.clone())
        .collect()
}

fn satisfies(requirement: &ResourceRequirement, capacity: &AdvertisedCapacity) -> bool {
    if capacity.cpu_count < requirement.cpu_count
        || capacity.ram_gb < f64::from(requirement.ram_gb)
        || capacity.hard_disk_gb < f64::from(requirement.hard_disk_gb)
    {
        return false;
    }
    match requirement.requested_gpu() {
        None => true,
        Some((kind, size_gb)) => {
            let name_matches = capacity
                .gpu_name
                .as_deref()
                .map(|name| name.to_lowercase().contains(&kind.to_lowercase()))
                .unwrap_or(false);
            name_matches && capacity.gpu_capacity_gb >= f64::from(size_gb)
        }
    }
}

/// Optional range filters used by resource listings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceQuery {
    pub gpu_name: Option<String>,
    pub cpu_count_min: Option<u32>,
    pub cpu_count_max: Option<u32>,
    pub gpu_capacity_min: Option<f64>,
    pub gpu_capacity_max: Option<f64>,
    pub hard_disk_total_min: Option<f64>,
    pub hard_disk_total_max: Option<f64>,
    pub ram_total_min: Option<f64>,
    pub ram_total_max: Option<f64>,
}

impl ResourceQuery {
    pub fn matches(&self, capacity: &AdvertisedCapacity) -> bool {
        if let Some(wanted) = &self.gpu_name {
            let name = capacity.gpu_name.as_deref().unwrap_or_default().to_lowercase();
            if !name.contains(&wanted.to_lowercase()) {
                return false;
            }
        }
        within(
            f64::from(capacity.cpu_count),
            self.cpu_count_min.map(f64::from),
            self.cpu_count_max.map(f64::from),
        ) && within(
            capacity.gpu_capacity_gb,
            self.gpu_capacity_min,
            self.gpu_capacity_max,
        ) && within(capacity.ram_gb, self.ram_total_min, self.ram_total_max)
            && within(
                capacity.hard_disk_gb,
                self.hard_disk_total_min,
                self.hard_disk_total_max,
            )
    }
}

fn within(value: f64, min: Option<f64>, max: Option<f64>) -> bool {
    min.map_or(true, |m| value >= m) && max.map_or(true, |m| value <= m)
}
