use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const BYTES_PER_GIB: u64 = 1024 * 1024 * 1024;

/// Resources a requester asks for. Immutable once a request is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirement {
    pub cpu_count: u32,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub gpu_capacity_gb: u32,
    pub ram_gb: u32,
    pub hard_disk_gb: u32,
    pub lease_days: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequirementError {
    #[error("{field} must be at least {min}")]
    BelowMinimum { field: &'static str, min: u32 },
}

impl Default for ResourceRequirement {
    fn default() -> Self {
        Self {
            cpu_count: 1,
            gpu_type: None,
            gpu_capacity_gb: 0,
            ram_gb: 1,
            hard_disk_gb: 1,
            lease_days: 90,
        }
    }
}

impl ResourceRequirement {
    /// Smallest requirement any agent can satisfy; used when a caller names the agent directly.
    pub fn minimal(lease_days: u32) -> Self {
        Self {
            lease_days,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), RequirementError> {
        let checks = [
            ("cpu_count", self.cpu_count, 1),
            ("ram_gb", self.ram_gb, 1),
            ("hard_disk_gb", self.hard_disk_gb, 1),
            ("lease_days", self.lease_days, 1),
        ];
        for (field, value, min) in checks {
            if value < min {
                return Err(RequirementError::BelowMinimum { field, min });
            }
        }
        Ok(())
    }

    /// GPU type and capacity, present only when both are meaningful.
    pub fn requested_gpu(&self) -> Option<(&str, u32)> {
        match self.gpu_type.as_deref().map(str::trim) {
            Some(kind) if !kind.is_empty() && self.gpu_capacity_gb > 0 => {
                Some((kind, self.gpu_capacity_gb))
            }
            _ => None,
        }
    }

    /// Wire form sent to agents. Sizes are in bytes, GPU capacity in MB.
    pub fn device_requirement(&self) -> serde_json::Value {
        let gpu = match self.requested_gpu() {
            Some((kind, capacity)) => serde_json::json!({
                "count": 1,
                "capacity": u64::from(capacity) * 1000,
                "type": kind,
            }),
            None => serde_json::json!({}),
        };
        serde_json::json!({
            "cpu": { "count": self.cpu_count },
            "gpu": gpu,
            "hard_disk": { "capacity": u64::from(self.hard_disk_gb) * BYTES_PER_GIB },
            "ram": { "capacity": u64::from(self.ram_gb) * BYTES_PER_GIB },
        })
    }
}

/// Capacity an agent advertises in the fleet directory.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdvertisedCapacity {
    pub cpu_count: u32,
    #[serde(default)]
    pub gpu_name: Option<String>,
    #[serde(default)]
    pub gpu_capacity_gb: f64,
    #[serde(default)]
    pub gpu_count: u32,
    pub ram_gb: f64,
    pub hard_disk_gb: f64,
}

/// Fleet directory entry. Owned by the directory, never mutated here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCandidate {
    pub agent_id: String,
    pub address: String,
    #[serde(default)]
    pub capability: AdvertisedCapacity,
}

impl AgentCandidate {
    /// Host part of the advertised address, without scheme, port, or path.
    pub fn host(&self) -> String {
        let without_scheme = self
            .address
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.address);
        let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
        let host = if authority.starts_with('[') {
            authority.split(']').next().unwrap_or(authority)
        } else {
            authority
                .rsplit_once(':')
                .map(|(host, _)| host)
                .unwrap_or(authority)
        };
        host.trim_start_matches('[').to_string()
    }

    pub fn resource_label(&self) -> String {
        self.capability
            .gpu_name
            .as_deref()
            .map(|name| name.trim().to_lowercase())
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "No details available".into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub ip: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrantStatus {
    Active,
    Released,
}

/// Persisted record that an agent is leased to a requester.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grant {
    pub agent_id: String,
    pub lease_uuid: Uuid,
    pub public_key: String,
    pub connection: Option<Connection>,
    pub resource_label: String,
    #[serde(default)]
    pub ssh_key: Option<String>,
    pub created_at: DateTime<Utc>,
    pub status: GrantStatus,
}

impl Grant {
    pub fn is_active(&self) -> bool {
        self.status == GrantStatus::Active
    }

    pub fn released(mut self) -> Self {
        self.status = GrantStatus::Released;
        self
    }

    pub fn ssh_command(&self) -> Option<String> {
        self.connection
            .as_ref()
            .map(|c| format!("ssh {}@{} -p {}", c.username, c.ip, c.port))
    }
}

/// Container settings forwarded to the agent on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerRequirement {
    pub base_image: String,
    pub ssh_key: String,
    pub volume_path: String,
    pub dockerfile: String,
}

impl Default for ContainerRequirement {
    fn default() -> Self {
        Self {
            base_image: "ubuntu".into(),
            ssh_key: String::new(),
            volume_path: "/tmp".into(),
            dockerfile: String::new(),
        }
    }
}
