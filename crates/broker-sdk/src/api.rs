//! Request and response bodies shared by the broker's HTTP surface and its clients.

use serde::{Deserialize, Serialize};

use crate::matcher::ResourceQuery;
use crate::model::{ContainerRequirement, ResourceRequirement};

/// Uniform response envelope. `data` is set on success, `err_detail` on failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_detail: Option<String>,
}

impl<T> Envelope<T> {
    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            err_detail: None,
        }
    }

    pub fn error(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            err_detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateSpecRequest {
    pub requirement: ResourceRequirement,
    #[serde(default)]
    pub container: Option<ContainerRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocateAgentRequest {
    pub agent_id: String,
    #[serde(default)]
    pub ssh_key: Option<String>,
    #[serde(default)]
    pub container: Option<ContainerRequirement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeallocateRequest {
    pub agent_id: String,
    pub lease_uuid: String,
    #[serde(default)]
    pub notify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerActionRequest {
    pub agent_id: String,
    pub lease_uuid: String,
    #[serde(default)]
    pub ssh_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListRequest {
    #[serde(default)]
    pub query: Option<ResourceQuery>,
    #[serde(default)]
    pub page_number: Option<usize>,
    #[serde(default)]
    pub page_size: Option<usize>,
    #[serde(default)]
    pub stats: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Grant;

    #[test]
    fn error_envelope_decodes_without_data() {
        // Grant has no Default impl; decoding must not need one.
        let raw = r#"{"success":false,"message":"not found","err_detail":"agent x"}"#;
        let envelope: Envelope<Grant> = serde_json::from_str(raw).unwrap();
        assert!(!envelope.success);
        assert!(envelope.data.is_none());
        assert_eq!(envelope.err_detail.as_deref(), Some("agent x"));
    }
}
