//! Shared model and async client for the compute broker.
//!
//! The broker service, its tests, and automation tooling all depend on this
//! crate for the grant data model, the candidate matcher, and the ledger
//! abstraction.

pub mod api;
pub mod ledger;
pub mod matcher;
pub mod model;

use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::api::{
    AllocateAgentRequest, AllocateSpecRequest, DeallocateRequest, Envelope, ListRequest,
};
use crate::model::{ContainerRequirement, ResourceRequirement};

#[derive(Clone)]
pub struct BrokerClient {
    http: Client,
    base_url: String,
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("broker rejected request ({status}): {message} {detail}")]
    Rejected {
        status: reqwest::StatusCode,
        message: String,
        detail: String,
    },
}

impl BrokerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base_url: base_url.into(),
        }
    }

    pub async fn allocate<T>(
        &self,
        requirement: ResourceRequirement,
        container: Option<ContainerRequirement>,
    ) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
    {
        self.post(
            "/service/allocate_spec",
            &AllocateSpecRequest {
                requirement,
                container,
            },
        )
        .await
    }

    pub async fn allocate_agent<T>(
        &self,
        agent_id: impl Into<String>,
        ssh_key: Option<String>,
    ) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
    {
        self.post(
            "/service/allocate_agent",
            &AllocateAgentRequest {
                agent_id: agent_id.into(),
                ssh_key,
                container: None,
            },
        )
        .await
    }

    pub async fn deallocate(
        &self,
        agent_id: impl Into<String>,
        lease_uuid: impl Into<String>,
        notify: bool,
    ) -> Result<(), BrokerError> {
        self.post::<serde_json::Value, _>(
            "/service/deallocate",
            &DeallocateRequest {
                agent_id: agent_id.into(),
                lease_uuid: lease_uuid.into(),
                notify,
            },
        )
        .await
        .map(|_| ())
    }

    pub async fn list_allocations<T>(&self, request: ListRequest) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
    {
        self.post("/list/allocations", &request).await
    }

    async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, BrokerError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let res = self.http.post(url).json(body).send().await?;
        let status = res.status();
        let envelope: Envelope<T> = res.json().await?;
        match envelope {
            Envelope {
                success: true,
                data: Some(data),
                ..
            } => Ok(data),
            Envelope {
                message,
                err_detail,
                ..
            } => Err(BrokerError::Rejected {
                status,
                message,
                detail: err_detail.unwrap_or_default(),
            }),
        }
    }
}
