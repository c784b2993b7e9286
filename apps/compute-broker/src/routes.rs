use std::future::Future;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use broker_sdk::api::{
    AllocateAgentRequest, AllocateSpecRequest, ContainerActionRequest, DeallocateRequest,
    Envelope, ListRequest,
};
use broker_sdk::ledger::LedgerError;
use broker_sdk::model::Grant;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::control::{self, AgentStatusReport};
use crate::engine::{AllocationError, ReleaseError};
use crate::listing::{self, GrantView, Page, ResourceStats, ResourceView};
use crate::metrics;
use crate::notify::{NotificationEvent, NotificationTask};
use crate::rpc::ContainerAction;
use crate::state::AppState;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Unavailable(String),
    Deadline(Duration),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, detail) = match self {
            ApiError::BadRequest(detail) => (StatusCode::BAD_REQUEST, "invalid request", detail),
            ApiError::NotFound(detail) => (StatusCode::NOT_FOUND, "not found", detail),
            ApiError::Unavailable(detail) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage unavailable", detail)
            }
            ApiError::Deadline(after) => (
                StatusCode::GATEWAY_TIMEOUT,
                "request deadline exceeded",
                format!("no result within {}s; the attempt continues", after.as_secs()),
            ),
            ApiError::Internal(detail) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error", detail)
            }
        };
        (status, Json(Envelope::<()>::error(message, detail))).into_response()
    }
}

impl From<AllocationError> for ApiError {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::InvalidRequest(_) => ApiError::BadRequest(err.to_string()),
            AllocationError::NoInventory(_) | AllocationError::CommitFailed(_) => {
                ApiError::NotFound(err.to_string())
            }
            AllocationError::Storage(inner) => inner.into(),
        }
    }
}

impl From<ReleaseError> for ApiError {
    fn from(err: ReleaseError) -> Self {
        match err {
            ReleaseError::NotFound(_) => ApiError::NotFound(err.to_string()),
            ReleaseError::InvalidLease(_) => ApiError::BadRequest(err.to_string()),
            ReleaseError::Storage(inner) => inner.into(),
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        ApiError::Unavailable(err.to_string())
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Runs `work` on its own task so it finishes even when the caller's
/// deadline expires first.
async fn bounded<T, F>(deadline: Option<Duration>, work: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: Future<Output = T> + Send + 'static,
{
    let handle = tokio::spawn(work);
    let joined = match deadline {
        Some(after) => tokio::time::timeout(after, handle)
            .await
            .map_err(|_| ApiError::Deadline(after))?,
        None => handle.await,
    };
    joined.map_err(|e| ApiError::Internal(e.to_string()))
}

#[derive(Serialize)]
struct ReadyResponse {
    status: &'static str,
    uptime_secs: u64,
    fleet_agents: usize,
}

async fn health() -> &'static str {
    "ok"
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        status: "ok",
        uptime_secs: state.uptime_secs(),
        fleet_agents: state.engine().fleet().agents().len(),
    })
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain")],
        metrics::gather(),
    )
}

#[derive(Serialize)]
struct GrantResponse {
    #[serde(flatten)]
    grant: Grant,
    ssh_command: Option<String>,
}

impl From<Grant> for GrantResponse {
    fn from(grant: Grant) -> Self {
        Self {
            ssh_command: grant.ssh_command(),
            grant,
        }
    }
}

async fn allocate_spec(
    State(state): State<AppState>,
    Json(body): Json<AllocateSpecRequest>,
) -> ApiResult<GrantResponse> {
    let engine = state.engine();
    let grant = bounded(state.request_deadline(), async move {
        engine.allocate(&body.requirement, body.container).await
    })
    .await??;
    Ok(Json(Envelope::ok("resource allocated", grant.into())))
}

async fn allocate_agent(
    State(state): State<AppState>,
    Json(body): Json<AllocateAgentRequest>,
) -> ApiResult<GrantResponse> {
    if body.agent_id.trim().is_empty() {
        return Err(ApiError::BadRequest("agent_id is required".into()));
    }
    let engine = state.engine();
    let grant = bounded(state.request_deadline(), async move {
        engine
            .allocate_by_agent(&body.agent_id, body.ssh_key, body.container)
            .await
    })
    .await??;
    Ok(Json(Envelope::ok("resource allocated", grant.into())))
}

#[derive(Serialize)]
struct ReleasedResponse {
    agent_id: String,
    lease_uuid: Uuid,
}

async fn deallocate(
    State(state): State<AppState>,
    Json(body): Json<DeallocateRequest>,
) -> ApiResult<ReleasedResponse> {
    let engine = state.engine();
    let notifications = state.notifications().clone();
    // The notification is raised by the release task itself so a caller
    // that gives up at the deadline does not lose it.
    let released = bounded(state.request_deadline(), async move {
        let released = engine.release(&body.agent_id, &body.lease_uuid).await?;
        if body.notify {
            let task = NotificationTask::new(
                NotificationEvent::Deallocation,
                released.agent_id.clone(),
                released.lease_uuid,
                serde_json::json!({ "reason": "released by requester" }),
            );
            tokio::spawn(async move {
                notifications.notify(task).await;
            });
        }
        Ok::<_, ReleaseError>(released)
    })
    .await??;
    info!(agent_id = %released.agent_id, lease_uuid = %released.lease_uuid, "deallocated on request");
    Ok(Json(Envelope::ok(
        "resource deallocated",
        ReleasedResponse {
            agent_id: released.agent_id,
            lease_uuid: released.lease_uuid,
        },
    )))
}

#[derive(Deserialize)]
struct CheckStatusRequest {
    agent_ids: Vec<String>,
}

async fn check_agent_status(
    State(state): State<AppState>,
    Json(body): Json<CheckStatusRequest>,
) -> ApiResult<Vec<AgentStatusReport>> {
    let reports =
        control::check_status(&state.engine(), &body.agent_ids, state.status_timeout()).await;
    Ok(Json(Envelope::ok("agent status checked", reports)))
}

async fn container(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(body): Json<ContainerActionRequest>,
) -> ApiResult<GrantResponse> {
    let action = match action.as_str() {
        "restart" => ContainerAction::Restart,
        "pause" => ContainerAction::Pause,
        "unpause" => ContainerAction::Unpause,
        "exchange_key" => ContainerAction::ExchangeKey,
        other => return Err(ApiError::BadRequest(format!("unknown container action {other}"))),
    };
    if action == ContainerAction::ExchangeKey
        && body.ssh_key.as_deref().is_none_or(|k| k.trim().is_empty())
    {
        return Err(ApiError::BadRequest("exchange_key needs ssh_key".into()));
    }
    let grant = control::container_action(
        &state.engine(),
        &body.agent_id,
        &body.lease_uuid,
        action,
        body.ssh_key,
    )
    .await?;
    Ok(Json(Envelope::ok(
        format!("container {} requested", action.as_str()),
        grant.into(),
    )))
}

async fn list_allocations(
    State(state): State<AppState>,
    Json(body): Json<ListRequest>,
) -> ApiResult<Page<GrantView>> {
    let engine = state.engine();
    let views = listing::list_active(
        engine.ledger().as_ref(),
        engine.fleet(),
        &state.liveness(),
        body.query.as_ref(),
    )
    .await?;
    if views.is_empty() {
        return Err(ApiError::NotFound("no active allocations".into()));
    }
    Ok(Json(Envelope::ok(
        "allocations listed",
        listing::paginate(views, body.page_number, body.page_size),
    )))
}

#[derive(Serialize)]
#[serde(untagged)]
enum ResourceListing {
    Page(Page<ResourceView>),
    Stats { stats: ResourceStats },
}

async fn list_resources(
    State(state): State<AppState>,
    Json(body): Json<ListRequest>,
) -> ApiResult<ResourceListing> {
    let engine = state.engine();
    let views =
        listing::list_resources(engine.ledger().as_ref(), engine.fleet(), body.query.as_ref())
            .await?;
    if body.stats {
        let stats = listing::resource_stats(&views);
        return Ok(Json(Envelope::ok(
            "resources counted",
            ResourceListing::Stats { stats },
        )));
    }
    if views.is_empty() {
        return Err(ApiError::NotFound("no resource available".into()));
    }
    Ok(Json(Envelope::ok(
        "resources listed",
        ResourceListing::Page(listing::paginate(views, body.page_number, body.page_size)),
    )))
}

#[derive(Deserialize)]
struct TestNotifyRequest {
    #[serde(default = "default_test_agent")]
    agent_id: String,
    #[serde(default)]
    lease_uuid: Option<Uuid>,
    #[serde(default = "default_test_event")]
    event: NotificationEvent,
}

fn default_test_agent() -> String {
    "test-agent".into()
}

fn default_test_event() -> NotificationEvent {
    NotificationEvent::Deallocation
}

#[derive(Serialize)]
struct TestNotifyResponse {
    delivered: bool,
}

async fn test_notify(
    State(state): State<AppState>,
    Json(body): Json<TestNotifyRequest>,
) -> ApiResult<TestNotifyResponse> {
    let task = NotificationTask::new(
        body.event,
        body.agent_id,
        body.lease_uuid.unwrap_or_else(Uuid::new_v4),
        serde_json::json!({ "test": true }),
    );
    let delivered = state.notifications().notify(task).await;
    if !delivered {
        warn!("test notification queued for retry");
    }
    Ok(Json(Envelope::ok(
        "test notification sent",
        TestNotifyResponse { delivered },
    )))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_handler))
        .route("/readyz", get(ready))
        .route("/service/allocate_spec", post(allocate_spec))
        .route("/service/allocate_agent", post(allocate_agent))
        .route("/service/deallocate", post(deallocate))
        .route("/service/check_agent_status", post(check_agent_status))
        .route("/service/container/:action", post(container))
        .route("/list/allocations", post(list_allocations))
        .route("/list/resources", post(list_resources))
        .route("/test/notify", post(test_notify))
        .with_state(state)
}
