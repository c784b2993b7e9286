use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use compute_broker::config::AppConfig;
use compute_broker::engine::{AllocationEngine, EngineConfig};
use compute_broker::fleet::{FleetSnapshot, build_directory};
use compute_broker::ledger::build_ledger;
use compute_broker::liveness::Reconciler;
use compute_broker::locks::AgentLocks;
use compute_broker::metrics;
use compute_broker::notify::{HttpNotifier, NotificationService};
use compute_broker::notify_queue::build_retry_queue;
use compute_broker::retry::RetryPolicy;
use compute_broker::routes;
use compute_broker::rpc::HttpAgentRpc;
use compute_broker::state::AppState;
use compute_broker::telemetry::init_tracing;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AppConfig::from_env().context("invalid configuration")?;
    init_tracing(&cfg.log_filter);

    let fleet = FleetSnapshot::new(build_directory(&cfg.fleet_source));
    if let Err(err) = fleet.refresh().await {
        warn!(error = %err, "initial fleet fetch failed; starting with an empty fleet");
    }
    let _fleet_refresh = fleet.spawn_refresh(cfg.fleet_refresh);

    let ledger = build_ledger(&cfg).await;
    let engine = Arc::new(AllocationEngine::new(
        ledger,
        Arc::new(HttpAgentRpc::new()),
        fleet,
        AgentLocks::new(),
        EngineConfig {
            probe_timeout: cfg.probe_timeout,
            commit_timeout: cfg.commit_timeout,
            agent_policy: RetryPolicy::new(cfg.agent_attempts, cfg.agent_retry),
            ..EngineConfig::default()
        },
    ));

    let notifications = NotificationService::new(
        Arc::new(HttpNotifier::new(
            cfg.deallocation_notify_url.clone(),
            cfg.status_notify_url.clone(),
        )),
        build_retry_queue(cfg.redis_url.as_deref(), cfg.notify_queue_cap),
        RetryPolicy::new(cfg.notify_retries, cfg.notify_retry),
    );

    let (reconciler, liveness) = Reconciler::new(
        engine.clone(),
        notifications.clone(),
        cfg.check_threshold,
        cfg.liveness_timeout,
    );
    let _reconcile = reconciler.spawn(cfg.check_period);

    let app_state = AppState::new(
        engine,
        notifications,
        liveness,
        cfg.request_deadline,
        cfg.liveness_timeout,
    );
    let app: Router = routes::router(app_state);

    info!(
        addr = %cfg.bind_addr,
        ledger_backend = ?cfg.ledger_backend,
        fleet_source = ?cfg.fleet_source,
        redis = %cfg.redis_url.as_deref().unwrap_or("unset"),
        database_configured = cfg.database_url.is_some(),
        check_period_secs = cfg.check_period.as_secs(),
        check_threshold = cfg.check_threshold,
        notify_queue_cap = cfg.notify_queue_cap,
        "starting compute-broker"
    );
    metrics::BOOT_COUNTER.inc();
    let listener = tokio::net::TcpListener::bind(cfg.bind_addr)
        .await
        .with_context(|| format!("bind {}", cfg.bind_addr))?;
    axum::serve(listener, app.into_make_service())
        .await
        .context("server")?;
    Ok(())
}
