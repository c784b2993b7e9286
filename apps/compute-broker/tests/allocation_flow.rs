mod support;

use std::time::Duration;

use broker_sdk::ledger::Ledger;
use broker_sdk::model::{ContainerRequirement, ResourceRequirement};
use compute_broker::engine::{AGENT_LEASE_DAYS, AllocationError, EngineConfig, ReleaseError};
use compute_broker::retry::RetryPolicy;
use support::{AgentScript, CallKind, Harness, Reply, TestResult, agent, gpu_requirement};
use test_timeout::tokio_paused_test;

#[tokio_paused_test]
async fn slow_probe_loses_to_accepting_agent() -> TestResult {
    let h = Harness::new(vec![
        agent("agent-a", Some(("NVIDIA A100", 80.0))),
        agent("agent-b", Some(("NVIDIA A100", 80.0))),
    ])
    .await;
    h.rpc.script(
        "agent-a",
        AgentScript {
            probe: Reply::Hang,
            ..AgentScript::default()
        },
    );

    let started = tokio::time::Instant::now();
    let grant = h.engine.allocate(&gpu_requirement("a100", 40), None).await?;

    assert_eq!(grant.agent_id, "agent-b");
    let conn = grant.connection.as_ref().expect("connection after commit");
    assert_eq!(conn.password, "pw-agent-b");
    assert_eq!(conn.ip, "agent-b.fleet.test");
    assert_eq!(grant.resource_label, "nvidia a100");
    assert_eq!(h.rpc.calls("agent-a", CallKind::Commit), 0);
    // Probes run concurrently, so the hang costs one probe timeout in total.
    assert_eq!(started.elapsed(), Duration::from_secs(100));
    assert!(h.ledger.get("agent-a").await?.is_none());
    assert_eq!(h.ledger.get("agent-b").await?, Some(grant));
    Ok(())
}

#[tokio::test]
async fn zero_matches_is_no_inventory_without_rpc() -> TestResult {
    let h = Harness::new(vec![agent("cpu-only", None)]).await;
    let err = h
        .engine
        .allocate(&gpu_requirement("h100", 80), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::NoInventory(_)));
    assert_eq!(h.rpc.calls("cpu-only", CallKind::Probe), 0);
    assert!(h.ledger.list().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn all_probes_declined_is_no_inventory() -> TestResult {
    let h = Harness::new(vec![agent("a", None), agent("b", None)]).await;
    for id in ["a", "b"] {
        h.rpc.script(
            id,
            AgentScript {
                probe: Reply::No,
                ..AgentScript::default()
            },
        );
    }
    let err = h
        .engine
        .allocate(&ResourceRequirement::minimal(7), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::NoInventory(_)));
    Ok(())
}

#[tokio::test]
async fn failed_commit_advances_to_next_candidate() -> TestResult {
    let h = Harness::new(vec![agent("first", None), agent("second", None)]).await;
    h.rpc.script(
        "first",
        AgentScript {
            commit: Reply::Fail,
            ..AgentScript::default()
        },
    );
    let grant = h
        .engine
        .allocate(&ResourceRequirement::minimal(7), None)
        .await?;
    assert_eq!(grant.agent_id, "second");
    assert_eq!(h.rpc.calls("first", CallKind::Commit), 1);
    assert!(h.ledger.get("first").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn every_commit_failing_is_commit_failed() -> TestResult {
    let h = Harness::new(vec![agent("only", None)]).await;
    h.rpc.script(
        "only",
        AgentScript {
            commit: Reply::No,
            ..AgentScript::default()
        },
    );
    let err = h
        .engine
        .allocate(&ResourceRequirement::minimal(7), None)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::CommitFailed(_)));
    assert_eq!(h.rpc.calls("only", CallKind::Commit), 1);
    Ok(())
}

#[tokio::test]
async fn allocated_agent_is_not_offered_twice() -> TestResult {
    let h = Harness::new(vec![agent("solo", None)]).await;
    let req = ResourceRequirement::minimal(7);
    h.engine.allocate(&req, None).await?;
    let err = h.engine.allocate(&req, None).await.unwrap_err();
    assert!(matches!(err, AllocationError::NoInventory(_)));
    assert_eq!(h.ledger.list().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn concurrent_requests_grant_an_agent_once() -> TestResult {
    let h = Harness::new(vec![agent("contested", None)]).await;
    let req = ResourceRequirement::minimal(7);
    let (first, second) = tokio::join!(h.engine.allocate(&req, None), h.engine.allocate(&req, None));
    let granted = [first.is_ok(), second.is_ok()];
    assert_eq!(granted.iter().filter(|ok| **ok).count(), 1);
    assert_eq!(h.ledger.list().await?.len(), 1);
    Ok(())
}

#[tokio_paused_test]
async fn allocate_by_agent_gives_up_after_policy_attempts() -> TestResult {
    let h = Harness::new(vec![agent("stubborn", None)]).await;
    h.rpc.script(
        "stubborn",
        AgentScript {
            probe: Reply::No,
            ..AgentScript::default()
        },
    );
    let started = tokio::time::Instant::now();
    let err = h
        .engine
        .allocate_by_agent("stubborn", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::CommitFailed(_)));
    assert_eq!(h.rpc.calls("stubborn", CallKind::Probe), 8);
    assert_eq!(started.elapsed(), Duration::from_secs(70));
    assert!(h.ledger.get("stubborn").await?.is_none());
    Ok(())
}

#[tokio_paused_test]
async fn allocate_by_agent_gives_up_on_silent_agent() -> TestResult {
    let h = Harness::new(vec![agent("silent", None)]).await;
    h.rpc.script(
        "silent",
        AgentScript {
            probe: Reply::Hang,
            ..AgentScript::default()
        },
    );
    let started = tokio::time::Instant::now();
    let err = h
        .engine
        .allocate_by_agent("silent", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::CommitFailed(_)));
    assert_eq!(h.rpc.calls("silent", CallKind::Probe), 8);
    assert_eq!(h.rpc.calls("silent", CallKind::Commit), 0);
    // Eight 30s probe timeouts and seven 10s pauses.
    assert_eq!(started.elapsed(), Duration::from_secs(8 * 30 + 7 * 10));
    Ok(())
}

#[tokio::test]
async fn allocate_by_agent_sends_key_with_commit() -> TestResult {
    let h = Harness::new(vec![agent("keyed", None)]).await;
    let grant = h
        .engine
        .allocate_by_agent("keyed", Some("ssh-ed25519 KEY".into()), None)
        .await?;
    assert_eq!(grant.ssh_key.as_deref(), Some("ssh-ed25519 KEY"));

    let commit = h
        .rpc
        .last_request("keyed", CallKind::Commit)
        .expect("commit sent");
    assert_eq!(commit.timeline, AGENT_LEASE_DAYS);
    let container = commit.docker_requirement.expect("container settings");
    assert_eq!(container.ssh_key, "ssh-ed25519 KEY");
    assert_eq!(container.base_image, ContainerRequirement::default().base_image);
    Ok(())
}

#[tokio::test]
async fn requester_key_overrides_container_key() -> TestResult {
    let h = Harness::new(vec![agent("custom", None)]).await;
    let container = ContainerRequirement {
        base_image: "pytorch/pytorch".into(),
        ssh_key: "ssh-rsa OLD".into(),
        ..ContainerRequirement::default()
    };
    h.engine
        .allocate_by_agent("custom", Some("ssh-ed25519 NEW".into()), Some(container))
        .await?;
    let sent = h
        .rpc
        .last_request("custom", CallKind::Commit)
        .and_then(|request| request.docker_requirement)
        .expect("container settings");
    assert_eq!(sent.ssh_key, "ssh-ed25519 NEW");
    assert_eq!(sent.base_image, "pytorch/pytorch");
    Ok(())
}

#[tokio_paused_test]
async fn allocate_by_agent_succeeds_on_later_attempt() -> TestResult {
    let h = Harness::with_config(
        vec![agent("warming", None)],
        EngineConfig {
            agent_policy: RetryPolicy::new(4, Duration::from_secs(5)),
            ..EngineConfig::default()
        },
    )
    .await;
    h.rpc.script(
        "warming",
        AgentScript {
            commit: Reply::Hang,
            ..AgentScript::default()
        },
    );
    let rpc = h.rpc.clone();
    let engine = h.engine.clone();
    let attempt = tokio::spawn(async move {
        engine
            .allocate_by_agent("warming", Some("ssh-ed25519 AAAA".into()), None)
            .await
    });
    // First commit hangs for its 60s timeout; fix the agent before the retry.
    tokio::time::sleep(Duration::from_secs(61)).await;
    rpc.script("warming", AgentScript::default());
    let grant = attempt.await??;
    assert_eq!(grant.ssh_key.as_deref(), Some("ssh-ed25519 AAAA"));
    assert_eq!(h.rpc.calls("warming", CallKind::Commit), 2);
    Ok(())
}

#[tokio::test]
async fn allocate_by_agent_rejects_unknown_and_taken() -> TestResult {
    let h = Harness::new(vec![agent("known", None)]).await;
    let err = h
        .engine
        .allocate_by_agent("ghost", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::NoInventory(_)));
    h.engine.allocate_by_agent("known", None, None).await?;
    let err = h
        .engine
        .allocate_by_agent("known", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, AllocationError::NoInventory(_)));
    Ok(())
}

#[tokio::test]
async fn release_checks_lease_and_is_idempotent() -> TestResult {
    let h = Harness::new(vec![agent("leased", None)]).await;
    let grant = h
        .engine
        .allocate(&ResourceRequirement::minimal(7), None)
        .await?;

    let wrong = uuid::Uuid::new_v4().to_string();
    let err = h.engine.release("leased", &wrong).await.unwrap_err();
    assert!(matches!(err, ReleaseError::InvalidLease(_)));
    assert_eq!(h.ledger.get("leased").await?, Some(grant.clone()));
    assert_eq!(h.rpc.calls("leased", CallKind::Deregister), 0);

    let lease = grant.lease_uuid.to_string();
    let released = h.engine.release("leased", &lease).await?;
    assert!(!released.is_active());
    assert_eq!(h.rpc.calls("leased", CallKind::Deregister), 1);
    assert!(h.ledger.get("leased").await?.is_none());
    assert_eq!(h.ledger.released().await.len(), 1);

    let err = h.engine.release("leased", &lease).await.unwrap_err();
    assert!(matches!(err, ReleaseError::NotFound(_)));
    Ok(())
}

#[tokio_paused_test]
async fn release_retries_unacknowledged_deregistration() -> TestResult {
    let h = Harness::new(vec![agent("sticky", None)]).await;
    let grant = h
        .engine
        .allocate(&ResourceRequirement::minimal(7), None)
        .await?;
    h.rpc.script(
        "sticky",
        AgentScript {
            deregister: Reply::No,
            ..AgentScript::default()
        },
    );
    let started = tokio::time::Instant::now();
    h.engine
        .release("sticky", &grant.lease_uuid.to_string())
        .await?;
    assert_eq!(h.rpc.calls("sticky", CallKind::Deregister), 3);
    assert_eq!(started.elapsed(), Duration::from_secs(2));
    assert!(h.ledger.get("sticky").await?.is_none());
    Ok(())
}

#[tokio::test]
async fn release_survives_agent_leaving_fleet() -> TestResult {
    let h = Harness::new(vec![agent("departing", None)]).await;
    let grant = h
        .engine
        .allocate(&ResourceRequirement::minimal(7), None)
        .await?;
    h.directory.replace(Vec::new());
    h.engine.fleet().refresh().await?;
    h.engine
        .release("departing", &grant.lease_uuid.to_string())
        .await?;
    assert_eq!(h.rpc.calls("departing", CallKind::Deregister), 0);
    assert!(h.ledger.list().await?.is_empty());
    Ok(())
}
