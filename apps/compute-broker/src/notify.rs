use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::notify_queue::RetryQueueHandle;
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationEvent {
    Online,
    Offline,
    Deallocation,
}

impl NotificationEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationEvent::Online => "ONLINE",
            NotificationEvent::Offline => "OFFLINE",
            NotificationEvent::Deallocation => "DEALLOCATION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationTask {
    pub id: Uuid,
    pub event_time: DateTime<Utc>,
    pub agent_id: String,
    pub lease_uuid: Uuid,
    pub event: NotificationEvent,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl NotificationTask {
    pub fn new(
        event: NotificationEvent,
        agent_id: impl Into<String>,
        lease_uuid: Uuid,
        details: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_time: Utc::now(),
            agent_id: agent_id.into(),
            lease_uuid,
            event,
            details,
        }
    }

    /// Body posted to the subscriber endpoint.
    pub fn body(&self) -> serde_json::Value {
        let at = self.event_time.to_rfc3339_opts(SecondsFormat::Micros, true);
        let mut body = serde_json::json!({
            "time": Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            "agent_id": self.agent_id,
            "status": self.event.as_str(),
            "uuid": self.lease_uuid.to_string(),
            "details": self.details,
        });
        let stamp = match self.event {
            NotificationEvent::Deallocation => "deallocated_at",
            NotificationEvent::Online | NotificationEvent::Offline => "status_change_at",
        };
        body[stamp] = serde_json::Value::String(at);
        body
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("subscriber unreachable: {0}")]
    Transport(String),
    #[error("subscriber answered {0}")]
    Rejected(u16),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, task: &NotificationTask) -> Result<(), NotifyError>;
}

/// Posts JSON to the deallocation or status endpoint. Only 2xx counts as
/// delivered. An event whose endpoint is not configured is discarded.
pub struct HttpNotifier {
    http: reqwest::Client,
    deallocation_url: Option<String>,
    status_url: Option<String>,
}

impl HttpNotifier {
    pub fn new(deallocation_url: Option<String>, status_url: Option<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            deallocation_url,
            status_url,
        }
    }

    fn endpoint(&self, event: NotificationEvent) -> Option<&str> {
        match event {
            NotificationEvent::Deallocation => self.deallocation_url.as_deref(),
            NotificationEvent::Online | NotificationEvent::Offline => self.status_url.as_deref(),
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn deliver(&self, task: &NotificationTask) -> Result<(), NotifyError> {
        let Some(url) = self.endpoint(task.event) else {
            debug!(event = task.event.as_str(), "no subscriber endpoint configured");
            return Ok(());
        };
        let res = self
            .http
            .post(url)
            .json(&task.body())
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        if res.status().is_success() {
            Ok(())
        } else {
            Err(NotifyError::Rejected(res.status().as_u16()))
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub delivered: usize,
    pub remaining: usize,
}

/// At-least-once delivery: bounded inline retry, then the retry queue.
#[derive(Clone)]
pub struct NotificationService {
    notifier: Arc<dyn Notifier>,
    queue: RetryQueueHandle,
    policy: RetryPolicy,
}

impl NotificationService {
    pub fn new(notifier: Arc<dyn Notifier>, queue: RetryQueueHandle, policy: RetryPolicy) -> Self {
        Self {
            notifier,
            queue,
            policy,
        }
    }

    pub fn queue(&self) -> &RetryQueueHandle {
        &self.queue
    }

    /// Returns true when delivered inline. On false the task is queued.
    pub async fn notify(&self, task: NotificationTask) -> bool {
        let label = task.event.as_str();
        let notifier = &self.notifier;
        let task_ref = &task;
        let outcome = self
            .policy
            .run(move |_| async move { notifier.deliver(task_ref).await })
            .await;
        match outcome {
            Ok(()) => {
                metrics::NOTIFICATIONS
                    .with_label_values(&[label, "delivered"])
                    .inc();
                info!(agent_id = %task.agent_id, event = label, "notification delivered");
                true
            }
            Err(exhausted) => {
                warn!(
                    agent_id = %task.agent_id,
                    event = label,
                    error = %exhausted,
                    "notification undelivered; queued for retry"
                );
                metrics::NOTIFICATIONS
                    .with_label_values(&[label, "queued"])
                    .inc();
                if let Err(err) = self.queue.push(task).await {
                    warn!(error = %err, event = label, "failed to enqueue notification");
                    metrics::NOTIFICATIONS
                        .with_label_values(&[label, "lost"])
                        .inc();
                }
                false
            }
        }
    }

    /// One delivery attempt per queued task; delivered tasks are acknowledged.
    pub async fn sweep(&self) -> SweepReport {
        let pending = match self.queue.pending().await {
            Ok(pending) => pending,
            Err(err) => {
                warn!(error = %err, "retry queue unavailable; skipping sweep");
                return SweepReport::default();
            }
        };
        let mut report = SweepReport::default();
        for task in pending {
            let label = task.event.as_str();
            match self.notifier.deliver(&task).await {
                Ok(()) => match self.queue.ack(task.id).await {
                    Ok(_) => {
                        report.delivered += 1;
                        metrics::NOTIFICATIONS
                            .with_label_values(&[label, "redelivered"])
                            .inc();
                    }
                    Err(err) => {
                        warn!(error = %err, "delivered notification could not be acknowledged");
                        report.remaining += 1;
                    }
                },
                Err(err) => {
                    debug!(agent_id = %task.agent_id, event = label, error = %err, "redelivery failed");
                    report.remaining += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify_queue::{InMemoryRetryQueue, RetryQueue};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    #[derive(Default)]
    struct Switchable {
        up: AtomicBool,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Notifier for Switchable {
        async fn deliver(&self, _task: &NotificationTask) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(NotifyError::Rejected(503))
            }
        }
    }

    #[test]
    fn body_uses_event_specific_stamp() {
        let task = NotificationTask::new(
            NotificationEvent::Deallocation,
            "agent-1",
            Uuid::new_v4(),
            serde_json::json!({"reason": "unreachable"}),
        );
        let body = task.body();
        assert_eq!(body["status"], "DEALLOCATION");
        assert!(body.get("deallocated_at").is_some());
        assert!(body.get("status_change_at").is_none());
        let online = NotificationTask::new(
            NotificationEvent::Online,
            "agent-1",
            Uuid::new_v4(),
            serde_json::Value::Null,
        );
        assert!(online.body().get("status_change_at").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delivery_is_queued_then_swept_once() {
        let notifier = Arc::new(Switchable::default());
        let queue = Arc::new(InMemoryRetryQueue::new(100));
        let service = NotificationService::new(
            notifier.clone(),
            queue.clone(),
            RetryPolicy::new(3, Duration::from_secs(15)),
        );
        let task = NotificationTask::new(
            NotificationEvent::Offline,
            "agent-2",
            Uuid::new_v4(),
            serde_json::Value::Null,
        );
        assert!(!service.notify(task.clone()).await);
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.len().await.unwrap(), 1);

        let report = service.sweep().await;
        assert_eq!(report, SweepReport { delivered: 0, remaining: 1 });
        assert_eq!(notifier.calls.load(Ordering::SeqCst), 4);

        notifier.up.store(true, Ordering::SeqCst);
        let report = service.sweep().await;
        assert_eq!(report, SweepReport { delivered: 1, remaining: 0 });
        assert_eq!(queue.len().await.unwrap(), 0);
        assert_eq!(service.sweep().await, SweepReport::default());
    }
}
