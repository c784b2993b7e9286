use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::metrics;
use crate::notify::NotificationTask;
use crate::notify_queue_redis::RedisRetryQueue;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("retry queue store error: {0}")]
    Store(String),
}

/// Notifications whose inline delivery gave up, awaiting the next sweep.
/// Bounded: pushing onto a full queue evicts the oldest entry.
#[async_trait]
pub trait RetryQueue: Send + Sync {
    async fn push(&self, task: NotificationTask) -> Result<(), QueueError>;

    /// Snapshot of queued tasks, oldest first. Does not remove anything.
    async fn pending(&self) -> Result<Vec<NotificationTask>, QueueError>;

    /// Remove exactly the task with this id. Returns whether it was present.
    async fn ack(&self, id: Uuid) -> Result<bool, QueueError>;

    async fn len(&self) -> Result<usize, QueueError>;
}

pub type RetryQueueHandle = Arc<dyn RetryQueue>;

pub fn build_retry_queue(redis_url: Option<&str>, cap: usize) -> RetryQueueHandle {
    if let Some(url) = redis_url {
        match RedisRetryQueue::connect(url, cap) {
            Ok(queue) => return Arc::new(queue),
            Err(err) => {
                warn!(error = %err, "failed to init redis retry queue; falling back to memory")
            }
        }
    }
    Arc::new(InMemoryRetryQueue::new(cap))
}

pub(crate) fn record_eviction(task: &NotificationTask, cap: usize) {
    metrics::RETRY_QUEUE_DROPPED.inc();
    warn!(
        agent_id = %task.agent_id,
        event = task.event.as_str(),
        cap,
        "retry queue full; dropping oldest notification"
    );
}

pub struct InMemoryRetryQueue {
    cap: usize,
    tasks: Mutex<VecDeque<NotificationTask>>,
}

impl InMemoryRetryQueue {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            tasks: Mutex::new(VecDeque::new()),
        }
    }
}

#[async_trait]
impl RetryQueue for InMemoryRetryQueue {
    async fn push(&self, task: NotificationTask) -> Result<(), QueueError> {
        let mut tasks = self.tasks.lock().await;
        while tasks.len() >= self.cap {
            if let Some(evicted) = tasks.pop_front() {
                record_eviction(&evicted, self.cap);
            }
        }
        tasks.push_back(task);
        metrics::RETRY_QUEUE_DEPTH.set(tasks.len() as i64);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<NotificationTask>, QueueError> {
        Ok(self.tasks.lock().await.iter().cloned().collect())
    }

    async fn ack(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut tasks = self.tasks.lock().await;
        let before = tasks.len();
        tasks.retain(|task| task.id != id);
        metrics::RETRY_QUEUE_DEPTH.set(tasks.len() as i64);
        Ok(tasks.len() < before)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.tasks.lock().await.len())
    }
}
