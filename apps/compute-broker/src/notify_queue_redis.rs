use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use crate::metrics;
use crate::notify::NotificationTask;
use crate::notify_queue::{QueueError, RetryQueue, record_eviction};

const LIST_RETRY: &str = "broker:notify:retry";

/// Durable retry queue: a Redis list of JSON tasks, oldest at the head.
pub struct RedisRetryQueue {
    client: redis::Client,
    cap: usize,
}

impl RedisRetryQueue {
    pub fn connect(url: &str, cap: usize) -> Result<Self, QueueError> {
        let client = redis::Client::open(url).map_err(store)?;
        Ok(Self {
            client,
            cap: cap.max(1),
        })
    }

    async fn conn(&self) -> Result<ConnectionManager, QueueError> {
        self.client.get_connection_manager().await.map_err(store)
    }

    async fn raw_entries(
        &self,
        conn: &mut ConnectionManager,
    ) -> Result<Vec<(String, NotificationTask)>, QueueError> {
        let entries: Vec<String> = conn.lrange(LIST_RETRY, 0, -1).await.map_err(store)?;
        Ok(entries
            .into_iter()
            .filter_map(|raw| {
                serde_json::from_str::<NotificationTask>(&raw)
                    .ok()
                    .map(|task| (raw, task))
            })
            .collect())
    }
}

fn store(err: impl std::fmt::Display) -> QueueError {
    QueueError::Store(err.to_string())
}

#[async_trait]
impl RetryQueue for RedisRetryQueue {
    async fn push(&self, task: NotificationTask) -> Result<(), QueueError> {
        let mut conn = self.conn().await?;
        let payload = serde_json::to_string(&task).map_err(store)?;
        let len: usize = conn.rpush(LIST_RETRY, payload).await.map_err(store)?;
        if len > self.cap {
            let overflow = len - self.cap;
            let evicted: Vec<String> = conn
                .lrange(LIST_RETRY, 0, overflow as isize - 1)
                .await
                .map_err(store)?;
            let _: () = conn
                .ltrim(LIST_RETRY, -(self.cap as isize), -1)
                .await
                .map_err(store)?;
            for raw in evicted {
                if let Ok(task) = serde_json::from_str::<NotificationTask>(&raw) {
                    record_eviction(&task, self.cap);
                }
            }
        }
        metrics::RETRY_QUEUE_DEPTH.set(len.min(self.cap) as i64);
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<NotificationTask>, QueueError> {
        let mut conn = self.conn().await?;
        Ok(self
            .raw_entries(&mut conn)
            .await?
            .into_iter()
            .map(|(_, task)| task)
            .collect())
    }

    async fn ack(&self, id: Uuid) -> Result<bool, QueueError> {
        let mut conn = self.conn().await?;
        let Some((raw, _)) = self
            .raw_entries(&mut conn)
            .await?
            .into_iter()
            .find(|(_, task)| task.id == id)
        else {
            return Ok(false);
        };
        let removed: usize = conn.lrem(LIST_RETRY, 1, raw).await.map_err(store)?;
        let len: usize = conn.llen(LIST_RETRY).await.map_err(store)?;
        metrics::RETRY_QUEUE_DEPTH.set(len as i64);
        Ok(removed > 0)
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn().await?;
        conn.llen(LIST_RETRY).await.map_err(store)
    }
}
