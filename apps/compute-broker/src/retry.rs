use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Bounded retry: `max_attempts` tries with a fixed pause between them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

/// Every attempt failed; `last` is the final error.
#[derive(Debug, thiserror::Error)]
#[error("gave up after {attempts} attempts: {last}")]
pub struct Exhausted<E: std::fmt::Display> {
    pub attempts: u32,
    pub last: E,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff,
        }
    }

    /// Runs `op` until it succeeds or the attempts run out. The closure receives
    /// the 1-based attempt number. No pause follows the final attempt.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, Exhausted<E>>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(last) if attempt >= attempts => {
                    return Err(Exhausted {
                        attempts: attempt,
                        last,
                    });
                }
                Err(err) => {
                    debug!(attempt, error = %err, backoff_ms = self.backoff.as_millis() as u64, "retrying");
                    tokio::time::sleep(self.backoff).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts_without_trailing_sleep() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_secs(15));
        let started = tokio::time::Instant::now();
        let counter = calls.clone();
        let result: Result<(), _> = policy
            .run(|_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>("down")
                }
            })
            .await;
        let err = result.unwrap_err();
        assert_eq!(err.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_first_success() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let value = policy
            .run(|attempt| async move {
                if attempt < 2 { Err("not yet") } else { Ok(attempt) }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
