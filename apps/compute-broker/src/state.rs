use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::engine::AllocationEngine;
use crate::liveness::LivenessSnapshot;
use crate::notify::NotificationService;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    engine: Arc<AllocationEngine>,
    notifications: NotificationService,
    liveness: watch::Receiver<LivenessSnapshot>,
    request_deadline: Option<Duration>,
    status_timeout: Duration,
}

impl AppState {
    pub fn new(
        engine: Arc<AllocationEngine>,
        notifications: NotificationService,
        liveness: watch::Receiver<LivenessSnapshot>,
        request_deadline: Option<Duration>,
        status_timeout: Duration,
    ) -> Self {
        Self {
            start: Instant::now(),
            engine,
            notifications,
            liveness,
            request_deadline,
            status_timeout,
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn engine(&self) -> Arc<AllocationEngine> {
        Arc::clone(&self.engine)
    }

    pub fn notifications(&self) -> &NotificationService {
        &self.notifications
    }

    pub fn liveness(&self) -> LivenessSnapshot {
        self.liveness.borrow().clone()
    }

    pub fn request_deadline(&self) -> Option<Duration> {
        self.request_deadline
    }

    pub fn status_timeout(&self) -> Duration {
        self.status_timeout
    }
}
