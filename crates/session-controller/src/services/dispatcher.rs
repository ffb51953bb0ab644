//! Delayed task dispatcher client.
//!
//! The controller keeps no timers of its own. Follow-up work is handed to an
//! external dispatcher with a delay; when the delay elapses the dispatcher
//! posts the same task back to `POST /internal/v1/tasks`. Delivery is
//! at-least-once, so every task handler must be idempotent.

use crate::errors::ScError;
use crate::models::SessionType;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, instrument, warn};

/// A task scheduled for later delivery.
///
/// Serialized as `{"request_type": "...", "payload": {...}}`, which is both
/// what the dispatcher stores and what it delivers back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request_type", content = "payload", rename_all = "snake_case")]
pub enum ScheduledTask {
    /// Re-evaluate the occupant's remaining balance.
    BalanceCheck {
        host_id: String,
        session_type: SessionType,
        channel_id: String,
        user_id: String,
        order_id: String,
    },
    /// Make sure the occupancy is still being recorded.
    RecordingHealthCheck {
        host_id: String,
        session_type: SessionType,
        channel_id: String,
        order_id: String,
    },
    /// Recompute and publish waiting-time estimates.
    WaitTimeEstimate {
        host_id: String,
        session_type: SessionType,
    },
}

impl ScheduledTask {
    #[must_use]
    pub fn request_type(&self) -> &'static str {
        match self {
            ScheduledTask::BalanceCheck { .. } => "balance_check",
            ScheduledTask::RecordingHealthCheck { .. } => "recording_health_check",
            ScheduledTask::WaitTimeEstimate { .. } => "wait_time_estimate",
        }
    }

    #[must_use]
    pub fn host_id(&self) -> &str {
        match self {
            ScheduledTask::BalanceCheck { host_id, .. }
            | ScheduledTask::RecordingHealthCheck { host_id, .. }
            | ScheduledTask::WaitTimeEstimate { host_id, .. } => host_id,
        }
    }
}

/// Task scheduling (enables mocking).
#[async_trait::async_trait]
pub trait TaskDispatcher: Send + Sync {
    async fn enqueue(&self, task: &ScheduledTask, delay_seconds: u64) -> Result<(), ScError>;
}

#[derive(Debug, Serialize)]
struct EnqueueRequest<'a> {
    #[serde(flatten)]
    task: &'a ScheduledTask,
    delay_seconds: u64,
}

/// HTTP client for the task dispatcher.
#[derive(Clone)]
pub struct DispatcherClient {
    client: Client,
    base_url: String,
}

impl DispatcherClient {
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the HTTP client cannot be built.
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, ScError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "sc.services.dispatcher", error = %e, "Failed to build HTTP client");
                ScError::Internal(format!("failed to build dispatcher client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait::async_trait]
impl TaskDispatcher for DispatcherClient {
    #[instrument(skip_all, fields(request_type = task.request_type(), delay_seconds = delay_seconds))]
    async fn enqueue(&self, task: &ScheduledTask, delay_seconds: u64) -> Result<(), ScError> {
        let url = format!("{}/v1/tasks", self.base_url);

        let response = self
            .client
            .post(&url)
            .json(&EnqueueRequest {
                task,
                delay_seconds,
            })
            .send()
            .await
            .map_err(|e| {
                warn!(target: "sc.services.dispatcher", error = %e, "Dispatcher request failed");
                ScError::External(format!("dispatcher request failed: {e}"))
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            warn!(target: "sc.services.dispatcher", status = %status, "Dispatcher rejected task");
            Err(ScError::External(format!("dispatcher returned {status}")))
        }
    }
}

/// Mock dispatcher for tests.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::Mutex;

    #[derive(Default)]
    pub struct MockDispatcher {
        failing: AtomicBool,
        enqueued: Mutex<Vec<(ScheduledTask, u64)>>,
    }

    impl MockDispatcher {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn failing() -> Self {
            Self {
                failing: AtomicBool::new(true),
                enqueued: Mutex::new(Vec::new()),
            }
        }

        /// Every task enqueued so far with its delay in seconds.
        pub async fn enqueued(&self) -> Vec<(ScheduledTask, u64)> {
            self.enqueued.lock().await.clone()
        }

        /// Remove and return everything enqueued so far.
        pub async fn drain(&self) -> Vec<(ScheduledTask, u64)> {
            std::mem::take(&mut *self.enqueued.lock().await)
        }
    }

    #[async_trait::async_trait]
    impl TaskDispatcher for MockDispatcher {
        async fn enqueue(&self, task: &ScheduledTask, delay_seconds: u64) -> Result<(), ScError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(ScError::External("mock dispatcher failure".to_string()));
            }
            self.enqueued
                .lock()
                .await
                .push((task.clone(), delay_seconds));
            Ok(())
        }
    }
}
