//! Recording service HTTP client.
//!
//! Sessions are recorded by an external cloud-recording service. Starting a
//! recording takes two calls: `acquire` reserves a resource for a channel,
//! then `start` begins capture into the configured storage bucket.
//!
//! Start failures abort the operation that asked for them. Stop failures are
//! logged and swallowed by callers.

use crate::errors::ScError;
use crate::observability::metrics;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, instrument, warn};

/// Resource and recording ids returned by `start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingIds {
    pub resource_id: String,
    pub recording_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingStatus {
    Active,
    Stopped,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartRecordingRequest {
    pub resource_id: String,
    pub channel_id: String,
    pub token: u64,
    pub uid: u64,
    /// Uids of everyone in the session.
    pub participants: Vec<u64>,
    pub storage_bucket: String,
}

#[derive(Debug, Serialize)]
struct AcquireRequest<'a> {
    channel_id: &'a str,
    uid: u64,
}

#[derive(Debug, Deserialize)]
struct AcquireResponse {
    resource_id: String,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: RecordingStatus,
}

/// Recording operations (enables mocking).
#[async_trait::async_trait]
pub trait RecordingService: Send + Sync {
    /// Reserve a recording resource for a channel.
    async fn acquire(&self, channel_id: &str, uid: u64) -> Result<String, ScError>;

    async fn start(&self, request: &StartRecordingRequest) -> Result<RecordingIds, ScError>;

    async fn stop(&self, ids: &RecordingIds) -> Result<(), ScError>;

    async fn query(&self, ids: &RecordingIds) -> Result<RecordingStatus, ScError>;
}

/// HTTP client for the recording service.
#[derive(Clone)]
pub struct RecordingClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl RecordingClient {
    /// # Errors
    ///
    /// Returns `ScError::Internal` if the HTTP client cannot be built.
    pub fn new(
        base_url: String,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self, ScError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| {
                error!(target: "sc.services.recording", error = %e, "Failed to build HTTP client");
                ScError::Internal(format!("failed to build recording client: {e}"))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }

    async fn check(
        &self,
        stage: &'static str,
        result: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<reqwest::Response, ScError> {
        let response = result.map_err(|e| {
            metrics::record_recording_failure(stage);
            warn!(target: "sc.services.recording", stage, error = %e, "Recording request failed");
            ScError::External(format!("recording {stage} request failed: {e}"))
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        metrics::record_recording_failure(stage);
        let body = response.text().await.unwrap_or_default();
        warn!(
            target: "sc.services.recording",
            stage,
            status = %status,
            body = %body,
            "Recording service returned an error"
        );
        Err(ScError::External(format!(
            "recording {stage} returned {status}"
        )))
    }
}

#[async_trait::async_trait]
impl RecordingService for RecordingClient {
    #[instrument(skip_all, fields(channel_id = %channel_id))]
    async fn acquire(&self, channel_id: &str, uid: u64) -> Result<String, ScError> {
        let url = format!("{}/v1/recordings/acquire", self.base_url);
        let result = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(&AcquireRequest { channel_id, uid })
            .send()
            .await;

        let response = self.check("acquire", result).await?;
        let body: AcquireResponse = response.json().await.map_err(|e| {
            error!(target: "sc.services.recording", error = %e, "Failed to parse acquire response");
            ScError::External(format!("invalid acquire response: {e}"))
        })?;
        Ok(body.resource_id)
    }

    #[instrument(skip_all, fields(channel_id = %request.channel_id))]
    async fn start(&self, request: &StartRecordingRequest) -> Result<RecordingIds, ScError> {
        let url = format!("{}/v1/recordings/start", self.base_url);
        let result = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .json(request)
            .send()
            .await;

        let response = self.check("start", result).await?;
        response.json().await.map_err(|e| {
            error!(target: "sc.services.recording", error = %e, "Failed to parse start response");
            ScError::External(format!("invalid start response: {e}"))
        })
    }

    #[instrument(skip_all, fields(recording_id = %ids.recording_id))]
    async fn stop(&self, ids: &RecordingIds) -> Result<(), ScError> {
        let url = format!(
            "{}/v1/recordings/{}/{}/stop",
            self.base_url, ids.resource_id, ids.recording_id
        );
        let result = self
            .client
            .post(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await;

        self.check("stop", result).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(recording_id = %ids.recording_id))]
    async fn query(&self, ids: &RecordingIds) -> Result<RecordingStatus, ScError> {
        let url = format!(
            "{}/v1/recordings/{}/{}",
            self.base_url, ids.resource_id, ids.recording_id
        );
        let result = self
            .client
            .get(&url)
            .header("Authorization", self.auth_header())
            .send()
            .await;

        let response = self.check("query", result).await?;
        let body: QueryResponse = response.json().await.map_err(|e| {
            error!(target: "sc.services.recording", error = %e, "Failed to parse query response");
            ScError::External(format!("invalid query response: {e}"))
        })?;
        Ok(body.status)
    }
}

/// Mock recording service for tests.
pub mod mock {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    pub struct MockRecording {
        fail_acquire: bool,
        fail_start: AtomicBool,
        fail_stop: bool,
        status: Mutex<RecordingStatus>,
        acquire_count: AtomicUsize,
        start_count: AtomicUsize,
        stopped: Mutex<Vec<RecordingIds>>,
    }

    impl MockRecording {
        fn build(fail_acquire: bool, fail_start: bool, fail_stop: bool) -> Self {
            Self {
                fail_acquire,
                fail_start: AtomicBool::new(fail_start),
                fail_stop,
                status: Mutex::new(RecordingStatus::Active),
                acquire_count: AtomicUsize::new(0),
                start_count: AtomicUsize::new(0),
                stopped: Mutex::new(Vec::new()),
            }
        }

        /// Every call succeeds.
        pub fn working() -> Self {
            Self::build(false, false, false)
        }

        /// `start` fails until `set_start_failing(false)`.
        pub fn failing_start() -> Self {
            Self::build(false, true, false)
        }

        pub fn failing_acquire() -> Self {
            Self::build(true, false, false)
        }

        /// `stop` fails; everything else succeeds.
        pub fn failing_stop() -> Self {
            Self::build(false, false, true)
        }

        pub fn set_start_failing(&self, failing: bool) {
            self.fail_start.store(failing, Ordering::SeqCst);
        }

        pub async fn set_status(&self, status: RecordingStatus) {
            *self.status.lock().await = status;
        }

        pub fn acquire_count(&self) -> usize {
            self.acquire_count.load(Ordering::SeqCst)
        }

        pub fn start_count(&self) -> usize {
            self.start_count.load(Ordering::SeqCst)
        }

        /// Ids passed to `stop`, in call order.
        pub async fn stopped(&self) -> Vec<RecordingIds> {
            self.stopped.lock().await.clone()
        }
    }

    #[async_trait::async_trait]
    impl RecordingService for MockRecording {
        async fn acquire(&self, channel_id: &str, _uid: u64) -> Result<String, ScError> {
            let n = self.acquire_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_acquire {
                return Err(ScError::External("mock acquire failure".to_string()));
            }
            Ok(format!("res-{channel_id}-{n}"))
        }

        async fn start(&self, request: &StartRecordingRequest) -> Result<RecordingIds, ScError> {
            let n = self.start_count.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(ScError::External("mock start failure".to_string()));
            }
            Ok(RecordingIds {
                resource_id: request.resource_id.clone(),
                recording_id: format!("rec-{n}"),
            })
        }

        async fn stop(&self, ids: &RecordingIds) -> Result<(), ScError> {
            self.stopped.lock().await.push(ids.clone());
            if self.fail_stop {
                return Err(ScError::External("mock stop failure".to_string()));
            }
            Ok(())
        }

        async fn query(&self, _ids: &RecordingIds) -> Result<RecordingStatus, ScError> {
            Ok(*self.status.lock().await)
        }
    }
}
