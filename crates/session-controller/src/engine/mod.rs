//! Session admission and lifecycle engine.
//!
//! Every state-advancing operation follows the same shape:
//!
//! 1. Open a [`UnitOfWork`] and read the aggregates it needs.
//! 2. Apply waitlist / state machine / billing rules in memory.
//! 3. Commit every changed aggregate in one conditional batch, re-running
//!    from fresh reads on a version conflict.
//! 4. Run side effects (scheduled checks, realtime events, notifications,
//!    recording stops) best-effort. Their failures never fail the operation.
//!
//! Operations for one host are serialized by that host's actor; the version
//! preconditions cover everything else (other processes, the participant
//! aggregate shared across hosts).

pub mod billing;
mod lifecycle;
mod tasks;
mod temp_host;
mod waitlist;

use crate::clock::Clock;
use crate::config::Config;
use crate::errors::ScError;
use crate::models::{Channel, Host, SessionType, TempHost, WaitlistEntry};
use crate::observability::metrics;
use crate::services::{
    EventPublisher, Notification, Notifier, RecordingIds, RecordingService, ScheduledTask,
    TaskDispatcher,
};
use crate::store::{with_retry, AggregateStore, SequenceGenerator, UnitOfWork};
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

pub use tasks::{TaskOutcome, MAX_TOP_UP_AMOUNT};

/// Engine tunables, derived from [`Config`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub commit_max_attempts: u32,
    pub balance_check_max_interval_ms: i64,
    pub recording_check_delay_seconds: u64,
    pub min_session_ms: i64,
    pub min_balance_minutes: i64,
    pub recording_storage_bucket: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            commit_max_attempts: crate::config::DEFAULT_COMMIT_MAX_ATTEMPTS,
            balance_check_max_interval_ms: crate::config::DEFAULT_BALANCE_CHECK_MAX_INTERVAL_SECONDS
                as i64
                * 1000,
            recording_check_delay_seconds: crate::config::DEFAULT_RECORDING_CHECK_DELAY_SECONDS,
            min_session_ms: crate::config::DEFAULT_MIN_SESSION_SECONDS * 1000,
            min_balance_minutes: crate::config::DEFAULT_MIN_BALANCE_MINUTES,
            recording_storage_bucket: crate::config::DEFAULT_RECORDING_STORAGE_BUCKET.to_string(),
        }
    }
}

impl From<&Config> for EngineConfig {
    fn from(config: &Config) -> Self {
        Self {
            commit_max_attempts: config.commit_max_attempts,
            balance_check_max_interval_ms: i64::try_from(config.balance_check_max_interval_seconds)
                .unwrap_or(i64::MAX / 1000)
                * 1000,
            recording_check_delay_seconds: config.recording_check_delay_seconds,
            min_session_ms: config.min_session_seconds * 1000,
            min_balance_minutes: config.min_balance_minutes,
            recording_storage_bucket: config.recording_storage_bucket.clone(),
        }
    }
}

/// Everything the engine talks to.
#[derive(Clone)]
pub struct EngineDeps {
    pub store: Arc<dyn AggregateStore>,
    pub sequence: Arc<dyn SequenceGenerator>,
    pub recording: Arc<dyn RecordingService>,
    pub dispatcher: Arc<dyn TaskDispatcher>,
    pub publisher: Arc<dyn EventPublisher>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

/// Work done after a successful commit.
#[derive(Debug, Clone)]
pub(crate) enum SideEffect {
    Schedule {
        task: ScheduledTask,
        delay_seconds: u64,
    },
    Publish {
        topic: String,
        event: &'static str,
        payload: Value,
    },
    Notify(Notification),
    StopRecording(RecordingIds),
}

impl SideEffect {
    fn label(&self) -> &'static str {
        match self {
            SideEffect::Schedule { .. } => "schedule",
            SideEffect::Publish { .. } => "publish",
            SideEffect::Notify(_) => "notify",
            SideEffect::StopRecording(_) => "stop_recording",
        }
    }
}

/// Result of admitting a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AdmitOutcome {
    /// Candidate is now the REQUESTED occupant.
    Admitted { temp_host: TempHost },
    /// Balance below the minimum; candidate moved to the tail of the channel waitlist.
    Requeued { waitlist: Vec<WaitlistEntry> },
    /// No active channel; candidate queued on the host's offline waitlist.
    Queued { waitlist: Vec<WaitlistEntry> },
}

pub struct SessionEngine {
    store: Arc<dyn AggregateStore>,
    sequence: Arc<dyn SequenceGenerator>,
    recording: Arc<dyn RecordingService>,
    dispatcher: Arc<dyn TaskDispatcher>,
    publisher: Arc<dyn EventPublisher>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
}

impl SessionEngine {
    #[must_use]
    pub fn new(deps: EngineDeps, config: EngineConfig) -> Self {
        Self {
            store: deps.store,
            sequence: deps.sequence,
            recording: deps.recording,
            dispatcher: deps.dispatcher,
            publisher: deps.publisher,
            notifier: deps.notifier,
            clock: deps.clock,
            config,
        }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn begin(&self) -> UnitOfWork {
        UnitOfWork::new(Arc::clone(&self.store))
    }

    fn now(&self) -> i64 {
        self.clock.now_ms()
    }

    /// Run a state-advancing operation with conflict retry, then its side effects.
    async fn run_operation<T, F, Fut>(&self, operation: &'static str, attempt: F) -> Result<T, ScError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(T, Vec<SideEffect>), ScError>>,
    {
        let start = Instant::now();
        let result = with_retry(operation, self.config.commit_max_attempts, attempt).await;
        metrics::record_operation(
            operation,
            result.as_ref().err().map(ScError::error_type_label),
            start.elapsed(),
        );

        let (value, effects) = result?;
        self.run_effects(operation, effects).await;
        Ok(value)
    }

    /// Run a read-only operation.
    async fn run_query<T, Fut>(&self, operation: &'static str, query: Fut) -> Result<T, ScError>
    where
        Fut: Future<Output = Result<T, ScError>>,
    {
        let start = Instant::now();
        let result = query.await;
        metrics::record_operation(
            operation,
            result.as_ref().err().map(ScError::error_type_label),
            start.elapsed(),
        );
        result
    }

    pub(crate) async fn run_effects(&self, operation: &'static str, effects: Vec<SideEffect>) {
        for effect in effects {
            let label = effect.label();
            let result = match &effect {
                SideEffect::Schedule {
                    task,
                    delay_seconds,
                } => self.dispatcher.enqueue(task, *delay_seconds).await,
                SideEffect::Publish {
                    topic,
                    event,
                    payload,
                } => self.publisher.publish(topic, event, payload).await,
                SideEffect::Notify(notification) => self.notifier.notify(notification).await,
                SideEffect::StopRecording(ids) => {
                    let result = self.recording.stop(ids).await;
                    if result.is_err() {
                        metrics::record_recording_failure("stop");
                    }
                    result
                }
            };

            match result {
                Ok(()) => {
                    debug!(target: "sc.engine", operation, effect = label, "Side effect completed");
                }
                Err(e) => {
                    metrics::record_side_effect_failure(label);
                    warn!(
                        target: "sc.engine",
                        operation,
                        effect = label,
                        error = %e,
                        "Side effect failed, continuing"
                    );
                }
            }
        }
    }

    /// The active channel a host has open for `session_type`, if any.
    ///
    /// A reference to a missing or ended channel is `ChannelNotFound`; a
    /// channel of a different type is `ChannelRestricted`.
    async fn resolve_active_channel(
        &self,
        uow: &mut UnitOfWork,
        host: &Host,
        session_type: SessionType,
    ) -> Result<Option<Channel>, ScError> {
        let Some(channel_id) = host.active_channels.get(&session_type) else {
            return Ok(None);
        };

        let channel = uow
            .load::<Channel>(channel_id)
            .await?
            .filter(Channel::is_active)
            .ok_or_else(|| ScError::ChannelNotFound(channel_id.clone()))?;

        if channel.session_type != session_type {
            return Err(ScError::ChannelRestricted(format!(
                "channel {} is a {} channel",
                channel.id, channel.session_type
            )));
        }

        Ok(Some(channel))
    }

    async fn require_active_channel(
        &self,
        uow: &mut UnitOfWork,
        host: &Host,
        session_type: SessionType,
    ) -> Result<Channel, ScError> {
        self.resolve_active_channel(uow, host, session_type)
            .await?
            .ok_or_else(|| {
                ScError::ChannelNotFound(format!("no active {session_type} channel for {}", host.id))
            })
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Active channel for a host and session type.
    pub async fn get_channel(
        &self,
        host_id: &str,
        session_type: SessionType,
    ) -> Result<Channel, ScError> {
        self.run_query("get_channel", async {
            let mut uow = self.begin();
            let host: Host = uow.require(host_id, ScError::HostNotFound).await?;
            self.require_active_channel(&mut uow, &host, session_type)
                .await
        })
        .await
    }

    /// The waitlist candidates currently queue in: the active channel's list,
    /// or the host's offline list when no channel is active.
    pub async fn get_waitlist(
        &self,
        host_id: &str,
        session_type: SessionType,
    ) -> Result<Vec<WaitlistEntry>, ScError> {
        self.run_query("get_waitlist", async {
            let mut uow = self.begin();
            let host: Host = uow.require(host_id, ScError::HostNotFound).await?;
            let channel = self
                .resolve_active_channel(&mut uow, &host, session_type)
                .await?;
            Ok(effective_waitlist(&host, channel.as_ref(), session_type))
        })
        .await
    }

    /// Current occupant of the active channel.
    pub async fn get_temp_host(
        &self,
        host_id: &str,
        session_type: SessionType,
    ) -> Result<TempHost, ScError> {
        self.run_query("get_temp_host", async {
            let mut uow = self.begin();
            let host: Host = uow.require(host_id, ScError::HostNotFound).await?;
            let channel = self
                .require_active_channel(&mut uow, &host, session_type)
                .await?;
            channel
                .temp_host
                .ok_or_else(|| ScError::TempHostNotFound(format!("channel {} is empty", channel.id)))
        })
        .await
    }
}

fn effective_waitlist(
    host: &Host,
    channel: Option<&Channel>,
    session_type: SessionType,
) -> Vec<WaitlistEntry> {
    match channel {
        Some(channel) => channel.waitlist.clone(),
        None => host
            .waitlists
            .get(&session_type)
            .cloned()
            .unwrap_or_default(),
    }
}

/// Convert a millisecond delay to whole seconds, rounding up.
fn delay_seconds(delay_ms: i64) -> u64 {
    u64::try_from(delay_ms.max(0)).unwrap_or(0).div_ceil(1000)
}
