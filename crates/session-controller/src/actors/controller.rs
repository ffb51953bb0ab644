//! `SessionControllerActor` - singleton supervisor for host actors.
//!
//! - Singleton per Session Controller instance
//! - Spawns a `HostActor` the first time a host sees traffic
//! - Replaces host actors that went idle or died
//! - Owns the root `CancellationToken` for graceful shutdown
//!
//! # Graceful Shutdown
//!
//! On SIGTERM the controller stops handing out host actors, cancels the root
//! token (propagating to every host actor) and waits for them to exit.

use super::host::{HostActor, HostActorHandle, HOST_IDLE_TIMEOUT};
use super::messages::{ControllerMessage, ControllerStatus};
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::engine::{AdmitOutcome, SessionEngine, TaskOutcome};
use crate::errors::ScError;
use crate::models::{Channel, SessionType, TempHost, TempHostStatus, WaitlistEntry};
use crate::services::ScheduledTask;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default channel buffer size for the controller mailbox.
const CONTROLLER_CHANNEL_BUFFER: usize = 1000;

/// How often finished host actors are reaped.
const REAP_INTERVAL: Duration = Duration::from_secs(30);

/// How long shutdown waits for each host actor.
const HOST_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts to reach a host actor. A second attempt covers an actor that
/// exited for idleness between lookup and send.
const HOST_REQUEST_ATTEMPTS: u32 = 2;

/// Handle to the `SessionControllerActor`.
///
/// Every state-advancing engine operation goes through here and is routed to
/// the owning host's actor.
#[derive(Clone)]
pub struct SessionControllerHandle {
    sender: mpsc::Sender<ControllerMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
}

impl SessionControllerHandle {
    /// Spawn the controller actor and return a handle to it.
    #[must_use]
    pub fn new(sc_id: String, engine: Arc<SessionEngine>, metrics: Arc<ActorMetrics>) -> Self {
        Self::with_idle_timeout(sc_id, engine, metrics, HOST_IDLE_TIMEOUT)
    }

    /// Like [`Self::new`] with a custom host actor idle timeout.
    #[must_use]
    pub fn with_idle_timeout(
        sc_id: String,
        engine: Arc<SessionEngine>,
        metrics: Arc<ActorMetrics>,
        idle_timeout: Duration,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(CONTROLLER_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Controller, &sc_id));

        let actor = SessionControllerActor {
            sc_id,
            receiver,
            cancel_token: cancel_token.clone(),
            hosts: HashMap::new(),
            accepting_new: true,
            engine,
            metrics,
            mailbox: Arc::clone(&mailbox),
            idle_timeout,
        };

        tokio::spawn(actor.run());

        Self {
            sender,
            cancel_token,
            mailbox,
        }
    }

    pub async fn enable_channel(
        &self,
        host_id: &str,
        session_type: SessionType,
        device: &str,
    ) -> Result<Channel, ScError> {
        self.with_host(host_id, |host| async move {
            host.enable_channel(session_type, device.to_string()).await
        })
        .await
    }

    pub async fn disable_channel(
        &self,
        host_id: &str,
        session_type: SessionType,
    ) -> Result<Channel, ScError> {
        self.with_host(host_id, |host| async move { host.disable_channel(session_type).await })
            .await
    }

    pub async fn join_waitlist(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
        subtype: Option<String>,
    ) -> Result<Vec<WaitlistEntry>, ScError> {
        self.with_host(host_id, |host| {
            let subtype = subtype.clone();
            async move {
                host.join_waitlist(session_type, user_id.to_string(), subtype)
                    .await
            }
        })
        .await
    }

    pub async fn leave_waitlist(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<Vec<WaitlistEntry>, ScError> {
        self.with_host(host_id, |host| async move {
            host.leave_waitlist(session_type, user_id.to_string()).await
        })
        .await
    }

    pub async fn admit_temp_host(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
    ) -> Result<AdmitOutcome, ScError> {
        self.with_host(host_id, |host| async move {
            host.admit_temp_host(session_type, user_id.to_string()).await
        })
        .await
    }

    pub async fn patch_temp_host(
        &self,
        host_id: &str,
        session_type: SessionType,
        user_id: &str,
        status: TempHostStatus,
    ) -> Result<TempHost, ScError> {
        self.with_host(host_id, |host| async move {
            host.patch_temp_host(session_type, user_id.to_string(), status)
                .await
        })
        .await
    }

    /// Route a delivered scheduled task to its host's actor.
    pub async fn handle_task(&self, task: ScheduledTask) -> Result<TaskOutcome, ScError> {
        let host_id = task.host_id().to_string();
        self.with_host(&host_id, |host| {
            let task = task.clone();
            async move { host.handle_task(task).await }
        })
        .await
    }

    /// Get (spawning if needed) the actor for a host.
    pub async fn host(&self, host_id: &str) -> Result<HostActorHandle, ScError> {
        self.request(|respond_to| ControllerMessage::GetHost {
            host_id: host_id.to_string(),
            respond_to,
        })
        .await?
    }

    pub async fn get_status(&self) -> Result<ControllerStatus, ScError> {
        self.request(|respond_to| ControllerMessage::GetStatus { respond_to })
            .await
    }

    /// Stop accepting work and cancel every host actor.
    pub async fn shutdown(&self) -> Result<(), ScError> {
        self.request(|respond_to| ControllerMessage::Shutdown { respond_to })
            .await
    }

    /// Cancel the actor tree immediately.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    async fn with_host<T, F, Fut>(&self, host_id: &str, mut call: F) -> Result<T, ScError>
    where
        F: FnMut(HostActorHandle) -> Fut,
        Fut: Future<Output = Result<T, ScError>>,
    {
        let mut attempt = 1;
        loop {
            let host = self.host(host_id).await?;
            let closed_probe = host.clone();

            match call(host).await {
                Err(ScError::Unavailable(reason))
                    if closed_probe.is_closed()
                        && !closed_probe.is_cancelled()
                        && attempt < HOST_REQUEST_ATTEMPTS =>
                {
                    debug!(
                        target: "sc.actor.controller",
                        host_id = %host_id,
                        reason = %reason,
                        "Host actor closed, retrying with a fresh actor"
                    );
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControllerMessage,
    ) -> Result<T, ScError> {
        let (tx, rx) = oneshot::channel();

        self.mailbox.record_enqueue();
        if let Err(e) = self.sender.send(build(tx)).await {
            self.mailbox.record_send_failure();
            return Err(ScError::Unavailable(format!("controller send failed: {e}")));
        }

        rx.await
            .map_err(|e| ScError::Unavailable(format!("controller response failed: {e}")))
    }
}

/// A supervised host actor.
struct ManagedHost {
    handle: HostActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `SessionControllerActor` implementation.
pub struct SessionControllerActor {
    sc_id: String,
    receiver: mpsc::Receiver<ControllerMessage>,
    /// Root cancellation token.
    cancel_token: CancellationToken,
    hosts: HashMap<String, ManagedHost>,
    accepting_new: bool,
    engine: Arc<SessionEngine>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    idle_timeout: Duration,
}

impl SessionControllerActor {
    #[instrument(skip_all, name = "sc.actor.controller", fields(sc_id = %self.sc_id))]
    async fn run(mut self) {
        info!(
            target: "sc.actor.controller",
            sc_id = %self.sc_id,
            "SessionControllerActor started"
        );

        let mut reap = tokio::time::interval(REAP_INTERVAL);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.actor.controller",
                        sc_id = %self.sc_id,
                        "SessionControllerActor received cancellation signal"
                    );
                    self.graceful_shutdown().await;
                    break;
                }

                _ = reap.tick() => {
                    self.reap_finished_hosts().await;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_dequeue();
                            self.handle_message(message);
                            self.metrics.record_message_processed();
                        }
                        None => {
                            info!(
                                target: "sc.actor.controller",
                                sc_id = %self.sc_id,
                                "SessionControllerActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "sc.actor.controller",
            sc_id = %self.sc_id,
            messages_processed = self.mailbox.messages_processed(),
            "SessionControllerActor stopped"
        );
    }

    fn handle_message(&mut self, message: ControllerMessage) {
        match message {
            ControllerMessage::GetHost {
                host_id,
                respond_to,
            } => {
                let result = self.get_or_spawn_host(host_id);
                let _ = respond_to.send(result);
            }

            ControllerMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(self.get_status());
            }

            ControllerMessage::Shutdown { respond_to } => {
                info!(
                    target: "sc.actor.controller",
                    sc_id = %self.sc_id,
                    host_actors = self.hosts.len(),
                    "Initiating graceful shutdown"
                );
                self.accepting_new = false;
                self.cancel_token.cancel();
                let _ = respond_to.send(());
            }
        }
    }

    fn get_or_spawn_host(&mut self, host_id: String) -> Result<HostActorHandle, ScError> {
        if !self.accepting_new {
            return Err(ScError::Unavailable("controller is draining".to_string()));
        }

        let predecessor = match self.hosts.remove(&host_id) {
            Some(managed) if !managed.handle.is_closed() && !managed.task_handle.is_finished() => {
                let handle = managed.handle.clone();
                self.hosts.insert(host_id, managed);
                return Ok(handle);
            }
            Some(managed) => {
                // Idle or dead; the replacement waits for it to finish draining.
                self.metrics.host_actor_stopped();
                Some(managed.task_handle)
            }
            None => None,
        };

        let (handle, task_handle) = HostActor::spawn(
            host_id.clone(),
            self.cancel_token.child_token(),
            Arc::clone(&self.engine),
            Arc::clone(&self.metrics),
            self.idle_timeout,
            predecessor,
        );
        self.hosts.insert(
            host_id.clone(),
            ManagedHost {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.host_actor_started();

        debug!(
            target: "sc.actor.controller",
            sc_id = %self.sc_id,
            host_id = %host_id,
            host_actors = self.hosts.len(),
            "Host actor spawned"
        );

        Ok(handle)
    }

    fn get_status(&self) -> ControllerStatus {
        ControllerStatus {
            host_actor_count: self.hosts.len(),
            is_draining: !self.accepting_new,
            mailbox_depth: self.mailbox.current_depth(),
        }
    }

    /// Drop host actors whose task has ended, recording panics.
    async fn reap_finished_hosts(&mut self) {
        let finished: Vec<String> = self
            .hosts
            .iter()
            .filter(|(_, managed)| managed.task_handle.is_finished())
            .map(|(host_id, _)| host_id.clone())
            .collect();

        for host_id in finished {
            let Some(managed) = self.hosts.remove(&host_id) else {
                continue;
            };
            self.metrics.host_actor_stopped();

            if let Err(join_error) = managed.task_handle.await {
                if join_error.is_panic() {
                    error!(
                        target: "sc.actor.controller",
                        sc_id = %self.sc_id,
                        host_id = %host_id,
                        error = ?join_error,
                        "Host actor panicked"
                    );
                    self.metrics.record_panic(ActorType::Host);
                }
            }
        }
    }

    async fn graceful_shutdown(&mut self) {
        self.accepting_new = false;

        for managed in self.hosts.values() {
            managed.handle.cancel();
        }

        for (host_id, managed) in self.hosts.drain() {
            match tokio::time::timeout(HOST_SHUTDOWN_TIMEOUT, managed.task_handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        target: "sc.actor.controller",
                        sc_id = %self.sc_id,
                        host_id = %host_id,
                        error = ?e,
                        "Host actor task panicked during shutdown"
                    );
                }
                Err(_) => {
                    warn!(
                        target: "sc.actor.controller",
                        sc_id = %self.sc_id,
                        host_id = %host_id,
                        "Host actor shutdown timed out"
                    );
                }
            }
            self.metrics.host_actor_stopped();
        }

        info!(
            target: "sc.actor.controller",
            sc_id = %self.sc_id,
            "Graceful shutdown complete"
        );
    }
}
