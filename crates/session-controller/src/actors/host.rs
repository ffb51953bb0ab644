//! `HostActor` - serializes every state-advancing operation for one host.
//!
//! Admission, accept, terminate and the scheduled checks for a host's
//! channels all read-modify-write the same aggregates. Running them one at a
//! time through this mailbox means they never race inside one process; the
//! store's version preconditions still guard against other processes.
//!
//! An actor with nothing to do for [`HOST_IDLE_TIMEOUT`] closes its mailbox,
//! finishes whatever was already queued and exits. The controller spawns a
//! fresh one on the next request.

use super::messages::HostMessage;
use super::metrics::{ActorMetrics, ActorType, MailboxMonitor};
use crate::engine::{AdmitOutcome, SessionEngine, TaskOutcome};
use crate::errors::ScError;
use crate::models::{Channel, SessionType, TempHost, TempHostStatus, WaitlistEntry};
use crate::services::ScheduledTask;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for a host mailbox.
const HOST_CHANNEL_BUFFER: usize = 256;

/// How long a host actor waits for work before exiting.
pub const HOST_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Handle to a `HostActor`.
#[derive(Clone, Debug)]
pub struct HostActorHandle {
    sender: mpsc::Sender<HostMessage>,
    cancel_token: CancellationToken,
    mailbox: Arc<MailboxMonitor>,
    host_id: String,
}

impl HostActorHandle {
    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    pub async fn enable_channel(
        &self,
        session_type: SessionType,
        device: String,
    ) -> Result<Channel, ScError> {
        self.request(|respond_to| HostMessage::EnableChannel {
            session_type,
            device,
            respond_to,
        })
        .await
    }

    pub async fn disable_channel(&self, session_type: SessionType) -> Result<Channel, ScError> {
        self.request(|respond_to| HostMessage::DisableChannel {
            session_type,
            respond_to,
        })
        .await
    }

    pub async fn join_waitlist(
        &self,
        session_type: SessionType,
        user_id: String,
        subtype: Option<String>,
    ) -> Result<Vec<WaitlistEntry>, ScError> {
        self.request(|respond_to| HostMessage::JoinWaitlist {
            session_type,
            user_id,
            subtype,
            respond_to,
        })
        .await
    }

    pub async fn leave_waitlist(
        &self,
        session_type: SessionType,
        user_id: String,
    ) -> Result<Vec<WaitlistEntry>, ScError> {
        self.request(|respond_to| HostMessage::LeaveWaitlist {
            session_type,
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn admit_temp_host(
        &self,
        session_type: SessionType,
        user_id: String,
    ) -> Result<AdmitOutcome, ScError> {
        self.request(|respond_to| HostMessage::AdmitTempHost {
            session_type,
            user_id,
            respond_to,
        })
        .await
    }

    pub async fn patch_temp_host(
        &self,
        session_type: SessionType,
        user_id: String,
        status: TempHostStatus,
    ) -> Result<TempHost, ScError> {
        self.request(|respond_to| HostMessage::PatchTempHost {
            session_type,
            user_id,
            status,
            respond_to,
        })
        .await
    }

    pub async fn handle_task(&self, task: ScheduledTask) -> Result<TaskOutcome, ScError> {
        self.request(|respond_to| HostMessage::HandleTask { task, respond_to })
            .await
    }

    /// Whether the actor has stopped taking messages.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    #[must_use]
    pub fn mailbox_depth(&self) -> usize {
        self.mailbox.current_depth()
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<Result<T, ScError>>) -> HostMessage,
    ) -> Result<T, ScError> {
        let (tx, rx) = oneshot::channel();

        self.mailbox.record_enqueue();
        if self.sender.send(build(tx)).await.is_err() {
            self.mailbox.record_send_failure();
            return Err(ScError::Unavailable(format!(
                "host actor {} is not accepting messages",
                self.host_id
            )));
        }

        rx.await.map_err(|e| {
            ScError::Unavailable(format!("host actor {} dropped the request: {e}", self.host_id))
        })?
    }
}

/// The `HostActor` implementation.
pub struct HostActor {
    host_id: String,
    receiver: mpsc::Receiver<HostMessage>,
    /// Child of the controller's token.
    cancel_token: CancellationToken,
    engine: Arc<SessionEngine>,
    metrics: Arc<ActorMetrics>,
    mailbox: Arc<MailboxMonitor>,
    idle_timeout: Duration,
    /// Previous actor for this host, still draining its mailbox.
    predecessor: Option<JoinHandle<()>>,
}

impl HostActor {
    /// Spawn a host actor. Returns a handle and the task join handle.
    ///
    /// With a `predecessor`, messages queue up until it has exited so the
    /// two never run operations for the host at the same time.
    pub fn spawn(
        host_id: String,
        cancel_token: CancellationToken,
        engine: Arc<SessionEngine>,
        metrics: Arc<ActorMetrics>,
        idle_timeout: Duration,
        predecessor: Option<JoinHandle<()>>,
    ) -> (HostActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(HOST_CHANNEL_BUFFER);
        let mailbox = Arc::new(MailboxMonitor::new(ActorType::Host, &host_id));

        let actor = Self {
            host_id: host_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            engine,
            metrics,
            mailbox: Arc::clone(&mailbox),
            idle_timeout,
            predecessor,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = HostActorHandle {
            sender,
            cancel_token,
            mailbox,
            host_id,
        };

        (handle, task_handle)
    }

    #[instrument(skip_all, name = "sc.actor.host", fields(host_id = %self.host_id))]
    async fn run(mut self) {
        if let Some(predecessor) = self.predecessor.take() {
            if let Err(e) = predecessor.await {
                warn!(
                    target: "sc.actor.host",
                    host_id = %self.host_id,
                    error = ?e,
                    "Previous host actor ended abnormally"
                );
            }
        }

        debug!(target: "sc.actor.host", host_id = %self.host_id, "HostActor started");

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "sc.actor.host",
                        host_id = %self.host_id,
                        pending = self.mailbox.current_depth(),
                        "HostActor received cancellation signal"
                    );
                    self.receiver.close();
                    break;
                }

                () = tokio::time::sleep(self.idle_timeout) => {
                    debug!(target: "sc.actor.host", host_id = %self.host_id, "HostActor idle, draining");
                    self.receiver.close();
                    while let Some(message) = self.receiver.recv().await {
                        self.process(message).await;
                    }
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.process(message).await,
                        None => {
                            debug!(
                                target: "sc.actor.host",
                                host_id = %self.host_id,
                                "HostActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        debug!(
            target: "sc.actor.host",
            host_id = %self.host_id,
            messages_processed = self.mailbox.messages_processed(),
            "HostActor stopped"
        );
    }

    async fn process(&mut self, message: HostMessage) {
        self.mailbox.record_dequeue();
        debug!(target: "sc.actor.host", host_id = %self.host_id, operation = message.name(), "Processing");
        self.handle_message(message).await;
        self.metrics.record_message_processed();
    }

    /// Run one message against the engine and reply. A dropped reply
    /// receiver means the caller went away; the work is done regardless.
    async fn handle_message(&self, message: HostMessage) {
        let engine = &self.engine;
        let host_id = self.host_id.as_str();

        match message {
            HostMessage::EnableChannel {
                session_type,
                device,
                respond_to,
            } => {
                let result = engine.enable_channel(host_id, session_type, &device).await;
                let _ = respond_to.send(result);
            }

            HostMessage::DisableChannel {
                session_type,
                respond_to,
            } => {
                let result = engine.disable_channel(host_id, session_type).await;
                let _ = respond_to.send(result);
            }

            HostMessage::JoinWaitlist {
                session_type,
                user_id,
                subtype,
                respond_to,
            } => {
                let result = engine
                    .join_waitlist(host_id, session_type, &user_id, subtype)
                    .await;
                let _ = respond_to.send(result);
            }

            HostMessage::LeaveWaitlist {
                session_type,
                user_id,
                respond_to,
            } => {
                let result = engine.leave_waitlist(host_id, session_type, &user_id).await;
                let _ = respond_to.send(result);
            }

            HostMessage::AdmitTempHost {
                session_type,
                user_id,
                respond_to,
            } => {
                let result = engine.admit_temp_host(host_id, session_type, &user_id).await;
                let _ = respond_to.send(result);
            }

            HostMessage::PatchTempHost {
                session_type,
                user_id,
                status,
                respond_to,
            } => {
                let result = engine
                    .patch_temp_host_status(host_id, session_type, &user_id, status)
                    .await;
                let _ = respond_to.send(result);
            }

            HostMessage::HandleTask { task, respond_to } => {
                let result = engine.handle_task(task).await;
                let _ = respond_to.send(result);
            }
        }
    }
}
