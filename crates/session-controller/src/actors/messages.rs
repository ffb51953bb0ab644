//! Message types for actor communication.
//!
//! Requests carry a `oneshot` reply channel; the actor answers with the
//! engine's result unchanged.

use super::host::HostActorHandle;
use crate::engine::{AdmitOutcome, TaskOutcome};
use crate::errors::ScError;
use crate::models::{Channel, SessionType, TempHost, TempHostStatus, WaitlistEntry};
use crate::services::ScheduledTask;
use tokio::sync::oneshot;

/// Messages sent to `SessionControllerActor`.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Get (spawning if needed) the actor that serializes a host's operations.
    GetHost {
        host_id: String,
        respond_to: oneshot::Sender<Result<HostActorHandle, ScError>>,
    },

    /// Current controller status (for readiness and debugging).
    GetStatus {
        respond_to: oneshot::Sender<ControllerStatus>,
    },

    /// Stop accepting work and cancel every host actor.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

/// Messages sent to `HostActor`. One variant per state-advancing operation.
#[derive(Debug)]
pub enum HostMessage {
    EnableChannel {
        session_type: SessionType,
        device: String,
        respond_to: oneshot::Sender<Result<Channel, ScError>>,
    },

    DisableChannel {
        session_type: SessionType,
        respond_to: oneshot::Sender<Result<Channel, ScError>>,
    },

    JoinWaitlist {
        session_type: SessionType,
        user_id: String,
        subtype: Option<String>,
        respond_to: oneshot::Sender<Result<Vec<WaitlistEntry>, ScError>>,
    },

    LeaveWaitlist {
        session_type: SessionType,
        user_id: String,
        respond_to: oneshot::Sender<Result<Vec<WaitlistEntry>, ScError>>,
    },

    AdmitTempHost {
        session_type: SessionType,
        user_id: String,
        respond_to: oneshot::Sender<Result<AdmitOutcome, ScError>>,
    },

    PatchTempHost {
        session_type: SessionType,
        user_id: String,
        status: TempHostStatus,
        respond_to: oneshot::Sender<Result<TempHost, ScError>>,
    },

    /// A scheduled task for one of this host's channels came due.
    HandleTask {
        task: ScheduledTask,
        respond_to: oneshot::Sender<Result<TaskOutcome, ScError>>,
    },
}

impl HostMessage {
    /// Operation name for log fields.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            HostMessage::EnableChannel { .. } => "enable_channel",
            HostMessage::DisableChannel { .. } => "disable_channel",
            HostMessage::JoinWaitlist { .. } => "join_waitlist",
            HostMessage::LeaveWaitlist { .. } => "leave_waitlist",
            HostMessage::AdmitTempHost { .. } => "admit_temp_host",
            HostMessage::PatchTempHost { .. } => "patch_temp_host_status",
            HostMessage::HandleTask { .. } => "handle_task",
        }
    }
}

/// Snapshot of the controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerStatus {
    pub host_actor_count: usize,
    pub is_draining: bool,
    pub mailbox_depth: usize,
}
