//! Actor model for the Session Controller.
//!
//! ```text
//! SessionControllerActor (singleton per SC instance)
//! └── supervises N HostActors
//!     └── HostActor (one per host with recent traffic)
//!         └── runs engine operations for that host, one at a time
//! ```
//!
//! - **Per-host serialization**: admit, accept, terminate, enable/disable and
//!   scheduled checks for one host never interleave within a process
//! - **CancellationToken propagation**: host actors get child tokens of the
//!   controller's root token
//! - **Mailbox monitoring**: depth thresholds with metrics (Controller: 200/1000,
//!   Host: 20/100)
//!
//! Reads and balance top-ups call the engine directly; they are guarded by
//! version preconditions alone.

pub mod controller;
pub mod host;
pub mod messages;
pub mod metrics;

pub use controller::{SessionControllerActor, SessionControllerHandle};
pub use host::{HostActor, HostActorHandle, HOST_IDLE_TIMEOUT};
pub use messages::{ControllerMessage, ControllerStatus, HostMessage};
pub use metrics::{ActorMetrics, ActorType, MailboxLevel, MailboxMonitor};
