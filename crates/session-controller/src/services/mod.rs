//! External collaborators consumed by the engine.
//!
//! Each collaborator is a trait with a production implementation and a
//! `mock` module for tests:
//!
//! - [`recording`] - cloud recording (acquire/start/stop/query)
//! - [`dispatcher`] - delayed task delivery
//! - [`events`] - realtime pub/sub and notification requests

pub mod dispatcher;
pub mod events;
pub mod recording;

pub use dispatcher::{DispatcherClient, ScheduledTask, TaskDispatcher};
pub use events::{EventPublisher, LogOnlyEventBus, Notification, NotificationKind, Notifier, RedisEventBus};
pub use recording::{RecordingClient, RecordingIds, RecordingService, RecordingStatus, StartRecordingRequest};
