//! Engine harness wired to mocks.

use session_controller::actors::{ActorMetrics, SessionControllerHandle};
use session_controller::clock::ManualClock;
use session_controller::engine::{EngineConfig, EngineDeps, SessionEngine};
use session_controller::services::dispatcher::mock::MockDispatcher;
use session_controller::services::events::mock::MockEventBus;
use session_controller::services::recording::mock::MockRecording;
use session_controller::store::{InMemorySequence, InMemoryStore};
use std::sync::Arc;

/// Start time for the manual clock, well clear of zero so that
/// "`ended_at` > `started_at`" style assertions are meaningful.
pub const TEST_START_MS: i64 = 1_700_000_000_000;

/// A [`SessionEngine`] plus handles to every collaborator it talks to.
pub struct TestEngine {
    pub engine: Arc<SessionEngine>,
    pub store: Arc<InMemoryStore>,
    pub recording: Arc<MockRecording>,
    pub dispatcher: Arc<MockDispatcher>,
    pub events: Arc<MockEventBus>,
    pub clock: Arc<ManualClock>,
}

impl TestEngine {
    /// Default config, working recording service.
    #[must_use]
    pub fn new() -> Self {
        Self::build(MockRecording::working(), EngineConfig::default())
    }

    #[must_use]
    pub fn with_recording(recording: MockRecording) -> Self {
        Self::build(recording, EngineConfig::default())
    }

    #[must_use]
    pub fn with_config(config: EngineConfig) -> Self {
        Self::build(MockRecording::working(), config)
    }

    fn build(recording: MockRecording, config: EngineConfig) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let recording = Arc::new(recording);
        let dispatcher = Arc::new(MockDispatcher::new());
        let events = Arc::new(MockEventBus::new());
        let clock = Arc::new(ManualClock::new(TEST_START_MS));

        let deps = EngineDeps {
            store: store.clone(),
            sequence: Arc::new(InMemorySequence::new()),
            recording: recording.clone(),
            dispatcher: dispatcher.clone(),
            publisher: events.clone(),
            notifier: events.clone(),
            clock: clock.clone(),
        };

        Self {
            engine: Arc::new(SessionEngine::new(deps, config)),
            store,
            recording,
            dispatcher,
            events,
            clock,
        }
    }

    /// Actor front end over this engine.
    #[must_use]
    pub fn controller(&self) -> SessionControllerHandle {
        SessionControllerHandle::new(
            "sc-test".to_string(),
            Arc::clone(&self.engine),
            ActorMetrics::new(),
        )
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.clock.advance_ms(minutes * 60_000);
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}
