//! Pre-configured hosts and participants.
//!
//! Builders produce the stored aggregate and write it straight into an
//! [`InMemoryStore`], bypassing the engine.

use session_controller::models::{Host, Participant, Pricing, SessionType};
use session_controller::store::{Aggregate, AggregateStore, InMemoryStore};

/// Test host fixture.
#[derive(Debug, Clone)]
pub struct TestHost {
    host: Host,
}

impl TestHost {
    /// Host with no pricing configured.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            host: Host {
                name: format!("Host {id}"),
                id,
                ..Host::default()
            },
        }
    }

    /// Price a session type at `rate` per minute with no offer.
    #[must_use]
    pub fn with_rate(self, session_type: SessionType, rate: f64) -> Self {
        self.with_pricing(session_type, rate, 0.0)
    }

    /// Price a session type with a percentage discount.
    #[must_use]
    pub fn with_pricing(mut self, session_type: SessionType, rate: f64, offer: f64) -> Self {
        self.host
            .pricing
            .insert(session_type, Pricing { rate, offer });
        self
    }

    /// Seed the lifetime counters used for wait-time estimates.
    #[must_use]
    pub fn with_history(mut self, session_type: SessionType, time_spent_ms: i64, orders: u64) -> Self {
        self.host.channel_time_spent.insert(session_type, time_spent_ms);
        self.host.orders = orders;
        self
    }

    #[must_use]
    pub fn build(self) -> Host {
        self.host
    }

    /// Write the host into the store and return it.
    pub async fn seed(self, store: &InMemoryStore) -> Host {
        let host = self.host;
        store
            .put_raw(
                &Host::key_for(&host.id),
                serde_json::to_string(&host).expect("host serializes"),
            )
            .await;
        host
    }
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    participant: Participant,
}

impl TestParticipant {
    /// Participant with a zero balance.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            participant: Participant {
                name: format!("User {id}"),
                id,
                ..Participant::default()
            },
        }
    }

    #[must_use]
    pub fn with_balance(mut self, balance: f64) -> Self {
        self.participant.balance = balance;
        self
    }

    #[must_use]
    pub fn with_uid(mut self, uid: u64) -> Self {
        self.participant.uid = uid;
        self
    }

    #[must_use]
    pub fn build(self) -> Participant {
        self.participant
    }

    /// Write the participant into the store and return it.
    pub async fn seed(self, store: &InMemoryStore) -> Participant {
        let participant = self.participant;
        store
            .put_raw(
                &Participant::key_for(&participant.id),
                serde_json::to_string(&participant).expect("participant serializes"),
            )
            .await;
        participant
    }
}

/// Read an aggregate back from the store, `None` if absent.
pub async fn load<T: Aggregate>(store: &InMemoryStore, id: &str) -> Option<T> {
    let record = store
        .get(&T::key_for(id))
        .await
        .expect("in-memory store read");
    record.map(|r| serde_json::from_str(&r.data).expect("stored aggregate deserializes"))
}
