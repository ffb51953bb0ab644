//! Aggregate persistence.
//!
//! Every aggregate is a JSON document stored under `{kind}:{id}` together with
//! a version the store bumps on each write. Writes are only ever issued as one
//! batch where each key carries a precondition, so a batch is applied entirely
//! or not at all.
//!
//! Version `0` is never stored; it stands for "key absent" on the wire.

pub mod coordinator;
pub mod lua_scripts;
pub mod memory;
pub mod redis;

use crate::errors::ScError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub use coordinator::{with_retry, UnitOfWork};
pub use memory::{InMemorySequence, InMemoryStore};
pub use self::redis::{RedisSequence, RedisStore};

/// A document type stored by the aggregate store.
pub trait Aggregate: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Key prefix, e.g. `channel`.
    const KIND: &'static str;

    #[must_use]
    fn key_for(id: &str) -> String {
        format!("{}:{id}", Self::KIND)
    }
}

/// Condition a key must satisfy for a batch to apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Key must not exist.
    Absent,
    /// Key must still be at this version.
    Version(u64),
}

impl Precondition {
    /// Wire form used by the Lua script: `0` for absent.
    #[must_use]
    pub fn expected_version(&self) -> u64 {
        match self {
            Precondition::Absent => 0,
            Precondition::Version(v) => *v,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOp {
    pub key: String,
    pub value: String,
    pub precondition: Precondition,
}

/// Stored document and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub data: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A precondition failed; nothing was written.
    #[error("version conflict on {key}")]
    Conflict { key: String },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("corrupt record at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

impl From<StoreError> for ScError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { key } => ScError::TransactionConflict(key),
            other => ScError::Store(other.to_string()),
        }
    }
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Key-addressed document store with atomic multi-key conditional writes.
#[async_trait]
pub trait AggregateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError>;

    /// Apply every write or none of them.
    ///
    /// Returns `StoreError::Conflict` naming the first key whose precondition
    /// did not hold.
    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StoreError>;
}

/// Monotonic named counters (`channel_token`, `device_session`).
#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    async fn next(&self, name: &str) -> Result<u64, StoreError>;
}

pub const SEQ_CHANNEL_TOKEN: &str = "channel_token";
pub const SEQ_DEVICE_SESSION: &str = "device_session";
