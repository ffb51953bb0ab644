//! Process-local aggregate store and sequence generator.
//!
//! Used by tests and by `SC_STORE_BACKEND=memory`. Commits are serialized by
//! a single mutex, which gives the same all-or-nothing behavior as the Redis
//! script.

use super::{AggregateStore, SequenceGenerator, StoreError, Versioned, WriteOp};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, Versioned>>,
    /// Commits to fail with a conflict before applying anything.
    injected_conflicts: AtomicU32,
    commits: AtomicUsize,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with `StoreError::Conflict`.
    pub fn inject_conflicts(&self, count: u32) {
        self.injected_conflicts.store(count, Ordering::SeqCst);
    }

    /// Number of successfully applied commits.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Write a document directly, bumping its version. For seeding.
    pub async fn put_raw(&self, key: &str, data: String) {
        let mut records = self.records.lock().await;
        let version = records.get(key).map_or(0, |r| r.version) + 1;
        records.insert(key.to_string(), Versioned { version, data });
    }
}

#[async_trait]
impl AggregateStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        let mut records = self.records.lock().await;

        let injected = self
            .injected_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            let key = writes.first().map(|w| w.key.clone()).unwrap_or_default();
            return Err(StoreError::Conflict { key });
        }

        for write in &writes {
            let current = records.get(&write.key).map_or(0, |r| r.version);
            if current != write.precondition.expected_version() {
                return Err(StoreError::Conflict {
                    key: write.key.clone(),
                });
            }
        }

        for write in writes {
            let version = write.precondition.expected_version() + 1;
            records.insert(
                write.key,
                Versioned {
                    version,
                    data: write.value,
                },
            );
        }

        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemorySequence {
    counters: Mutex<HashMap<String, u64>>,
}

impl InMemorySequence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SequenceGenerator for InMemorySequence {
    async fn next(&self, name: &str) -> Result<u64, StoreError> {
        let mut counters = self.counters.lock().await;
        let counter = counters.entry(name.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }
}
