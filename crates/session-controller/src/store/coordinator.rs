//! Unit of work over the aggregate store.
//!
//! A unit of work records the version of every key it reads, serves later
//! reads of the same key from its own snapshot (or from staged writes), and
//! commits every staged write as one conditional batch:
//!
//! - key read and present: `Precondition::Version(v)`
//! - key read and absent, or never read: `Precondition::Absent`
//!
//! [`with_retry`] re-runs a whole operation from fresh reads when the batch
//! loses a version check.

use super::{Aggregate, AggregateStore, Precondition, WriteOp};
use crate::errors::ScError;
use crate::observability::metrics;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

struct Observed {
    version: Option<u64>,
    data: Option<String>,
}

pub struct UnitOfWork {
    store: Arc<dyn AggregateStore>,
    observed: HashMap<String, Observed>,
    staged: BTreeMap<String, String>,
}

impl UnitOfWork {
    #[must_use]
    pub fn new(store: Arc<dyn AggregateStore>) -> Self {
        Self {
            store,
            observed: HashMap::new(),
            staged: BTreeMap::new(),
        }
    }

    /// Read an aggregate, preferring staged writes over the snapshot.
    pub async fn load<T: Aggregate>(&mut self, id: &str) -> Result<Option<T>, ScError> {
        let key = T::key_for(id);

        if let Some(json) = self.staged.get(&key) {
            return Ok(Some(serde_json::from_str(json)?));
        }

        if !self.observed.contains_key(&key) {
            let found = self.store.get(&key).await?;
            let observed = match found {
                Some(v) => Observed {
                    version: Some(v.version),
                    data: Some(v.data),
                },
                None => Observed {
                    version: None,
                    data: None,
                },
            };
            self.observed.insert(key.clone(), observed);
        }

        match self.observed.get(&key).and_then(|o| o.data.as_deref()) {
            Some(json) => Ok(Some(serde_json::from_str(json)?)),
            None => Ok(None),
        }
    }

    /// Read an aggregate that must exist.
    pub async fn require<T: Aggregate>(
        &mut self,
        id: &str,
        not_found: fn(String) -> ScError,
    ) -> Result<T, ScError> {
        self.load::<T>(id)
            .await?
            .ok_or_else(|| not_found(id.to_string()))
    }

    /// Queue a write. Later loads of the same aggregate see this value.
    pub fn stage<T: Aggregate>(&mut self, id: &str, value: &T) -> Result<(), ScError> {
        let json = serde_json::to_string(value)?;
        self.staged.insert(T::key_for(id), json);
        Ok(())
    }

    #[must_use]
    pub fn staged_count(&self) -> usize {
        self.staged.len()
    }

    /// Commit every staged write as one conditional batch.
    pub async fn commit(self) -> Result<(), ScError> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let writes: Vec<WriteOp> = self
            .staged
            .into_iter()
            .map(|(key, value)| {
                let precondition = match self.observed.get(&key).and_then(|o| o.version) {
                    Some(v) => Precondition::Version(v),
                    None => Precondition::Absent,
                };
                WriteOp {
                    key,
                    value,
                    precondition,
                }
            })
            .collect();

        debug!(target: "sc.store.coordinator", writes = writes.len(), "Committing unit of work");
        self.store.commit(writes).await?;
        Ok(())
    }
}

/// Run `attempt` until it succeeds, fails with something other than a
/// conflict, or `max_attempts` conflicts have been seen.
pub async fn with_retry<T, F, Fut>(
    operation: &'static str,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T, ScError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut tries = 0;

    loop {
        tries += 1;
        match attempt().await {
            Err(ScError::TransactionConflict(key)) => {
                metrics::record_commit_conflict(operation);
                if tries >= max_attempts {
                    warn!(
                        target: "sc.store.coordinator",
                        operation,
                        key = %key,
                        attempts = tries,
                        "Giving up after repeated version conflicts"
                    );
                    return Err(ScError::TransactionConflict(key));
                }
                debug!(
                    target: "sc.store.coordinator",
                    operation,
                    key = %key,
                    attempt = tries,
                    "Version conflict, retrying from fresh reads"
                );
            }
            other => return other,
        }
    }
}
