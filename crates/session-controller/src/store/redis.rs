//! Redis-backed aggregate store and sequence generator.
//!
//! # Key Patterns
//!
//! - `{kind}:{id}` - Aggregate HASH with `version` and `data` fields
//! - `seq:{name}` - Sequence counter (INCR)
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently, so
//! every operation clones it instead of sharing it behind a lock.

use super::lua_scripts;
use super::{AggregateStore, SequenceGenerator, StoreError, Versioned, WriteOp};
use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, Script};
use async_trait::async_trait;
use tracing::{debug, error, instrument, warn};

/// Open a multiplexed connection.
///
/// The URL is never logged since it may carry credentials.
pub async fn connect(redis_url: &str) -> Result<MultiplexedConnection, StoreError> {
    let client = Client::open(redis_url).map_err(|e| {
        error!(target: "sc.store.redis", error = %e, "Failed to open Redis client");
        StoreError::Backend(format!("Failed to open Redis client: {e}"))
    })?;

    client
        .get_multiplexed_async_connection()
        .await
        .map_err(|e| {
            error!(target: "sc.store.redis", error = %e, "Failed to connect to Redis");
            StoreError::Backend(format!("Failed to connect to Redis: {e}"))
        })
}

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    commit_script: Script,
    read_script: Script,
}

impl RedisStore {
    #[must_use]
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self {
            connection,
            commit_script: Script::new(lua_scripts::CONDITIONAL_COMMIT),
            read_script: Script::new(lua_scripts::READ_VERSIONED),
        }
    }
}

#[async_trait]
impl AggregateStore for RedisStore {
    #[instrument(skip_all, fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Option<Versioned>, StoreError> {
        let mut conn = self.connection.clone();

        let fields: Vec<String> = self
            .read_script
            .key(key)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| {
                warn!(target: "sc.store.redis", error = %e, key = %key, "Failed to read aggregate");
                StoreError::from(e)
            })?;

        match fields.as_slice() {
            [] => Ok(None),
            [version, data] => {
                let version = version.parse::<u64>().map_err(|e| StoreError::Corrupt {
                    key: key.to_string(),
                    reason: format!("bad version '{version}': {e}"),
                })?;
                Ok(Some(Versioned {
                    version,
                    data: data.clone(),
                }))
            }
            _ => Err(StoreError::Corrupt {
                key: key.to_string(),
                reason: format!("expected 2 fields, got {}", fields.len()),
            }),
        }
    }

    #[instrument(skip_all, fields(keys = writes.len()))]
    async fn commit(&self, writes: Vec<WriteOp>) -> Result<(), StoreError> {
        if writes.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection.clone();
        let mut invocation = self.commit_script.prepare_invoke();
        for write in &writes {
            invocation.key(&write.key);
            invocation
                .arg(write.precondition.expected_version())
                .arg(&write.value);
        }

        let result: i64 = invocation.invoke_async(&mut conn).await.map_err(|e| {
            warn!(target: "sc.store.redis", error = %e, "Conditional commit failed");
            StoreError::from(e)
        })?;

        match result {
            0 => {
                debug!(target: "sc.store.redis", keys = writes.len(), "Committed batch");
                Ok(())
            }
            index if index > 0 => {
                let key = usize::try_from(index - 1)
                    .ok()
                    .and_then(|i| writes.get(i))
                    .map(|w| w.key.clone())
                    .unwrap_or_default();
                debug!(target: "sc.store.redis", key = %key, "Precondition failed");
                Err(StoreError::Conflict { key })
            }
            other => {
                error!(target: "sc.store.redis", result = other, "Commit script rejected arguments");
                Err(StoreError::Backend(format!(
                    "commit script returned {other}"
                )))
            }
        }
    }
}

#[derive(Clone)]
pub struct RedisSequence {
    connection: MultiplexedConnection,
}

impl RedisSequence {
    #[must_use]
    pub fn new(connection: MultiplexedConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl SequenceGenerator for RedisSequence {
    #[instrument(skip_all, fields(name = %name))]
    async fn next(&self, name: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let value: u64 = conn.incr(format!("seq:{name}"), 1u64).await.map_err(|e| {
            warn!(target: "sc.store.redis", error = %e, name = %name, "Failed to advance sequence");
            StoreError::from(e)
        })?;
        Ok(value)
    }
}
