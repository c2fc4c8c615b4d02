//! Shared store adapter.
//!
//! Every process instance talks to one logical store that supports
//! WATCH-style optimistic transactions. The engine only ever sees the
//! [`SessionCache`] trait; the concrete backend is picked once per process
//! by [`connect_from_config`] and handed around as an `Arc`.
//!
//! ```text
//! watch(keys) ──► reads ──► commit(batch) ──► Committed | Aborted
//!                   │
//!                   └──────► release()   (precondition failed)
//! ```

mod memory;
#[cfg(feature = "redis")]
mod redis_cache;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{CacheBackend, CacheConfig};
use crate::error::{CacheError, ConfigError};

pub use memory::MemoryCache;
#[cfg(feature = "redis")]
pub use redis_cache::RedisCache;

/// A single mutation inside an atomic commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Set a string value.
    Set { key: String, value: String },
    /// Set one or more hash fields, leaving other fields untouched.
    HashSet {
        key: String,
        fields: Vec<(String, String)>,
    },
    /// Add a member to a set.
    SetAdd { key: String, member: String },
    /// Remove a member from a set. Absent members are ignored.
    SetRemove { key: String, member: String },
    /// Delete a key. Absent keys are ignored.
    Delete { key: String },
}

/// Ordered list of writes applied all-or-nothing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Set {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn hash_set<K, V>(mut self, key: impl Into<String>, fields: Vec<(K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.ops.push(WriteOp::HashSet {
            key: key.into(),
            fields: fields
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        });
        self
    }

    pub fn set_add(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(WriteOp::SetAdd {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn set_remove(mut self, key: impl Into<String>, member: impl Into<String>) -> Self {
        self.ops.push(WriteOp::SetRemove {
            key: key.into(),
            member: member.into(),
        });
        self
    }

    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.push(WriteOp::Delete { key: key.into() });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Result of submitting a batch against a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every write was applied.
    Committed,
    /// A watched key changed since the watch began; nothing was applied.
    Aborted,
}

/// One page of a cursor-driven key scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    /// Cursor for the next call. `0` means the scan is complete.
    pub cursor: u64,
    /// Keys matched on this page, in no particular order.
    pub keys: Vec<String>,
}

/// An open watch on a set of keys.
///
/// Consumed by either [`commit`](WatchHandle::commit) or
/// [`release`](WatchHandle::release). Dropping the handle also ends the
/// watch.
#[async_trait]
pub trait WatchHandle: Send {
    /// Apply `batch` atomically iff no watched key changed since the watch.
    async fn commit(self: Box<Self>, batch: WriteBatch) -> Result<CommitOutcome, CacheError>;

    /// End the watch without writing anything.
    async fn release(self: Box<Self>) -> Result<(), CacheError>;
}

/// Primitive operations against the shared store.
#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn exists(&self, key: &str) -> Result<bool, CacheError>;

    async fn is_member(&self, set: &str, member: &str) -> Result<bool, CacheError>;

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Read several hash fields; absent fields (or an absent key) yield `None`.
    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, CacheError>;

    /// One step of a glob-pattern key scan. `count` is a page-size hint.
    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, CacheError>;

    /// Start watching `keys` for modification.
    async fn watch(&self, keys: &[String]) -> Result<Box<dyn WatchHandle>, CacheError>;
}

/// Build the process-wide store handle from configuration.
pub async fn connect_from_config(
    config: &CacheConfig,
) -> Result<Arc<dyn SessionCache>, crate::error::Error> {
    match config.backend {
        CacheBackend::Memory => {
            tracing::info!("Using in-memory session cache");
            Ok(Arc::new(MemoryCache::new()))
        }
        #[cfg(feature = "redis")]
        CacheBackend::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| ConfigError::MissingEnvVar("REDIS_URL".to_string()))?;
            let cache = RedisCache::connect(url).await?;
            tracing::info!("Connected to Redis session cache");
            Ok(Arc::new(cache))
        }
        #[cfg(not(feature = "redis"))]
        CacheBackend::Redis => Err(ConfigError::BackendUnavailable {
            backend: "redis".to_string(),
            feature: "redis".to_string(),
        }
        .into()),
    }
}
