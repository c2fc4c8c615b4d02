//! Redis-backed store.
//!
//! Point reads and scans share one auto-reconnecting connection. A watch
//! needs a connection of its own because WATCH state lives on the server
//! side of a single connection, so every [`RedisCache::watch`] takes one
//! from a small idle pool (or opens a new one) and carries it through to
//! EXEC. Connections go back to the pool once EXEC or UNWATCH has cleared
//! their watch state; a handle dropped mid-transaction closes its
//! connection instead.

use std::sync::Arc;

use async_trait::async_trait;
use redis::aio::{Connection, ConnectionManager};
use tokio::sync::Mutex;

use super::{CommitOutcome, ScanPage, SessionCache, WatchHandle, WriteBatch, WriteOp};
use crate::error::CacheError;

/// Transaction connections kept open between watches.
const MAX_IDLE_CONNECTIONS: usize = 8;

type IdlePool = Arc<Mutex<Vec<Connection>>>;

/// [`SessionCache`] over a Redis server.
#[derive(Clone)]
pub struct RedisCache {
    client: redis::Client,
    reads: ConnectionManager,
    idle: IdlePool,
}

impl RedisCache {
    /// Connect to `url` (`redis://host:port/db`).
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::Connection(e.to_string()))?;
        let reads = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;
        Ok(Self {
            client,
            reads,
            idle: Arc::new(Mutex::new(Vec::new())),
        })
    }

    /// Transaction connections currently parked in the pool.
    pub async fn idle_connections(&self) -> usize {
        self.idle.lock().await.len()
    }

    async fn open_connection(&self) -> Result<Connection, CacheError> {
        self.client
            .get_async_connection()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }
}

async fn send_watch(conn: &mut Connection, keys: &[String]) -> redis::RedisResult<()> {
    if keys.is_empty() {
        return Ok(());
    }
    redis::cmd("WATCH").arg(keys).query_async(conn).await
}

async fn check_in(idle: &IdlePool, conn: Connection) {
    let mut idle = idle.lock().await;
    if idle.len() < MAX_IDLE_CONNECTIONS {
        idle.push(conn);
    }
}

#[async_trait]
impl SessionCache for RedisCache {
    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.reads.clone();
        let found: bool = redis::cmd("EXISTS")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }

    async fn is_member(&self, set: &str, member: &str) -> Result<bool, CacheError> {
        let mut conn = self.reads.clone();
        let found: bool = redis::cmd("SISMEMBER")
            .arg(set)
            .arg(member)
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.reads.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, CacheError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.reads.clone();
        let values: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, CacheError> {
        let mut conn = self.reads.clone();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(ScanPage { cursor, keys })
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn WatchHandle>, CacheError> {
        let pooled = self.idle.lock().await.pop();
        let conn = match pooled {
            Some(mut conn) => match send_watch(&mut conn, keys).await {
                Ok(()) => conn,
                Err(e) if e.is_io_error() => {
                    tracing::debug!(error = %e, "Idle Redis connection broken, reconnecting");
                    let mut conn = self.open_connection().await?;
                    send_watch(&mut conn, keys).await?;
                    conn
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                let mut conn = self.open_connection().await?;
                send_watch(&mut conn, keys).await?;
                conn
            }
        };
        Ok(Box::new(RedisWatch {
            conn,
            idle: Arc::clone(&self.idle),
        }))
    }
}

/// Dedicated connection holding a server-side WATCH.
struct RedisWatch {
    conn: Connection,
    idle: IdlePool,
}

#[async_trait]
impl WatchHandle for RedisWatch {
    async fn commit(self: Box<Self>, batch: WriteBatch) -> Result<CommitOutcome, CacheError> {
        let RedisWatch { mut conn, idle } = *self;
        let mut pipe = redis::pipe();
        pipe.atomic();
        for op in batch.ops() {
            match op {
                WriteOp::Set { key, value } => {
                    pipe.set(key, value).ignore();
                }
                WriteOp::HashSet { key, fields } => {
                    pipe.hset_multiple(key, fields.as_slice()).ignore();
                }
                WriteOp::SetAdd { key, member } => {
                    pipe.sadd(key, member).ignore();
                }
                WriteOp::SetRemove { key, member } => {
                    pipe.srem(key, member).ignore();
                }
                WriteOp::Delete { key } => {
                    pipe.del(key).ignore();
                }
            }
        }

        // EXEC replies nil when a watched key was touched.
        let reply: Option<()> = pipe.query_async(&mut conn).await?;
        check_in(&idle, conn).await;
        Ok(match reply {
            Some(()) => CommitOutcome::Committed,
            None => CommitOutcome::Aborted,
        })
    }

    async fn release(self: Box<Self>) -> Result<(), CacheError> {
        let RedisWatch { mut conn, idle } = *self;
        redis::cmd("UNWATCH")
            .query_async::<_, ()>(&mut conn)
            .await?;
        check_in(&idle, conn).await;
        Ok(())
    }
}
