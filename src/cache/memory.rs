//! In-process store with WATCH/EXEC semantics.
//!
//! Backs tests and single-instance deployments. Every key carries a
//! modification version taken from a global clock; a watch snapshots the
//! versions of its keys and a commit only applies while they are unchanged.
//! A deleted key keeps its version only while some watch covers it, so a
//! delete-then-recreate is still seen as a modification without the version
//! table growing with every key ever written.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::RwLock;

use super::{CommitOutcome, ScanPage, SessionCache, WatchHandle, WriteBatch, WriteOp};
use crate::error::CacheError;

/// Scans left unfinished are forgotten once this many are open.
const MAX_OPEN_CURSORS: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Str(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Default)]
struct State {
    entries: BTreeMap<String, Entry>,
    /// Versions of live keys, plus deleted keys that are still watched.
    versions: HashMap<String, u64>,
    /// Number of open watches per key.
    watchers: HashMap<String, usize>,
    clock: u64,
    /// Open scan cursors, mapped to the last key they examined.
    cursors: BTreeMap<u64, String>,
    next_cursor: u64,
}

impl State {
    fn version(&self, key: &str) -> u64 {
        self.versions.get(key).copied().unwrap_or(0)
    }

    fn watch_keys(&mut self, keys: &[String]) -> Vec<(String, u64)> {
        let mut snapshot = Vec::with_capacity(keys.len());
        for key in keys {
            *self.watchers.entry(key.clone()).or_default() += 1;
            snapshot.push((key.clone(), self.version(key)));
        }
        snapshot
    }

    fn unwatch_keys<'a>(&mut self, keys: impl IntoIterator<Item = &'a String>) {
        for key in keys {
            let Some(count) = self.watchers.get_mut(key) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.watchers.remove(key);
                if !self.entries.contains_key(key) {
                    self.versions.remove(key);
                }
            }
        }
    }

    /// Apply `batch` iff every key in `snapshot` still has the version seen
    /// at watch time.
    fn commit(
        &mut self,
        snapshot: &[(String, u64)],
        batch: &WriteBatch,
    ) -> Result<CommitOutcome, CacheError> {
        if snapshot.iter().any(|(key, seen)| self.version(key) != *seen) {
            return Ok(CommitOutcome::Aborted);
        }

        // Stage every touched key so a failing op leaves the store untouched.
        let mut staged: HashMap<String, Option<Entry>> = HashMap::new();
        for op in batch.ops() {
            let key = match op {
                WriteOp::Set { key, .. }
                | WriteOp::HashSet { key, .. }
                | WriteOp::SetAdd { key, .. }
                | WriteOp::SetRemove { key, .. }
                | WriteOp::Delete { key } => key,
            };
            if !staged.contains_key(key) {
                staged.insert(key.clone(), self.entries.get(key).cloned());
            }
        }
        let original = staged.clone();
        for op in batch.ops() {
            apply(&mut staged, op)?;
        }

        for (key, value) in staged {
            if original.get(&key) == Some(&value) {
                continue;
            }
            self.clock += 1;
            match value {
                Some(entry) => {
                    self.versions.insert(key.clone(), self.clock);
                    self.entries.insert(key, entry);
                }
                None => {
                    self.entries.remove(&key);
                    if self.watchers.contains_key(&key) {
                        self.versions.insert(key, self.clock);
                    } else {
                        self.versions.remove(&key);
                    }
                }
            }
        }

        Ok(CommitOutcome::Committed)
    }

    fn open_cursor(&mut self, last_key: String) -> u64 {
        if self.cursors.len() >= MAX_OPEN_CURSORS {
            self.cursors.pop_first();
        }
        self.next_cursor += 1;
        let id = self.next_cursor;
        self.cursors.insert(id, last_key);
        id
    }
}

/// Process-local [`SessionCache`].
///
/// Clones share the same underlying state.
#[derive(Debug, Clone, Default)]
pub struct MemoryCache {
    state: Arc<RwLock<State>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    #[cfg(test)]
    async fn tracked_versions(&self) -> usize {
        self.state.read().await.versions.len()
    }
}

fn wrong_type(key: &str, command: &str) -> CacheError {
    CacheError::WrongType {
        key: key.to_string(),
        command: command.to_string(),
    }
}

/// Translate a store glob (`*`, `?`) into an anchored regex.
fn glob_to_regex(pattern: &str) -> Result<Regex, CacheError> {
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for c in pattern.chars() {
        match c {
            '*' => re.push_str(".*"),
            '?' => re.push('.'),
            other => re.push_str(&regex::escape(&other.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| CacheError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

/// Apply one write to the staged copy of the touched keys.
fn apply(staged: &mut HashMap<String, Option<Entry>>, op: &WriteOp) -> Result<(), CacheError> {
    match op {
        WriteOp::Set { key, value } => {
            staged.insert(key.clone(), Some(Entry::Str(value.clone())));
        }
        WriteOp::HashSet { key, fields } => {
            let slot = staged.entry(key.clone()).or_insert(None);
            match slot {
                Some(Entry::Hash(hash)) => {
                    hash.extend(fields.iter().cloned());
                }
                Some(_) => return Err(wrong_type(key, "HSET")),
                None => {
                    *slot = Some(Entry::Hash(fields.iter().cloned().collect()));
                }
            }
        }
        WriteOp::SetAdd { key, member } => {
            let slot = staged.entry(key.clone()).or_insert(None);
            match slot {
                Some(Entry::Set(set)) => {
                    set.insert(member.clone());
                }
                Some(_) => return Err(wrong_type(key, "SADD")),
                None => {
                    *slot = Some(Entry::Set(BTreeSet::from([member.clone()])));
                }
            }
        }
        WriteOp::SetRemove { key, member } => {
            let slot = staged.entry(key.clone()).or_insert(None);
            match slot {
                Some(Entry::Set(set)) => {
                    set.remove(member);
                    if set.is_empty() {
                        *slot = None;
                    }
                }
                Some(_) => return Err(wrong_type(key, "SREM")),
                None => {}
            }
        }
        WriteOp::Delete { key } => {
            staged.insert(key.clone(), None);
        }
    }
    Ok(())
}

#[async_trait]
impl SessionCache for MemoryCache {
    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.state.read().await.entries.contains_key(key))
    }

    async fn is_member(&self, set: &str, member: &str) -> Result<bool, CacheError> {
        match self.state.read().await.entries.get(set) {
            Some(Entry::Set(members)) => Ok(members.contains(member)),
            Some(_) => Err(wrong_type(set, "SISMEMBER")),
            None => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        match self.state.read().await.entries.get(key) {
            Some(Entry::Str(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key, "GET")),
            None => Ok(None),
        }
    }

    async fn hash_get(&self, key: &str, fields: &[&str]) -> Result<Vec<Option<String>>, CacheError> {
        match self.state.read().await.entries.get(key) {
            Some(Entry::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(*f).cloned()).collect()),
            Some(_) => Err(wrong_type(key, "HMGET")),
            None => Ok(vec![None; fields.len()]),
        }
    }

    async fn scan(
        &self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<ScanPage, CacheError> {
        let matcher = glob_to_regex(pattern)?;
        let mut state = self.state.write().await;

        let start = if cursor == 0 {
            Bound::Unbounded
        } else {
            let last = state
                .cursors
                .remove(&cursor)
                .ok_or_else(|| CacheError::Command {
                    command: "SCAN".to_string(),
                    reason: format!("unknown or expired cursor {cursor}"),
                })?;
            Bound::Excluded(last)
        };

        let mut keys = Vec::new();
        let mut examined = 0usize;
        let mut last_examined = None;
        let mut exhausted = true;
        for key in state.entries.range((start, Bound::Unbounded)).map(|(k, _)| k) {
            if examined == count.max(1) {
                exhausted = false;
                break;
            }
            examined += 1;
            if matcher.is_match(key) {
                keys.push(key.clone());
            }
            last_examined = Some(key.clone());
        }

        let next = match (exhausted, last_examined) {
            (false, Some(last)) => state.open_cursor(last),
            _ => 0,
        };

        Ok(ScanPage { cursor: next, keys })
    }

    async fn watch(&self, keys: &[String]) -> Result<Box<dyn WatchHandle>, CacheError> {
        let snapshot = self.state.write().await.watch_keys(keys);
        Ok(Box::new(MemoryWatch {
            state: Arc::clone(&self.state),
            snapshot,
            closed: false,
        }))
    }
}

/// Watch over a [`MemoryCache`]; holds the versions seen at watch time.
struct MemoryWatch {
    state: Arc<RwLock<State>>,
    snapshot: Vec<(String, u64)>,
    closed: bool,
}

impl MemoryWatch {
    async fn close(&mut self) {
        self.state
            .write()
            .await
            .unwatch_keys(self.snapshot.iter().map(|(key, _)| key));
        self.closed = true;
    }
}

#[async_trait]
impl WatchHandle for MemoryWatch {
    async fn commit(mut self: Box<Self>, batch: WriteBatch) -> Result<CommitOutcome, CacheError> {
        let mut state = self.state.write().await;
        let outcome = state.commit(&self.snapshot, &batch);
        state.unwatch_keys(self.snapshot.iter().map(|(key, _)| key));
        drop(state);
        self.closed = true;
        outcome
    }

    async fn release(mut self: Box<Self>) -> Result<(), CacheError> {
        self.close().await;
        Ok(())
    }
}

impl Drop for MemoryWatch {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let keys: Vec<String> = self.snapshot.drain(..).map(|(key, _)| key).collect();
        if let Ok(mut state) = self.state.try_write() {
            state.unwatch_keys(&keys);
            return;
        }
        // Lock is busy; finish the bookkeeping off the dropping task.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let state = Arc::clone(&self.state);
            handle.spawn(async move {
                state.write().await.unwatch_keys(&keys);
            });
        }
    }
}
