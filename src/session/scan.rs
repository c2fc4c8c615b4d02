//! Enumeration of the client bindings under one main session.
//!
//! The store hands matches back a page at a time with a cursor; a cursor of
//! zero marks the end. Pages may repeat keys and arrive in any order, so
//! results are collected into a set.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::cache::SessionCache;
use crate::error::SessionError;
use crate::session::keys;

/// Lazy, restartable sequence of client-binding pages for one main session.
pub struct ClientPages {
    cache: Arc<dyn SessionCache>,
    pattern: String,
    count: usize,
    cursor: u64,
    more: bool,
}

impl ClientPages {
    pub fn new(
        cache: Arc<dyn SessionCache>,
        ms_id: &str,
        count: usize,
    ) -> Result<Self, SessionError> {
        Ok(Self {
            cache,
            pattern: keys::client_binding_pattern(ms_id)?,
            count,
            cursor: 0,
            more: true,
        })
    }

    /// Whether another call to [`next_page`](Self::next_page) may yield data.
    pub fn has_more(&self) -> bool {
        self.more
    }

    /// Fetch the next page of client ids, or `None` once the scan is done.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>, SessionError> {
        if !self.more {
            return Ok(None);
        }
        let page = self.cache.scan(self.cursor, &self.pattern, self.count).await?;
        self.cursor = page.cursor;
        self.more = page.cursor != 0;

        let clients = page
            .keys
            .iter()
            .filter_map(|k| keys::parse_client_binding_key(k))
            .map(str::to_string)
            .collect();
        Ok(Some(clients))
    }

    /// Start over from the first page.
    pub fn restart(&mut self) {
        self.cursor = 0;
        self.more = true;
    }

    /// Drain every remaining page into a set of client ids.
    pub async fn collect(mut self) -> Result<BTreeSet<String>, SessionError> {
        let mut clients = BTreeSet::new();
        while let Some(page) = self.next_page().await? {
            clients.extend(page);
        }
        Ok(clients)
    }
}
