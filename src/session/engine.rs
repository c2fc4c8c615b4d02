//! Session transaction engine.
//!
//! Sole writer of main sessions, sub sessions and client bindings. Every
//! mutation runs as watch → validate → commit against the shared store and
//! either applies its whole batch or nothing. A commit that loses a race
//! returns [`SessionError::ConcurrencyAborted`]; retrying is up to the caller.

use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::try_join_all;
use serde::{Deserialize, Serialize};

use crate::cache::{SessionCache, WriteBatch};
use crate::error::SessionError;
use crate::session::keys::{self, LOGGED_IN_USERS_KEY};
use crate::session::precondition::Precondition;
use crate::session::scan::ClientPages;
use crate::session::token::{self, TokenPair};
use crate::session::transaction::Watching;

/// Default page-size hint for client-binding scans.
const DEFAULT_SCAN_COUNT: usize = 10;

/// User attached to a main session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionUser {
    pub user_id: String,
    pub username: String,
}

/// Where a sub session is attached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubSessionRecord {
    pub ms_id: String,
    pub client_id: String,
}

/// Pairing state engine over an injected store handle.
#[derive(Clone)]
pub struct SessionEngine {
    cache: Arc<dyn SessionCache>,
    scan_count: usize,
}

impl SessionEngine {
    pub fn new(cache: Arc<dyn SessionCache>) -> Self {
        Self {
            cache,
            scan_count: DEFAULT_SCAN_COUNT,
        }
    }

    /// Builder: set the page-size hint used when scanning client bindings.
    pub fn with_scan_count(mut self, count: usize) -> Self {
        self.scan_count = count.max(1);
        self
    }

    pub fn cache(&self) -> &Arc<dyn SessionCache> {
        &self.cache
    }

    // ==================== Mutations ====================

    /// Register `ms_id` as the main session of `user_id`.
    pub async fn attach_main(
        &self,
        user_id: &str,
        ms_id: &str,
        username: &str,
    ) -> Result<(), SessionError> {
        keys::validate_id("user", user_id)?;
        let ms_key = keys::main_user_key(ms_id)?;
        let cache = self.cache.as_ref();

        let watched = [ms_key.clone(), LOGGED_IN_USERS_KEY.to_string()];
        let tx = Watching::begin(cache, "attach_main", &watched).await?;
        let tx = tx
            .validate(vec![
                Precondition::lacks(
                    cache.exists(&ms_key),
                    SessionError::MainSessionAlreadyExists {
                        ms_id: ms_id.to_string(),
                    },
                ),
                Precondition::lacks(
                    cache.is_member(LOGGED_IN_USERS_KEY, user_id),
                    SessionError::UserAlreadyLoggedIn {
                        user_id: user_id.to_string(),
                    },
                ),
            ])
            .await?;

        tx.commit(
            WriteBatch::new()
                .hash_set(
                    ms_key.as_str(),
                    vec![(keys::FIELD_USER_ID, user_id), (keys::FIELD_USERNAME, username)],
                )
                .set_add(LOGGED_IN_USERS_KEY, user_id),
        )
        .await?;

        tracing::info!(ms_id, user_id, "Main session attached");
        Ok(())
    }

    /// Attach sub session `ss_id` for `client_id` under main session `ms_id`.
    pub async fn attach_sub(
        &self,
        ms_id: &str,
        ss_id: &str,
        client_id: &str,
    ) -> Result<(), SessionError> {
        let ms_key = keys::main_user_key(ms_id)?;
        let ss_key = keys::sub_session_key(ss_id)?;
        let binding_key = keys::client_binding_key(ms_id, client_id)?;
        let cache = self.cache.as_ref();

        let watched = [ms_key.clone(), ss_key.clone(), binding_key.clone()];
        let tx = Watching::begin(cache, "attach_sub", &watched).await?;
        let tx = tx
            .validate(vec![
                Precondition::holds(
                    cache.exists(&ms_key),
                    SessionError::MainSessionNotRegistered {
                        ms_id: ms_id.to_string(),
                    },
                ),
                Precondition::lacks(
                    cache.exists(&ss_key),
                    SessionError::SubSessionAlreadyExists {
                        ss_id: ss_id.to_string(),
                    },
                ),
                Precondition::lacks(
                    cache.exists(&binding_key),
                    SessionError::ClientAlreadyRegistered {
                        ms_id: ms_id.to_string(),
                        client_id: client_id.to_string(),
                    },
                ),
            ])
            .await?;

        tx.commit(
            WriteBatch::new().set(binding_key.as_str(), ss_id).hash_set(
                ss_key.as_str(),
                vec![(keys::FIELD_MAIN_SESSION, ms_id), (keys::FIELD_CLIENT, client_id)],
            ),
        )
        .await?;

        tracing::info!(ms_id, ss_id, client_id, "Sub session attached");
        Ok(())
    }

    /// Store tokens on `ss_id`. A `None` refresh token keeps the stored one.
    pub async fn set_token(
        &self,
        ss_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), SessionError> {
        let ss_key = keys::sub_session_key(ss_id)?;
        let cache = self.cache.as_ref();

        let tx = Watching::begin(cache, "set_token", std::slice::from_ref(&ss_key)).await?;
        let tx = tx
            .validate(vec![Precondition::holds(
                cache.exists(&ss_key),
                SessionError::SubSessionNotRegistered {
                    ss_id: ss_id.to_string(),
                },
            )])
            .await?;

        let mut fields = vec![(keys::FIELD_ACCESS_TOKEN, access_token)];
        if let Some(refresh) = refresh_token {
            fields.push((keys::FIELD_REFRESH_TOKEN, refresh));
        }
        tx.commit(WriteBatch::new().hash_set(ss_key.as_str(), fields))
            .await?;

        tracing::debug!(ss_id, refreshed = refresh_token.is_some(), "Token pair stored");
        Ok(())
    }

    /// Remove sub session `ss_id` together with its client binding.
    pub async fn detach_sub(&self, ss_id: &str) -> Result<(), SessionError> {
        let ss_key = keys::sub_session_key(ss_id)?;
        let cache = self.cache.as_ref();

        let tx = Watching::begin(cache, "detach_sub", std::slice::from_ref(&ss_key)).await?;

        // The record's own fields locate the binding; a missing record is
        // the precondition failure.
        let parent = match cache
            .hash_get(&ss_key, &[keys::FIELD_MAIN_SESSION, keys::FIELD_CLIENT])
            .await
        {
            Ok(fields) => match fields.as_slice() {
                [Some(ms_id), Some(client_id)] => Some((ms_id.clone(), client_id.clone())),
                _ => None,
            },
            Err(e) => return Err(tx.fail(e.into()).await),
        };
        let Some((ms_id, client_id)) = parent else {
            return Err(tx
                .fail(SessionError::SubSessionNotRegistered {
                    ss_id: ss_id.to_string(),
                })
                .await);
        };
        let binding_key = match keys::client_binding_key(&ms_id, &client_id) {
            Ok(key) => key,
            Err(e) => return Err(tx.fail(e).await),
        };

        tx.skip_validation()
            .commit(WriteBatch::new().delete(ss_key).delete(binding_key))
            .await?;

        tracing::info!(ss_id, ms_id = %ms_id, client_id = %client_id, "Sub session detached");
        Ok(())
    }

    /// Remove main session `ms_id`, its logged-in mark, and every sub
    /// session bound to it.
    ///
    /// Bindings are enumerated before the commit and folded into one batch.
    /// A binding created after the enumeration survives; its own detach will
    /// later find nothing to remove.
    pub async fn detach_main(&self, ms_id: &str) -> Result<(), SessionError> {
        let ms_key = keys::main_user_key(ms_id)?;
        let cache = self.cache.as_ref();

        let tx = Watching::begin(cache, "detach_main", std::slice::from_ref(&ms_key)).await?;

        let user = cache.hash_get(&ms_key, &[keys::FIELD_USER_ID]);
        let bindings = self.resolve_bindings(ms_id);
        let (user_id, bindings) = match futures::try_join!(
            async { user.await.map_err(SessionError::from) },
            bindings
        ) {
            Ok((mut user, bindings)) => (user.pop().flatten(), bindings),
            Err(e) => return Err(tx.fail(e).await),
        };

        let mut batch = WriteBatch::new().delete(ms_key.as_str());
        match &user_id {
            Some(user_id) => batch = batch.set_remove(LOGGED_IN_USERS_KEY, user_id.as_str()),
            None => tracing::debug!(ms_id, "Main session had no user record"),
        }
        for (client_id, binding_key, ss_id) in &bindings {
            if let Some(ss_id) = ss_id {
                match keys::sub_session_key(ss_id) {
                    Ok(ss_key) => batch = batch.delete(ss_key),
                    Err(e) => {
                        tracing::warn!(ms_id, client_id = %client_id, error = %e, "Skipping malformed sub session id");
                    }
                }
            }
            batch = batch.delete(binding_key.as_str());
        }

        tx.skip_validation().commit(batch).await?;

        tracing::info!(
            ms_id,
            user_id = user_id.as_deref().unwrap_or("-"),
            sub_sessions = bindings.len(),
            "Main session detached"
        );
        Ok(())
    }

    /// Enumerate bindings under `ms_id` and resolve each to its sub session
    /// id concurrently. Returns `(client_id, binding_key, ss_id)`.
    async fn resolve_bindings(
        &self,
        ms_id: &str,
    ) -> Result<Vec<(String, String, Option<String>)>, SessionError> {
        let clients = self.list_client_bindings(ms_id).await?;
        try_join_all(clients.into_iter().map(|client_id| async move {
            let binding_key = keys::client_binding_key(ms_id, &client_id)?;
            let ss_id = self.cache.get(&binding_key).await?;
            Ok::<_, SessionError>((client_id, binding_key, ss_id))
        }))
        .await
    }

    /// Alias of [`set_token`](Self::set_token) for token-cache callers.
    pub async fn set_token_pair(
        &self,
        ss_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), SessionError> {
        self.set_token(ss_id, access_token, refresh_token).await
    }

    // ==================== Reads ====================

    /// User attached to `ms_id`, if the main session exists.
    pub async fn get_user(&self, ms_id: &str) -> Result<Option<SessionUser>, SessionError> {
        let key = keys::main_user_key(ms_id)?;
        let fields = self
            .cache
            .hash_get(&key, &[keys::FIELD_USER_ID, keys::FIELD_USERNAME])
            .await?;
        let mut fields = fields.into_iter();
        Ok(match (fields.next().flatten(), fields.next().flatten()) {
            (Some(user_id), username) => Some(SessionUser {
                user_id,
                username: username.unwrap_or_default(),
            }),
            (None, _) => None,
        })
    }

    /// Parent main session of `ss_id`.
    pub async fn get_main_session(&self, ss_id: &str) -> Result<Option<String>, SessionError> {
        let key = keys::sub_session_key(ss_id)?;
        let mut fields = self
            .cache
            .hash_get(&key, &[keys::FIELD_MAIN_SESSION])
            .await?;
        Ok(fields.pop().flatten())
    }

    /// Parent and client of `ss_id`, if the sub session exists.
    pub async fn get_sub_session_record(
        &self,
        ss_id: &str,
    ) -> Result<Option<SubSessionRecord>, SessionError> {
        let key = keys::sub_session_key(ss_id)?;
        let fields = self
            .cache
            .hash_get(&key, &[keys::FIELD_MAIN_SESSION, keys::FIELD_CLIENT])
            .await?;
        let mut fields = fields.into_iter();
        Ok(match (fields.next().flatten(), fields.next().flatten()) {
            (Some(ms_id), Some(client_id)) => Some(SubSessionRecord { ms_id, client_id }),
            _ => None,
        })
    }

    /// Sub session bound to `(ms_id, client_id)`.
    pub async fn get_sub_session(
        &self,
        ms_id: &str,
        client_id: &str,
    ) -> Result<Option<String>, SessionError> {
        let key = keys::client_binding_key(ms_id, client_id)?;
        Ok(self.cache.get(&key).await?)
    }

    /// Client ids with a binding under `ms_id`.
    pub async fn list_client_bindings(&self, ms_id: &str) -> Result<BTreeSet<String>, SessionError> {
        self.client_pages(ms_id)?.collect().await
    }

    /// Page-at-a-time view of the bindings under `ms_id`.
    pub fn client_pages(&self, ms_id: &str) -> Result<ClientPages, SessionError> {
        ClientPages::new(Arc::clone(&self.cache), ms_id, self.scan_count)
    }

    /// Cached tokens of `ss_id`.
    pub async fn get_token_pair(&self, ss_id: &str) -> Result<TokenPair, SessionError> {
        token::get_token_pair(self.cache.as_ref(), ss_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    fn engine() -> SessionEngine {
        SessionEngine::new(Arc::new(MemoryCache::new())).with_scan_count(2)
    }

    #[tokio::test]
    async fn test_attach_main_records_user() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();

        let user = engine.get_user("ms1").await.unwrap().unwrap();
        assert_eq!(user.user_id, "u1");
        assert_eq!(user.username, "alice");
        assert!(engine.cache().is_member(LOGGED_IN_USERS_KEY, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_attach_main_twice_same_session() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        let err = engine.attach_main("u2", "ms1", "bob").await.unwrap_err();
        assert!(matches!(err, SessionError::MainSessionAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_attach_main_user_already_logged_in() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        let err = engine.attach_main("u1", "ms2", "alice").await.unwrap_err();
        assert!(matches!(err, SessionError::UserAlreadyLoggedIn { ref user_id } if user_id == "u1"));
        assert!(engine.get_user("ms2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attach_sub_requires_main() {
        let engine = engine();
        let err = engine.attach_sub("ms1", "ss1", "c1").await.unwrap_err();
        assert!(matches!(err, SessionError::MainSessionNotRegistered { .. }));
        assert!(engine.get_main_session("ss1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_attach_sub_duplicate_sub_session() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.attach_sub("ms1", "ss1", "c1").await.unwrap();
        let err = engine.attach_sub("ms1", "ss1", "c2").await.unwrap_err();
        assert!(matches!(err, SessionError::SubSessionAlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_attach_sub_duplicate_client() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.attach_sub("ms1", "ss1", "c1").await.unwrap();
        let err = engine.attach_sub("ms1", "ss2", "c1").await.unwrap_err();
        assert!(matches!(err, SessionError::ClientAlreadyRegistered { .. }));
        assert!(engine.get_main_session("ss2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sub_session_record() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.attach_sub("ms1", "ss1", "c1").await.unwrap();

        let record = engine.get_sub_session_record("ss1").await.unwrap().unwrap();
        assert_eq!(record.ms_id, "ms1");
        assert_eq!(record.client_id, "c1");
        assert_eq!(engine.get_sub_session_record("ss2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_token_requires_sub_session() {
        let engine = engine();
        let err = engine.set_token("ss1", "at", None).await.unwrap_err();
        assert!(matches!(err, SessionError::SubSessionNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_set_token_keeps_refresh_when_absent() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.attach_sub("ms1", "ss1", "c1").await.unwrap();

        assert_eq!(engine.get_token_pair("ss1").await.unwrap(), TokenPair::default());
        engine.set_token_pair("ss1", "at", Some("rt")).await.unwrap();
        engine.set_token_pair("ss1", "at2", None).await.unwrap();

        let pair = engine.get_token_pair("ss1").await.unwrap();
        assert_eq!(pair.access.as_deref(), Some("at2"));
        assert_eq!(pair.refresh.as_deref(), Some("rt"));
        assert_eq!(engine.get_main_session("ss1").await.unwrap().as_deref(), Some("ms1"));
    }

    #[tokio::test]
    async fn test_detach_sub_removes_binding() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.attach_sub("ms1", "ss1", "c1").await.unwrap();
        engine.attach_sub("ms1", "ss2", "c2").await.unwrap();

        engine.detach_sub("ss1").await.unwrap();

        assert!(engine.get_main_session("ss1").await.unwrap().is_none());
        assert!(engine.get_sub_session("ms1", "c1").await.unwrap().is_none());
        let clients = engine.list_client_bindings("ms1").await.unwrap();
        assert_eq!(clients, BTreeSet::from(["c2".to_string()]));
    }

    #[tokio::test]
    async fn test_detach_unknown_sub_session() {
        let engine = engine();
        let err = engine.detach_sub("ghost").await.unwrap_err();
        assert!(matches!(err, SessionError::SubSessionNotRegistered { .. }));
    }

    #[tokio::test]
    async fn test_detach_main_cascades_across_pages() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        for i in 0..7 {
            engine
                .attach_sub("ms1", &format!("ss{i}"), &format!("c{i}"))
                .await
                .unwrap();
        }

        engine.detach_main("ms1").await.unwrap();

        assert!(engine.get_user("ms1").await.unwrap().is_none());
        for i in 0..7 {
            assert!(engine.get_main_session(&format!("ss{i}")).await.unwrap().is_none());
        }
        assert!(engine.list_client_bindings("ms1").await.unwrap().is_empty());
        assert!(!engine.cache().is_member(LOGGED_IN_USERS_KEY, "u1").await.unwrap());
    }

    #[tokio::test]
    async fn test_detach_main_frees_user_for_new_session() {
        let engine = engine();
        engine.attach_main("u1", "ms1", "alice").await.unwrap();
        engine.detach_main("ms1").await.unwrap();
        engine.attach_main("u1", "ms2", "alice").await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_missing_main_is_noop() {
        let engine = engine();
        engine.detach_main("never-existed").await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_identifier_rejected_before_store() {
        let engine = engine();
        let err = engine.attach_sub("ms1", "ss1", "*").await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidIdentifier { .. }));
    }
}
