//! Connection-level pairing operations.
//!
//! This is what the request dispatcher calls on connect, disconnect and
//! message events. It combines the session engine with the trust store,
//! identity provider and push channel, and applies the abort retry policy
//! to every engine mutation.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::error::{PairingError, SessionError};
use crate::pairing::collaborators::{
    ChallengeAnswer, IdentityProvider, PushDelivery, TrustStore, VerifiedIdentity,
};
use crate::pairing::jwt;
use crate::pairing::retry::{MetricsSnapshot, RetryConfig, TransactionMetrics, retry_on_abort};
use crate::session::SessionEngine;

/// Pairing operations over a [`SessionEngine`] and its collaborators.
#[derive(Clone)]
pub struct PairingService {
    engine: SessionEngine,
    trust: Arc<dyn TrustStore>,
    identity: Arc<dyn IdentityProvider>,
    delivery: Arc<dyn PushDelivery>,
    retry: RetryConfig,
    metrics: Arc<TransactionMetrics>,
}

impl PairingService {
    pub fn new(
        engine: SessionEngine,
        trust: Arc<dyn TrustStore>,
        identity: Arc<dyn IdentityProvider>,
        delivery: Arc<dyn PushDelivery>,
    ) -> Self {
        Self {
            engine,
            trust,
            identity,
            delivery,
            retry: RetryConfig::default(),
            metrics: Arc::new(TransactionMetrics::new()),
        }
    }

    /// Builder: set the abort retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn engine(&self) -> &SessionEngine {
        &self.engine
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    // ==================== Authorization ====================

    /// Verify a main device's token.
    pub async fn authorize_main(&self, token: &str) -> Result<VerifiedIdentity, PairingError> {
        self.identity.verify_main_token(token).await.map_err(|e| {
            tracing::debug!(error = %e, "Main session token rejected");
            PairingError::Unauthorized(e.to_string())
        })
    }

    /// Check that a sub device for `client_id` may join `ms_id`; returns the
    /// owning user id.
    pub async fn authorize_sub(&self, ms_id: &str, client_id: &str) -> Result<String, PairingError> {
        let user = self.engine.get_user(ms_id).await?.ok_or_else(|| {
            SessionError::MainSessionNotRegistered {
                ms_id: ms_id.to_string(),
            }
        })?;

        if !self.trust.is_trusted(&user.user_id, client_id).await? {
            tracing::debug!(ms_id, client_id, user_id = %user.user_id, "Client not trusted");
            return Err(PairingError::ClientNotTrusted {
                user_id: user.user_id,
                client_id: client_id.to_string(),
            });
        }
        Ok(user.user_id)
    }

    /// Check a custom-challenge answer: `answer.ss_id` must be the sub
    /// session bound to `client_id` under `answer.ms_id`, and that main
    /// session must belong to `user_id`.
    pub async fn verify_challenge_answer(
        &self,
        user_id: &str,
        client_id: &str,
        answer: &ChallengeAnswer,
    ) -> Result<bool, PairingError> {
        let (bound_ss, owner) = tokio::try_join!(
            self.engine.get_sub_session(&answer.ms_id, client_id),
            self.engine.get_user(&answer.ms_id),
        )?;
        let correct = bound_ss.as_deref() == Some(answer.ss_id.as_str())
            && owner.is_some_and(|u| u.user_id == user_id);
        if !correct {
            tracing::debug!(user_id, client_id, ms_id = %answer.ms_id, "Challenge answer rejected");
        }
        Ok(correct)
    }

    /// Approve `client_id` for `user_id` in the trust store.
    pub async fn trust_client(&self, user_id: &str, client_id: &str) -> Result<(), PairingError> {
        self.trust.add_trusted_client(user_id, client_id).await?;
        tracing::info!(user_id, client_id, "Client trusted");
        Ok(())
    }

    // ==================== Connection lifecycle ====================

    pub async fn connect_main(
        &self,
        user_id: &str,
        ms_id: &str,
        username: &str,
    ) -> Result<(), PairingError> {
        retry_on_abort(&self.retry, &self.metrics, "attach_main", || {
            self.engine.attach_main(user_id, ms_id, username)
        })
        .await?;
        Ok(())
    }

    pub async fn connect_sub(
        &self,
        ms_id: &str,
        ss_id: &str,
        client_id: &str,
    ) -> Result<(), PairingError> {
        retry_on_abort(&self.retry, &self.metrics, "attach_sub", || {
            self.engine.attach_sub(ms_id, ss_id, client_id)
        })
        .await?;
        Ok(())
    }

    /// Tear down the main session and every sub session attached to it.
    ///
    /// Sub connections stay open; their own disconnect later finds nothing
    /// to remove.
    pub async fn disconnect_main(&self, ms_id: &str) -> Result<(), PairingError> {
        retry_on_abort(&self.retry, &self.metrics, "detach_main", || {
            self.engine.detach_main(ms_id)
        })
        .await?;
        Ok(())
    }

    /// Detach a sub session. Already-removed sessions are not an error.
    pub async fn disconnect_sub(&self, ss_id: &str) -> Result<(), PairingError> {
        let result = retry_on_abort(&self.retry, &self.metrics, "detach_sub", || {
            self.engine.detach_sub(ss_id)
        })
        .await;
        match result {
            Ok(()) => Ok(()),
            Err(SessionError::SubSessionNotRegistered { .. }) => {
                tracing::debug!(ss_id, "Sub session already gone on disconnect");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    // ==================== Messaging ====================

    /// Tell the main device its own session id.
    pub async fn announce_main_session(&self, ms_id: &str) -> Result<(), PairingError> {
        let payload = serde_json::to_string(&json!({ "msId": ms_id }))?;
        self.delivery.deliver(ms_id, &payload).await?;
        Ok(())
    }

    /// Forward `payload` from the main device to one of its sub sessions.
    pub async fn main_send(&self, ms_id: &str, ss_id: &str, payload: &str) -> Result<(), PairingError> {
        let parent = self.engine.get_main_session(ss_id).await?;
        if parent.as_deref() != Some(ms_id) {
            return Err(SessionError::SubSessionNotRegistered {
                ss_id: ss_id.to_string(),
            }
            .into());
        }
        self.delivery.deliver(ss_id, payload).await?;
        Ok(())
    }

    /// Forward `payload` from a sub device to its main session.
    pub async fn sub_send(&self, ss_id: &str, payload: &str) -> Result<(), PairingError> {
        let ms_id = self.engine.get_main_session(ss_id).await?.ok_or_else(|| {
            SessionError::SubSessionNotRegistered {
                ss_id: ss_id.to_string(),
            }
        })?;
        self.delivery.deliver(&ms_id, payload).await?;
        Ok(())
    }

    // ==================== Tokens ====================

    /// Access token for sub session `ss_id`, minting or refreshing as needed.
    ///
    /// - no cached token: run the custom challenge and store both tokens
    /// - cached but expired: refresh and store only the access token
    pub async fn access_token(
        &self,
        client_id: &str,
        ms_id: &str,
        ss_id: &str,
    ) -> Result<String, PairingError> {
        let cached = self.engine.get_token_pair(ss_id).await?;

        match cached.access {
            None => {
                let user = self.engine.get_user(ms_id).await?.ok_or_else(|| {
                    SessionError::MainSessionNotRegistered {
                        ms_id: ms_id.to_string(),
                    }
                })?;
                let answer = ChallengeAnswer {
                    ms_id: ms_id.to_string(),
                    ss_id: ss_id.to_string(),
                };
                let issued = self
                    .identity
                    .issue_tokens(client_id, &user.username, &answer)
                    .await?;
                self.store_tokens(ss_id, &issued.access_token, Some(&issued.refresh_token))
                    .await?;
                tracing::info!(ss_id, client_id, "Issued tokens for sub session");
                Ok(issued.access_token)
            }
            Some(access) if jwt::is_expired(&access, Utc::now()) => {
                let refresh = cached
                    .refresh
                    .ok_or_else(|| PairingError::MissingRefreshToken {
                        ss_id: ss_id.to_string(),
                    })?;
                let fresh = self
                    .identity
                    .refresh_access_token(client_id, &refresh)
                    .await?;
                self.store_tokens(ss_id, &fresh, None).await?;
                tracing::debug!(ss_id, client_id, "Refreshed access token");
                Ok(fresh)
            }
            Some(access) => Ok(access),
        }
    }

    async fn store_tokens(
        &self,
        ss_id: &str,
        access: &str,
        refresh: Option<&str>,
    ) -> Result<(), SessionError> {
        retry_on_abort(&self.retry, &self.metrics, "set_token", || {
            self.engine.set_token_pair(ss_id, access, refresh)
        })
        .await
    }
}
