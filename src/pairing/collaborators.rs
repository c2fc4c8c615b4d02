//! Interfaces to the services around the pairing core.
//!
//! The identity provider, the durable trust store and the push channel are
//! managed services. Only their call boundary is modelled here, plus an
//! in-memory trust store for tests and single-node setups.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{DeliveryError, IdentityError, TrustStoreError};

/// Identity established by verifying a main-session token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    pub user_id: String,
    pub username: String,
    /// Client the token was issued to.
    pub client_id: String,
}

/// Answer a sub device presents in the custom challenge round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeAnswer {
    pub ms_id: String,
    pub ss_id: String,
}

/// Tokens minted by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
}

impl fmt::Debug for IssuedTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedTokens").finish_non_exhaustive()
    }
}

/// Durable record of which clients each user has approved.
#[async_trait]
pub trait TrustStore: Send + Sync {
    async fn is_trusted(&self, user_id: &str, client_id: &str) -> Result<bool, TrustStoreError>;

    /// Record that `user_id` trusts `client_id`. Idempotent.
    async fn add_trusted_client(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<(), TrustStoreError>;
}

/// Credential verification and token minting.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Verify a main device's access token.
    async fn verify_main_token(&self, token: &str) -> Result<VerifiedIdentity, IdentityError>;

    /// Run the custom challenge flow for `username` on behalf of `client_id`.
    async fn issue_tokens(
        &self,
        client_id: &str,
        username: &str,
        answer: &ChallengeAnswer,
    ) -> Result<IssuedTokens, IdentityError>;

    /// Exchange a refresh token for a new access token.
    async fn refresh_access_token(
        &self,
        client_id: &str,
        refresh_token: &str,
    ) -> Result<String, IdentityError>;
}

/// Push channel to live connections.
#[async_trait]
pub trait PushDelivery: Send + Sync {
    async fn deliver(&self, connection_id: &str, payload: &str) -> Result<(), DeliveryError>;
}

/// In-memory [`TrustStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryTrustStore {
    /// Trusted client ids indexed by user id.
    trusted: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl MemoryTrustStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clients trusted by `user_id`, sorted.
    pub async fn trusted_clients(&self, user_id: &str) -> Vec<String> {
        let mut clients: Vec<String> = self
            .trusted
            .read()
            .await
            .get(user_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        clients.sort();
        clients
    }
}

#[async_trait]
impl TrustStore for MemoryTrustStore {
    async fn is_trusted(&self, user_id: &str, client_id: &str) -> Result<bool, TrustStoreError> {
        Ok(self
            .trusted
            .read()
            .await
            .get(user_id)
            .is_some_and(|clients| clients.contains(client_id)))
    }

    async fn add_trusted_client(
        &self,
        user_id: &str,
        client_id: &str,
    ) -> Result<(), TrustStoreError> {
        self.trusted
            .write()
            .await
            .entry(user_id.to_string())
            .or_default()
            .insert(client_id.to_string());
        Ok(())
    }
}
