//! Access/refresh token pair cached on a sub session.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::SessionCache;
use crate::error::SessionError;
use crate::session::keys;

/// Tokens cached for a sub session. Each half may be absent on its own.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenPair {
    pub access: Option<String>,
    pub refresh: Option<String>,
}

// Token values stay out of logs.
impl fmt::Debug for TokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPair")
            .field("access", &self.access.as_ref().map(|_| "<redacted>"))
            .field("refresh", &self.refresh.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Read the token pair of `ss_id`.
///
/// An unknown sub session reads as a pair with both halves absent.
pub async fn get_token_pair(cache: &dyn SessionCache, ss_id: &str) -> Result<TokenPair, SessionError> {
    let key = keys::sub_session_key(ss_id)?;
    let mut values = cache
        .hash_get(&key, &[keys::FIELD_ACCESS_TOKEN, keys::FIELD_REFRESH_TOKEN])
        .await?
        .into_iter();
    Ok(TokenPair {
        access: values.next().flatten(),
        refresh: values.next().flatten(),
    })
}
