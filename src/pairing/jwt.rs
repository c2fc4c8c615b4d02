//! Reading the expiry claim of a cached access token.
//!
//! Signatures are not checked here; the token was minted by the identity
//! provider and only its `exp` claim decides whether to refresh.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Utc};

/// `exp` claim of a compact JWT, in seconds since the epoch.
pub fn expires_at(token: &str) -> Option<i64> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next(), segments.next()) {
        (Some(_header), Some(payload), Some(_signature)) => payload,
        _ => return None,
    };
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp")?.as_i64()
}

/// Whether `token` is expired at `now`. Tokens without a readable `exp`
/// count as expired.
pub fn is_expired(token: &str, now: DateTime<Utc>) -> bool {
    expires_at(token).is_none_or(|exp| exp <= now.timestamp())
}

#[cfg(test)]
pub(crate) fn token_with_exp(exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"RS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u1","exp":{exp}}}"#));
    format!("{header}.{payload}.c2lnbmF0dXJl")
}
