//! Mapping between session entities and store keys.
//!
//! ```text
//! mainSession:{msId}:user                  hash  userId, username
//! mainSession:{msId}:subSession:{clientId} str   ssId
//! subSession:{ssId}                        hash  mainSession, client,
//!                                                accessToken, refreshToken
//! loggedInUsers                            set   userId
//! ```
//!
//! Identifiers are validated so that every key decodes back to the exact
//! identifiers it was built from.

use crate::error::SessionError;

/// Set of user ids that currently own a main session.
pub const LOGGED_IN_USERS_KEY: &str = "loggedInUsers";

pub const FIELD_MAIN_SESSION: &str = "mainSession";
pub const FIELD_CLIENT: &str = "client";
pub const FIELD_ACCESS_TOKEN: &str = "accessToken";
pub const FIELD_REFRESH_TOKEN: &str = "refreshToken";
pub const FIELD_USER_ID: &str = "userId";
pub const FIELD_USERNAME: &str = "username";

const MAIN_PREFIX: &str = "mainSession";
const SUB_SEGMENT: &str = "subSession";
const USER_SUFFIX: &str = "user";

/// Check that `value` can be embedded as one key segment.
pub fn validate_id(field: &'static str, value: &str) -> Result<(), SessionError> {
    let reason = if value.is_empty() {
        Some("must not be empty")
    } else if value.contains(':') {
        Some("must not contain ':'")
    } else if value.contains(['*', '?', '[', ']', '\\']) {
        Some("must not contain glob metacharacters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(SessionError::InvalidIdentifier {
            field,
            value: value.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Key of the main session's user record.
pub fn main_user_key(ms_id: &str) -> Result<String, SessionError> {
    validate_id("main session", ms_id)?;
    Ok(format!("{MAIN_PREFIX}:{ms_id}:{USER_SUFFIX}"))
}

/// Key of the binding from `(ms_id, client_id)` to a sub session id.
pub fn client_binding_key(ms_id: &str, client_id: &str) -> Result<String, SessionError> {
    validate_id("main session", ms_id)?;
    validate_id("client", client_id)?;
    Ok(format!("{MAIN_PREFIX}:{ms_id}:{SUB_SEGMENT}:{client_id}"))
}

/// Scan pattern matching every client binding under `ms_id`.
pub fn client_binding_pattern(ms_id: &str) -> Result<String, SessionError> {
    validate_id("main session", ms_id)?;
    Ok(format!("{MAIN_PREFIX}:{ms_id}:{SUB_SEGMENT}:*"))
}

/// Key of the sub session record.
pub fn sub_session_key(ss_id: &str) -> Result<String, SessionError> {
    validate_id("sub session", ss_id)?;
    Ok(format!("{SUB_SEGMENT}:{ss_id}"))
}

/// Recover the client id from a client-binding key.
///
/// Returns `None` for anything that is not a well-formed binding key.
pub fn parse_client_binding_key(key: &str) -> Option<&str> {
    let mut parts = key.split(':');
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(MAIN_PREFIX), Some(ms_id), Some(SUB_SEGMENT), Some(client_id), None)
            if !ms_id.is_empty() && !client_id.is_empty() =>
        {
            Some(client_id)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formats() {
        assert_eq!(main_user_key("ms1").unwrap(), "mainSession:ms1:user");
        assert_eq!(
            client_binding_key("ms1", "client1").unwrap(),
            "mainSession:ms1:subSession:client1"
        );
        assert_eq!(sub_session_key("ss1").unwrap(), "subSession:ss1");
        assert_eq!(
            client_binding_pattern("ms1").unwrap(),
            "mainSession:ms1:subSession:*"
        );
    }

    #[test]
    fn test_binding_key_decodes_to_client() {
        let key = client_binding_key("conn-AbC=", "7f3kq2").unwrap();
        assert_eq!(parse_client_binding_key(&key), Some("7f3kq2"));
    }

    #[test]
    fn test_parse_rejects_other_keys() {
        assert_eq!(parse_client_binding_key("mainSession:ms1:user"), None);
        assert_eq!(parse_client_binding_key("subSession:ss1"), None);
        assert_eq!(
            parse_client_binding_key("mainSession:ms1:subSession:c:extra"),
            None
        );
        assert_eq!(parse_client_binding_key("mainSession::subSession:c"), None);
    }

    #[test]
    fn test_wildcard_rejected_for_point_keys() {
        let err = client_binding_key("ms1", "*").unwrap_err();
        assert!(matches!(err, SessionError::InvalidIdentifier { field: "client", .. }));
    }

    #[test]
    fn test_separator_and_empty_rejected() {
        assert!(main_user_key("a:b").is_err());
        assert!(sub_session_key("").is_err());
        assert!(client_binding_key("ms1", "c[1]").is_err());
        assert!(client_binding_pattern("ms?").is_err());
    }
}
