//! Error types for session pairing.

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Pairing error: {0}")]
    Pairing(#[from] PairingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Backend {backend} is not compiled in; rebuild with feature \"{feature}\"")]
    BackendUnavailable { backend: String, feature: String },
}

/// Errors raised by the shared store adapter.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("Key {key} holds the wrong kind of value for {command}")]
    WrongType { key: String, command: String },

    #[error("Invalid scan pattern {pattern}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

/// Outcome classes of a session operation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A named precondition did not hold; retrying unchanged will fail again.
    Precondition,
    /// The watch set was modified before commit; retry from the top.
    ConcurrencyAborted,
    /// The store itself failed.
    Store,
    /// The caller passed an identifier the key codec cannot encode.
    InvalidInput,
}

/// Errors raised by the session transaction engine.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Main session {ms_id} already exists")]
    MainSessionAlreadyExists { ms_id: String },

    #[error("User {user_id} already has a live main session")]
    UserAlreadyLoggedIn { user_id: String },

    #[error("Main session {ms_id} is not registered")]
    MainSessionNotRegistered { ms_id: String },

    #[error("Sub session {ss_id} already exists")]
    SubSessionAlreadyExists { ss_id: String },

    #[error("Client {client_id} already has a sub session under main session {ms_id}")]
    ClientAlreadyRegistered { ms_id: String, client_id: String },

    #[error("Sub session {ss_id} is not registered")]
    SubSessionNotRegistered { ss_id: String },

    #[error("Transaction aborted: a watched key changed before commit")]
    ConcurrencyAborted,

    #[error("Invalid {field} identifier {value:?}: {reason}")]
    InvalidIdentifier {
        field: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MainSessionAlreadyExists { .. }
            | Self::UserAlreadyLoggedIn { .. }
            | Self::MainSessionNotRegistered { .. }
            | Self::SubSessionAlreadyExists { .. }
            | Self::ClientAlreadyRegistered { .. }
            | Self::SubSessionNotRegistered { .. } => ErrorKind::Precondition,
            Self::ConcurrencyAborted => ErrorKind::ConcurrencyAborted,
            Self::InvalidIdentifier { .. } => ErrorKind::InvalidInput,
            Self::Cache(_) => ErrorKind::Store,
        }
    }

    /// Whether re-running the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::ConcurrencyAborted
    }
}

/// Errors from the trust store collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("Trust store unreachable: {0}")]
    Unavailable(String),

    #[error("Trust store request failed: {0}")]
    RequestFailed(String),
}

/// Errors from the identity provider collaborator.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Token rejected: {0}")]
    InvalidToken(String),

    #[error("Challenge rejected for client {client_id}")]
    ChallengeRejected { client_id: String },

    #[error("Identity provider request failed: {0}")]
    RequestFailed(String),
}

/// Errors from the push delivery collaborator.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Delivery to connection {connection_id} failed: {reason}")]
    DeliveryFailed {
        connection_id: String,
        reason: String,
    },

    #[error("Connection {connection_id} is gone")]
    Gone { connection_id: String },
}

/// Errors raised by the pairing service on top of the engine.
#[derive(Debug, thiserror::Error)]
pub enum PairingError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Client {client_id} is not trusted by user {user_id}")]
    ClientNotTrusted { user_id: String, client_id: String },

    #[error("Sub session {ss_id} has an expired access token and no refresh token")]
    MissingRefreshToken { ss_id: String },

    #[error("Invalid payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Trust(#[from] TrustStoreError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

pub type Result<T> = std::result::Result<T, Error>;
