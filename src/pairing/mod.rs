//! Device pairing on top of the session engine.
//!
//! A main device connects with a verified token and gets a main session.
//! Sub devices the user has trusted join that main session, prove the
//! pairing through a custom challenge and receive their own tokens.
//! Messages are relayed between the two sides through the push channel.
//!
//! ```text
//! connect ──► authorize_main / authorize_sub ──► connect_main / connect_sub
//!                                                   │ (retry_on_abort)
//!                                                   ▼
//!                                             SessionEngine
//! ```

mod collaborators;
pub mod jwt;
mod retry;
mod service;

pub use collaborators::{
    ChallengeAnswer, IdentityProvider, IssuedTokens, MemoryTrustStore, PushDelivery, TrustStore,
    VerifiedIdentity,
};
pub use retry::{MetricsSnapshot, RetryConfig, TransactionMetrics, retry_on_abort};
pub use service::PairingService;
