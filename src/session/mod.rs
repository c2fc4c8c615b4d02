//! Main/sub session state and the transaction protocol that keeps it
//! consistent.
//!
//! ```text
//! SessionEngine ──► keys (codec)
//!      │        ──► Watching ──► precondition::evaluate ──► Validated ──► commit
//!      │        ──► ClientPages (cursor scan)
//!      └──────────► token (token pair reads)
//! ```

pub mod engine;
pub mod keys;
pub mod precondition;
pub mod scan;
pub mod token;
pub mod transaction;

pub use engine::{SessionEngine, SessionUser, SubSessionRecord};
pub use precondition::{Precondition, Verdict};
pub use scan::ClientPages;
pub use token::TokenPair;
pub use transaction::{Validated, Watching};
