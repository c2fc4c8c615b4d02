//! Multi-device session pairing.
//!
//! A user's main device holds a main session; trusted secondary devices
//! attach to it as sub sessions, one per client. All state lives in a
//! shared store and every mutation goes through a watch, validate, commit
//! transaction so concurrent process instances never leave a client
//! binding and its sub session disagreeing.

pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod pairing;
pub mod session;

pub use cache::{MemoryCache, SessionCache, connect_from_config};
pub use config::Config;
pub use error::{Error, PairingError, Result, SessionError};
pub use pairing::PairingService;
pub use session::SessionEngine;
