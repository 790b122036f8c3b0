//! Shared types and collaborator contracts for the JStorage storage core.
//!
//! This crate has no knowledge of HTTP, TLS, or command dispatch; those
//! are external collaborators (spec.md §1). What lives here is the vocabulary
//! every other JStorage crate builds on: error kinds, the `Clock`/`Random`/
//! `UserDirectory` ports, mutation events, and process-level settings.

mod config;
mod error;
mod event;
mod ids;
pub mod ports;

pub use config::Settings;
pub use error::{ErrorKind, Result};
pub use event::{MutationEvent, MutationKind};
pub use ids::{new_shard_id, new_update_token};
pub use ports::{Clock, Collaborators, Random, SecureRandom, SystemClock, UserDirectory, UserRef};
