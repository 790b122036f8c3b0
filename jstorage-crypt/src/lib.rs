//! At-rest encryption for JStorage's persisted JSON (spec.md §4.9).
//!
//! `CryptTool` turns a plaintext byte slice into an encoded blob that
//! begins with a fixed magic prefix and can later be decoded back, and
//! nothing else; it has no notion of shards, lines, or files. The shard
//! reader (`jstorage-storage`) is the one that decides, line by line,
//! whether a given line looks encrypted and should be routed through here.
//!
//! The tool starts `Uninitialized`. An operator brings it to `Ready` either
//! by setting a password for the first time (no verifier on disk yet) or by
//! re-entering the password that matches an existing verifier. Every other
//! operation fails with `ErrorKind::CryptNotReady` until that happens.

mod tool;
mod verifier;

pub use tool::{CryptTool, MAGIC};
pub use verifier::{FixedPassword, PasswordSource};
