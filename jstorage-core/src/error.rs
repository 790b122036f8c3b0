//! Error taxonomy shared by every JStorage subsystem.
//!
//! Each variant keeps the numeric hint carried over from the source
//! implementation so operators correlating against historical logs see the
//! same codes. The request-handling layer (out of scope here) is
//! responsible for turning these into transport-level status codes.

use thiserror::Error;

/// Unified error type returned by the storage core, cache, crypto, and
/// notification subsystems.
#[derive(Error, Debug)]
pub enum ErrorKind {
    /// Component still initialising or already shut down.
    #[error("not ready ({hint}): {what}")]
    NotReady { hint: u32, what: String },

    /// Identifier absent at its level (database, table, shard, record, cache entry).
    #[error("not found ({hint}): {what}")]
    NotFound { hint: u32, what: String },

    /// Insert collided with an existing identifier.
    #[error("already exists ({hint}): {what}")]
    AlreadyExists { hint: u32, what: String },

    /// Insert's parent chain does not match the target container.
    #[error("does not fit ({hint}): {what}")]
    DoesNotFit { hint: u32, what: String },

    /// `defaultStructure` check failed for a record.
    #[error("structure mismatch (221): {what}")]
    StructureMismatch { what: String },

    /// `update`/`insert` carried no update token where one was required.
    #[error("no token (242): {what}")]
    NoToken { what: String },

    /// `update` carried a token that no longer matches the pending one.
    #[error("stale token (242): {what}")]
    StaleToken { what: String },

    /// Shard or cache bucket could not load from its backing file.
    #[error("load failed (101): {what}")]
    LoadFailed { what: String },

    /// Shard or cache bucket could not persist to its backing file.
    #[error("unload failed (102): {what}")]
    UnloadFailed { what: String },

    /// The table's index and its shard pool disagree.
    #[error("index divergence: {what}")]
    IndexDivergence { what: String },

    /// Password has not been supplied to the `CryptTool` yet.
    #[error("crypt not ready: {what}")]
    CryptNotReady { what: String },

    /// Decrypt failed (tag mismatch, wrong password, or corrupt file).
    #[error("crypt failed: {what}")]
    CryptFailed { what: String },

    /// Unexpected failure on any path; logged with source, never retried.
    #[error("internal error (0): {what}")]
    Unknown { what: String },
}

impl ErrorKind {
    pub fn not_found(what: impl Into<String>) -> Self {
        ErrorKind::NotFound { hint: 201, what: what.into() }
    }

    pub fn already_exists(what: impl Into<String>) -> Self {
        ErrorKind::AlreadyExists { hint: 211, what: what.into() }
    }

    pub fn not_ready(what: impl Into<String>) -> Self {
        ErrorKind::NotReady { hint: 231, what: what.into() }
    }
}

impl From<std::io::Error> for ErrorKind {
    fn from(e: std::io::Error) -> Self {
        ErrorKind::Unknown { what: format!("io: {e}") }
    }
}

impl From<serde_json::Error> for ErrorKind {
    fn from(e: serde_json::Error) -> Self {
        ErrorKind::Unknown { what: format!("json: {e}") }
    }
}

/// Convenience alias used throughout the storage core.
pub type Result<T> = std::result::Result<T, ErrorKind>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hints_survive_display() {
        let e = ErrorKind::not_found("database blog");
        assert_eq!(e.to_string(), "not found (201): database blog");
    }

    #[test]
    fn io_errors_fold_into_unknown() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let e: ErrorKind = io.into();
        assert!(matches!(e, ErrorKind::Unknown { .. }));
    }
}
