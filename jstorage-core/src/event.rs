//! Mutation events published on the notification bus.

use serde::{Deserialize, Serialize};

use crate::ports::UserRef;

/// Kind of change a `MutationEvent` describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
    /// Synthesised every 2 seconds by the notification bus; carries no
    /// database/table and is delivered to every listener unconditionally.
    Heartbeat,
}

/// A single record mutation, immutable once published.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MutationEvent {
    /// Caller that produced the mutation; absent for synthesised events.
    pub origin: Option<UserRef>,
    pub database: Option<String>,
    pub table: Option<String>,
    pub dataset: Option<String>,
    pub data_type: Option<String>,
    pub kind: MutationKind,
    pub timestamp_millis: i64,
    /// Monotonically increasing publication sequence number, used to order
    /// delivery to a single listener (spec.md §5, ordering guarantee 2).
    pub sequence: u64,
}

impl MutationEvent {
    pub fn heartbeat(timestamp_millis: i64, sequence: u64) -> Self {
        Self {
            origin: None,
            database: None,
            table: None,
            dataset: None,
            data_type: None,
            kind: MutationKind::Heartbeat,
            timestamp_millis,
            sequence,
        }
    }
}
