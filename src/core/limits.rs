//! Replication tuning limits (normative defaults).

use serde::{Deserialize, Serialize};

/// Flow-control and batching bounds for one pull session.
///
/// Values are intentionally explicit about their units to avoid confusion.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Advertisement batch size requested via `subChanges`.
    pub changes_batch_size: u16,
    /// Revisions requested but not yet delivered before advertisement intake
    /// pauses.
    pub max_pending_revs: u32,
    /// Revisions concurrently parsing/validating/fetching blobs.
    pub max_active_incoming_revs: u32,
    /// Revisions between admission and terminal notification.
    pub max_unfinished_incoming_revs: u32,

    /// Revisions committed per store transaction.
    pub insert_batch_revs: usize,
    /// How long a partially filled insert batch may wait.
    pub insert_batch_latency_ms: u64,

    /// Worker threads running per-revision processing.
    pub incoming_rev_workers: usize,
    /// Blob fetches in flight per revision.
    pub max_concurrent_blob_fetches: usize,
    /// Largest acceptable `rev` message body.
    pub max_rev_body_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            changes_batch_size: 200,
            max_pending_revs: 100,
            max_active_incoming_revs: 100,
            max_unfinished_incoming_revs: 2_000,

            insert_batch_revs: 25,
            insert_batch_latency_ms: 250,

            incoming_rev_workers: 8,
            max_concurrent_blob_fetches: 4,
            max_rev_body_bytes: 16 * 1024 * 1024,
        }
    }
}
