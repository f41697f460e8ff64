//! Resumable checkpoint records.

use serde::{Deserialize, Serialize};

use super::sequence::RemoteSequence;

/// Persisted resume point for one pull configuration.
///
/// `last_sequence` is the `since` watermark of the pending set; resuming from
/// it never skips a revision that failed transiently. The fingerprint pins
/// the record to the options that produced it, so a config change starts a
/// fresh checkpoint instead of resuming a mismatched one.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_sequence: RemoteSequence,
    pub config_fingerprint: String,
}

impl Checkpoint {
    pub fn storage_key(config_fingerprint: &str) -> String {
        format!("checkpoint/pull/{config_fingerprint}")
    }
}
