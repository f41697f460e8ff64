//! Pull session configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How the session relates to the peer's change feed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PullMode {
    /// Catch up with historical changes, then stop.
    #[default]
    OneShot,
    /// Catch up, then keep receiving live changes.
    Continuous,
    /// Serve a peer-initiated push; no subscription, no checkpoint.
    Passive,
}

/// Options for one pull session.
///
/// The fingerprint of the options keys the persisted checkpoint, so two
/// differently-filtered sessions against the same peer never share a resume
/// point.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PullOptions {
    pub mode: PullMode,
    /// Skip deleted revisions during the initial catch-up.
    pub skip_deleted: bool,
    /// Reject plain `changes` advertisements; the peer must propose.
    pub no_incoming_conflicts: bool,
    /// Channel filter (gateway peers).
    pub channels: Vec<String>,
    /// Named server-side filter, with its parameters.
    pub filter: Option<String>,
    pub filter_params: BTreeMap<String, String>,
    /// Restrict the pull to these documents.
    pub doc_ids: Vec<String>,
}

impl PullOptions {
    pub fn active(&self) -> bool {
        self.mode != PullMode::Passive
    }

    pub fn continuous(&self) -> bool {
        self.mode == PullMode::Continuous
    }

    /// Stable hash of the options. Serialization uses sorted maps, so equal
    /// options always fingerprint equally.
    pub fn fingerprint(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        let mut out = String::with_capacity(digest.len() * 2);
        for byte in digest {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}
