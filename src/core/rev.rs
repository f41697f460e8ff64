//! Revision records shared across the pull pipeline.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::error::ErrorPayload;
use super::sequence::RemoteSequence;

/// Document identifier, as advertised by the peer.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(Bytes);

impl DocId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl fmt::Display for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for DocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DocId({self})")
    }
}

/// Revision identifier within a document's revision tree.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevId(Bytes);

impl RevId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for RevId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RevId({self})")
    }
}

/// Content digest naming a blob referenced from a revision body.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobDigest(String);

impl BlobDigest {
    pub fn new(digest: impl Into<String>) -> Self {
        Self(digest.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for BlobDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobDigest({})", self.0)
    }
}

/// Sequence assigned by the local store when a revision is staged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LocalSequence(pub u64);

/// Per-revision flag bits carried through advertisement and insertion.
#[derive(Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RevFlags(u8);

impl RevFlags {
    pub const DELETED: RevFlags = RevFlags(0x01);
    pub const HAS_ATTACHMENTS: RevFlags = RevFlags(0x02);
    pub const CONFLICT: RevFlags = RevFlags(0x04);

    pub fn empty() -> Self {
        Self(0)
    }

    pub fn contains(self, other: RevFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: RevFlags) {
        self.0 |= other.0;
    }

    pub fn deleted(self) -> bool {
        self.contains(Self::DELETED)
    }
}

impl fmt::Debug for RevFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(RevFlags::DELETED) {
            names.push("deleted");
        }
        if self.contains(RevFlags::HAS_ATTACHMENTS) {
            names.push("attachments");
        }
        if self.contains(RevFlags::CONFLICT) {
            names.push("conflict");
        }
        write!(f, "RevFlags({})", names.join("|"))
    }
}

/// One element of an advertisement batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevDescriptor {
    pub sequence: RemoteSequence,
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub flags: RevFlags,
    /// Peer's body-size hint; may be zero.
    pub body_size: u64,
}

/// A downloaded, validated revision awaiting insertion.
///
/// Owned by exactly one `IncomingRev` until handed to the inserter, which
/// owns it until the enclosing transaction commits.
#[derive(Clone, Debug, Default)]
pub struct RevToInsert {
    pub doc_id: DocId,
    pub rev_id: RevId,
    /// Ancestor revision ids, nearest first.
    pub history: Vec<RevId>,
    pub body: Bytes,
    pub flags: RevFlags,
    pub remote_sequence: RemoteSequence,
    /// Insert must fail rather than create a conflicting branch.
    pub no_conflicts: bool,
}

impl RevToInsert {
    pub fn deleted(&self) -> bool {
        self.flags.deleted()
    }

    /// Release the body buffer once the store has copied it.
    pub fn trim(&mut self) {
        self.body = Bytes::new();
        self.history = Vec::new();
    }
}

/// Direction of the replication that produced a notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Pulling,
    Pushing,
}

/// Terminal notification record for one replicated revision.
///
/// Exactly one of these reaches the delegate for every revision that entered
/// the pipeline.
#[derive(Clone, Debug)]
pub struct ReplicatedRev {
    pub doc_id: DocId,
    pub rev_id: RevId,
    pub flags: RevFlags,
    /// Local store sequence, when the revision was committed.
    pub sequence: Option<LocalSequence>,
    pub error: Option<ErrorPayload>,
    pub error_is_transient: bool,
    pub direction: Direction,
}

impl ReplicatedRev {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}
