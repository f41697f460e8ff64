//! Local document store seam.
//!
//! The store itself (revision trees, blob storage, durability) lives in the
//! host engine; the pull pipeline drives it through [`Store`]. Transactions
//! stage revisions and commit as a unit, matching the inserter's batching.

pub mod memory;

use bytes::Bytes;
use thiserror::Error;

use crate::core::{
    BlobDigest, CODE_CONFLICT, CODE_FORBIDDEN, CODE_INTERNAL, CODE_UNAVAILABLE, Checkpoint, DocId,
    ErrorDomain, ErrorPayload, LocalSequence, RevId, RevToInsert,
};
use crate::error::Transience;

pub use memory::MemoryStore;

#[derive(Clone, Debug, Error)]
pub enum StoreError {
    /// Lock contention or a busy writer; retry is expected to succeed.
    #[error("store busy: {0}")]
    Busy(String),
    /// Inserting would create a conflicting branch.
    #[error("conflict inserting {doc_id}@{rev_id}")]
    Conflict { doc_id: DocId, rev_id: RevId },
    /// The store refused the revision (validation, policy).
    #[error("revision rejected: {0}")]
    Rejected(String),
    /// Unrecoverable storage failure.
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn transience(&self) -> Transience {
        match self {
            StoreError::Busy(_) => Transience::Retryable,
            StoreError::Conflict { .. } | StoreError::Rejected(_) => Transience::Permanent,
            StoreError::Corrupt(_) => Transience::Permanent,
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        let code = match self {
            StoreError::Busy(_) => CODE_UNAVAILABLE,
            StoreError::Conflict { .. } => CODE_CONFLICT,
            StoreError::Rejected(_) => CODE_FORBIDDEN,
            StoreError::Corrupt(_) => CODE_INTERNAL,
        };
        ErrorPayload::new(ErrorDomain::Store, code, self.to_string())
            .retryable(self.transience().is_retryable())
    }
}

/// Answer to "do we need this advertised revision?".
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevCheck {
    /// The store holds the revision or a descendant of it.
    Present,
    /// Wanted; `ancestors` are revisions of the document the store already
    /// has, nearest first.
    Missing { ancestors: Vec<RevId> },
}

/// Answer to a `proposeChanges` descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposedOutcome {
    /// The revision extends the current line of the document.
    Accept,
    AlreadyExists,
    /// Appending would branch the document.
    Conflict,
}

/// A staging transaction; revisions become durable only at commit.
pub trait StoreTransaction {
    /// Stage one revision, merging it into the document's revision tree.
    /// Returns the local sequence the revision will hold after commit.
    fn stage(&mut self, rev: &RevToInsert) -> Result<LocalSequence, StoreError>;

    fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Contract the host document store must satisfy.
///
/// Bulk operations take descriptor batches and answer positionally.
pub trait Store: Send + Sync {
    /// For each `(docID, revID)`: does the store need the revision?
    fn check_revs(&self, revs: &[(DocId, RevId)]) -> Result<Vec<RevCheck>, StoreError>;

    /// Whether a proposed revision can be appended without branching.
    fn check_proposed(&self, doc_id: &DocId, rev_id: &RevId) -> Result<ProposedOutcome, StoreError>;

    fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError>;

    fn has_blob(&self, digest: &BlobDigest) -> bool;

    /// Persist a blob fetched from the peer.
    fn store_blob(&self, digest: &BlobDigest, body: Bytes) -> Result<(), StoreError>;

    fn read_checkpoint(&self, key: &str) -> Result<Option<Checkpoint>, StoreError>;

    fn write_checkpoint(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError>;
}
