//! In-memory store implementation.
//!
//! Backs the test harness and embedded smoke setups. Revision trees are
//! parent-linked; a document's `leaf` is its current line.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use bytes::Bytes;

use crate::core::{BlobDigest, Checkpoint, DocId, LocalSequence, RevId, RevToInsert};

use super::{ProposedOutcome, RevCheck, Store, StoreError, StoreTransaction};

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    docs: HashMap<DocId, Document>,
    blobs: HashMap<BlobDigest, Bytes>,
    checkpoints: HashMap<String, Checkpoint>,
    next_sequence: u64,
    commit_failures: VecDeque<StoreError>,
}

#[derive(Default)]
struct Document {
    revs: HashMap<RevId, StoredRev>,
    leaf: RevId,
}

struct StoredRev {
    parent: Option<RevId>,
    #[allow(dead_code)]
    body: Bytes,
    deleted: bool,
    sequence: LocalSequence,
}

/// Generation prefix of a `<gen>-<suffix>` revision id; 0 if unparsable.
fn generation(rev_id: &RevId) -> u64 {
    let raw = String::from_utf8_lossy(rev_id.as_bytes()).into_owned();
    raw.split_once('-')
        .and_then(|(generation, _)| generation.parse().ok())
        .unwrap_or(0)
}

impl Document {
    /// Whether `rev_id` sits on the leaf's ancestry line (so the store holds
    /// it or a descendant of it).
    fn holds_or_descends(&self, rev_id: &RevId) -> bool {
        if self.revs.contains_key(rev_id) {
            return true;
        }
        let mut cursor = Some(&self.leaf);
        while let Some(current) = cursor {
            if current == rev_id {
                return true;
            }
            cursor = self.revs.get(current).and_then(|rev| rev.parent.as_ref());
        }
        false
    }

    /// Leaf-line revision ids, nearest first.
    fn ancestors(&self) -> Vec<RevId> {
        let mut out = Vec::new();
        let mut cursor = Some(self.leaf.clone());
        while let Some(current) = cursor {
            if !self.revs.contains_key(&current) {
                break;
            }
            cursor = self
                .revs
                .get(&current)
                .and_then(|rev| rev.parent.as_ref())
                .cloned();
            out.push(current);
        }
        out
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a revision directly, bypassing the transaction path.
    pub fn insert_rev(&self, doc_id: &DocId, rev_id: &RevId, parent: Option<&RevId>, body: &[u8]) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.next_sequence += 1;
        let sequence = LocalSequence(inner.next_sequence);
        let doc = inner.docs.entry(doc_id.clone()).or_default();
        doc.revs.insert(
            rev_id.clone(),
            StoredRev {
                parent: parent.cloned(),
                body: Bytes::copy_from_slice(body),
                deleted: false,
                sequence,
            },
        );
        if generation(rev_id) >= generation(&doc.leaf) {
            doc.leaf = rev_id.clone();
        }
    }

    pub fn add_blob(&self, digest: &BlobDigest, body: &[u8]) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner
            .blobs
            .insert(digest.clone(), Bytes::copy_from_slice(body));
    }

    /// Queue an error for the next transaction commit (test hook).
    pub fn fail_next_commit(&self, err: StoreError) {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.commit_failures.push_back(err);
    }

    pub fn has_rev(&self, doc_id: &DocId, rev_id: &RevId) -> bool {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner
            .docs
            .get(doc_id)
            .is_some_and(|doc| doc.revs.contains_key(rev_id))
    }

    pub fn leaf_rev(&self, doc_id: &DocId) -> Option<RevId> {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.docs.get(doc_id).map(|doc| doc.leaf.clone())
    }

    pub fn rev_count(&self) -> usize {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.docs.values().map(|doc| doc.revs.len()).sum()
    }
}

impl Store for MemoryStore {
    fn check_revs(&self, revs: &[(DocId, RevId)]) -> Result<Vec<RevCheck>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(revs
            .iter()
            .map(|(doc_id, rev_id)| match inner.docs.get(doc_id) {
                Some(doc) if doc.holds_or_descends(rev_id) => RevCheck::Present,
                Some(doc) => RevCheck::Missing {
                    ancestors: doc.ancestors(),
                },
                None => RevCheck::Missing {
                    ancestors: Vec::new(),
                },
            })
            .collect())
    }

    fn check_proposed(
        &self,
        doc_id: &DocId,
        rev_id: &RevId,
    ) -> Result<ProposedOutcome, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        let Some(doc) = inner.docs.get(doc_id) else {
            return Ok(ProposedOutcome::Accept);
        };
        if doc.revs.contains_key(rev_id) {
            return Ok(ProposedOutcome::AlreadyExists);
        }
        if generation(rev_id) == generation(&doc.leaf) + 1 {
            Ok(ProposedOutcome::Accept)
        } else {
            Ok(ProposedOutcome::Conflict)
        }
    }

    fn begin_transaction(&self) -> Result<Box<dyn StoreTransaction + '_>, StoreError> {
        Ok(Box::new(MemoryTransaction {
            store: self,
            staged: Vec::new(),
        }))
    }

    fn has_blob(&self, digest: &BlobDigest) -> bool {
        let inner = self.inner.lock().expect("memory store poisoned");
        inner.blobs.contains_key(digest)
    }

    fn store_blob(&self, digest: &BlobDigest, body: Bytes) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.blobs.insert(digest.clone(), body);
        Ok(())
    }

    fn read_checkpoint(&self, key: &str) -> Result<Option<Checkpoint>, StoreError> {
        let inner = self.inner.lock().expect("memory store poisoned");
        Ok(inner.checkpoints.get(key).cloned())
    }

    fn write_checkpoint(&self, key: &str, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory store poisoned");
        inner.checkpoints.insert(key.to_string(), checkpoint.clone());
        Ok(())
    }
}

struct MemoryTransaction<'a> {
    store: &'a MemoryStore,
    staged: Vec<(RevToInsert, LocalSequence)>,
}

impl StoreTransaction for MemoryTransaction<'_> {
    fn stage(&mut self, rev: &RevToInsert) -> Result<LocalSequence, StoreError> {
        let mut inner = self.store.inner.lock().expect("memory store poisoned");

        if rev.no_conflicts
            && let Some(doc) = inner.docs.get(&rev.doc_id)
            && !doc.leaf.is_empty()
            && rev.history.first() != Some(&doc.leaf)
            && !rev.history.contains(&doc.leaf)
        {
            return Err(StoreError::Conflict {
                doc_id: rev.doc_id.clone(),
                rev_id: rev.rev_id.clone(),
            });
        }

        inner.next_sequence += 1;
        let sequence = LocalSequence(inner.next_sequence);
        self.staged.push((rev.clone(), sequence));
        Ok(sequence)
    }

    fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let MemoryTransaction { store, staged } = *self;
        let mut inner = store.inner.lock().expect("memory store poisoned");
        if let Some(err) = inner.commit_failures.pop_front() {
            return Err(err);
        }
        for (rev, sequence) in staged {
            let doc = inner.docs.entry(rev.doc_id.clone()).or_default();
            doc.revs.insert(
                rev.rev_id.clone(),
                StoredRev {
                    parent: rev.history.first().cloned(),
                    body: rev.body.clone(),
                    deleted: rev.deleted(),
                    sequence,
                },
            );
            if generation(&rev.rev_id) >= generation(&doc.leaf) {
                doc.leaf = rev.rev_id.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(doc: &str, rev: &str, history: &[&str]) -> RevToInsert {
        RevToInsert {
            doc_id: DocId::from(doc),
            rev_id: RevId::from(rev),
            history: history.iter().map(|id| RevId::from(*id)).collect(),
            body: Bytes::from_static(b"{}"),
            ..RevToInsert::default()
        }
    }

    #[test]
    fn check_revs_reports_descendants_as_present() {
        let store = MemoryStore::new();
        store.insert_rev(&DocId::from("doc"), &RevId::from("1-aa"), None, b"{}");
        store.insert_rev(
            &DocId::from("doc"),
            &RevId::from("2-bb"),
            Some(&RevId::from("1-aa")),
            b"{}",
        );

        let checks = store
            .check_revs(&[
                (DocId::from("doc"), RevId::from("1-aa")),
                (DocId::from("doc"), RevId::from("3-cc")),
                (DocId::from("other"), RevId::from("1-zz")),
            ])
            .unwrap();

        assert_eq!(checks[0], RevCheck::Present);
        assert_eq!(
            checks[1],
            RevCheck::Missing {
                ancestors: vec![RevId::from("2-bb"), RevId::from("1-aa")],
            }
        );
        assert_eq!(
            checks[2],
            RevCheck::Missing {
                ancestors: Vec::new()
            }
        );
    }

    #[test]
    fn proposed_outcomes_follow_leaf_generation() {
        let store = MemoryStore::new();
        store.insert_rev(&DocId::from("doc"), &RevId::from("1-aa"), None, b"{}");

        let doc = DocId::from("doc");
        assert_eq!(
            store.check_proposed(&doc, &RevId::from("2-bb")).unwrap(),
            ProposedOutcome::Accept
        );
        assert_eq!(
            store.check_proposed(&doc, &RevId::from("1-aa")).unwrap(),
            ProposedOutcome::AlreadyExists
        );
        assert_eq!(
            store.check_proposed(&doc, &RevId::from("1-zz")).unwrap(),
            ProposedOutcome::Conflict
        );
        assert_eq!(
            store
                .check_proposed(&DocId::from("new"), &RevId::from("1-aa"))
                .unwrap(),
            ProposedOutcome::Accept
        );
    }

    #[test]
    fn transaction_commits_staged_revs() {
        let store = MemoryStore::new();
        let mut txn = store.begin_transaction().unwrap();
        let seq_a = txn.stage(&rev("docA", "1-aa", &[])).unwrap();
        let seq_b = txn.stage(&rev("docB", "1-bb", &[])).unwrap();
        assert!(seq_a < seq_b);
        txn.commit().unwrap();

        assert!(store.has_rev(&DocId::from("docA"), &RevId::from("1-aa")));
        assert!(store.has_rev(&DocId::from("docB"), &RevId::from("1-bb")));
    }

    #[test]
    fn no_conflicts_stage_rejects_branching() {
        let store = MemoryStore::new();
        store.insert_rev(&DocId::from("doc"), &RevId::from("1-aa"), None, b"{}");

        let mut conflicting = rev("doc", "2-zz", &[]);
        conflicting.no_conflicts = true;
        let mut txn = store.begin_transaction().unwrap();
        let err = txn.stage(&conflicting).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));

        let mut extending = rev("doc", "2-bb", &["1-aa"]);
        extending.no_conflicts = true;
        txn.stage(&extending).unwrap();
        txn.commit().unwrap();
        assert_eq!(
            store.leaf_rev(&DocId::from("doc")),
            Some(RevId::from("2-bb"))
        );
    }

    #[test]
    fn queued_commit_failure_surfaces_once() {
        let store = MemoryStore::new();
        store.fail_next_commit(StoreError::Busy("contention".into()));

        let mut txn = store.begin_transaction().unwrap();
        txn.stage(&rev("docA", "1-aa", &[])).unwrap();
        assert!(matches!(txn.commit(), Err(StoreError::Busy(_))));
        assert!(!store.has_rev(&DocId::from("docA"), &RevId::from("1-aa")));

        let mut txn = store.begin_transaction().unwrap();
        txn.stage(&rev("docA", "1-aa", &[])).unwrap();
        txn.commit().unwrap();
        assert!(store.has_rev(&DocId::from("docA"), &RevId::from("1-aa")));
    }
}
