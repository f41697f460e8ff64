//! Duplicate guard for documents with revisions in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::core::DocId;

/// Concurrent counted set of docIDs between "rev requested" and terminal
/// notification. Counted because a continuous peer can advertise successive
/// revisions of the same document while an earlier one is still in flight.
#[derive(Clone, Debug, Default)]
pub struct DocIdSet {
    inner: Arc<Mutex<HashMap<DocId, u32>>>,
}

impl DocIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, doc_id: DocId) {
        let mut inner = self.inner.lock().expect("doc id set poisoned");
        *inner.entry(doc_id).or_insert(0) += 1;
    }

    pub fn contains(&self, doc_id: &DocId) -> bool {
        let inner = self.inner.lock().expect("doc id set poisoned");
        inner.contains_key(doc_id)
    }

    pub fn remove(&self, doc_id: &DocId) {
        let mut inner = self.inner.lock().expect("doc id set poisoned");
        if let Some(count) = inner.get_mut(doc_id) {
            *count -= 1;
            if *count == 0 {
                inner.remove(doc_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().expect("doc id set poisoned");
        inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
