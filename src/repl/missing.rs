//! Pending-sequence tracking and the resumable `since` watermark.

use std::collections::{BTreeMap, HashMap};

use crate::core::RemoteSequence;

/// Sequences advertised but not yet confirmed complete, in advertisement
/// order, plus the `since` watermark that is safe to persist.
///
/// `since` is the latest sequence such that every sequence advertised at or
/// before it has been removed. Tokens are opaque, so "before" means arrival
/// order, never token comparison. `since` only moves forward.
#[derive(Debug, Default)]
pub struct MissingSequences {
    /// Arrival order → entry. Completed entries linger until they reach the
    /// head so the watermark can step across them in order.
    entries: BTreeMap<u64, Entry>,
    index: HashMap<RemoteSequence, u64>,
    next_order: u64,
    pending: usize,
    since: RemoteSequence,
}

#[derive(Debug)]
struct Entry {
    sequence: RemoteSequence,
    body_size: u64,
    completed: bool,
}

impl MissingSequences {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything and restart the watermark at `since`.
    pub fn clear(&mut self, since: RemoteSequence) {
        self.entries.clear();
        self.index.clear();
        self.next_order = 0;
        self.pending = 0;
        self.since = since;
    }

    /// Record an advertised sequence. Re-advertisements keep the earliest
    /// position.
    pub fn add(&mut self, sequence: RemoteSequence, body_size: u64) {
        if self.index.contains_key(&sequence) {
            return;
        }
        let order = self.next_order;
        self.next_order += 1;
        self.index.insert(sequence.clone(), order);
        self.entries.insert(
            order,
            Entry {
                sequence,
                body_size,
                completed: false,
            },
        );
        self.pending += 1;
    }

    /// Mark a sequence complete. Returns whether it was the earliest pending
    /// entry (so the watermark may have advanced) and its body size.
    /// Unknown sequences are a no-op reporting `(false, 0)`.
    pub fn remove(&mut self, sequence: &RemoteSequence) -> (bool, u64) {
        let Some(order) = self.index.remove(sequence) else {
            return (false, 0);
        };
        let head = self
            .entries
            .first_key_value()
            .map(|(order, _)| *order)
            .unwrap_or(u64::MAX);
        let was_earliest = order == head;

        let entry = self.entries.get_mut(&order).expect("indexed entry");
        entry.completed = true;
        let body_size = entry.body_size;
        self.pending -= 1;

        while let Some(first) = self.entries.first_entry() {
            if !first.get().completed {
                break;
            }
            self.since = first.remove().sequence;
        }

        (was_earliest, body_size)
    }

    /// Advertised body size of a still-pending sequence; 0 if unknown.
    pub fn body_size_of(&self, sequence: &RemoteSequence) -> u64 {
        self.index
            .get(sequence)
            .and_then(|order| self.entries.get(order))
            .map(|entry| entry.body_size)
            .unwrap_or(0)
    }

    pub fn since(&self) -> &RemoteSequence {
        &self.since
    }

    /// Count of pending (not yet completed) sequences.
    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    /// Pending sequences in advertisement order, for diagnostics.
    pub fn iter(&self) -> impl Iterator<Item = (&RemoteSequence, u64)> {
        self.entries
            .values()
            .filter(|entry| !entry.completed)
            .map(|entry| (&entry.sequence, entry.body_size))
    }
}
