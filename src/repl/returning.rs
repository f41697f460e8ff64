//! Multi-producer finish queue drained by the puller.

use std::sync::Mutex;

/// Finished work handed back to a single consumer in batches.
///
/// Producers push from any thread. The first push of a generation returns
/// that generation so the producer can wake the consumer once; later pushes
/// join the same batch silently. The consumer drains the whole batch with
/// [`ReturningQueue::pop`], which also opens the next generation.
#[derive(Debug)]
pub struct ReturningQueue<T> {
    inner: Mutex<QueueState<T>>,
}

#[derive(Debug)]
struct QueueState<T> {
    items: Vec<T>,
    generation: u64,
    notified: bool,
}

impl<T> Default for ReturningQueue<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(QueueState {
                items: Vec::new(),
                generation: 0,
                notified: false,
            }),
        }
    }
}

impl<T> ReturningQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `Some(generation)` when the consumer needs a wake-up.
    pub fn push(&self, item: T) -> Option<u64> {
        let mut state = self.inner.lock().expect("returning queue poisoned");
        state.items.push(item);
        if state.notified {
            None
        } else {
            state.notified = true;
            Some(state.generation)
        }
    }

    /// Drain the batch for `generation`. A stale generation (already drained)
    /// yields an empty batch.
    pub fn pop(&self, generation: u64) -> Vec<T> {
        let mut state = self.inner.lock().expect("returning queue poisoned");
        if generation != state.generation {
            return Vec::new();
        }
        state.generation += 1;
        state.notified = false;
        std::mem::take(&mut state.items)
    }
}
