//! Pull-side replication pipeline.
//!
//! The [`Puller`] owns all protocol state for the pull direction and fans
//! work out to the rev finder, per-revision workers, and the inserter. Each
//! component is an actor: one thread, one mailbox, no shared mutable state
//! beyond the finish queue and the in-flight docID set.

pub mod doc_ids;
pub mod incoming;
pub mod inserter;
pub mod missing;
pub mod puller;
pub mod returning;
pub mod rev_finder;

use crate::core::{Checkpoint, Progress, ReplicatedRev};

pub use doc_ids::DocIdSet;
pub use missing::MissingSequences;
pub use puller::Puller;
pub use returning::ReturningQueue;

/// Coarse session state reported to the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityLevel {
    Stopped,
    Offline,
    Connecting,
    Idle,
    Busy,
}

/// Activity level plus progress, published whenever either changes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PullStatus {
    pub level: ActivityLevel,
    pub progress: Progress,
}

impl Default for PullStatus {
    fn default() -> Self {
        Self {
            level: ActivityLevel::Connecting,
            progress: Progress::default(),
        }
    }
}

/// Callbacks into the host replicator.
///
/// All methods are invoked from the puller's own thread; implementations
/// should hand off rather than block.
pub trait PullDelegate: Send + Sync {
    /// Exactly one call per revision that entered the pipeline, at its
    /// terminal state.
    fn document_ended(&self, rev: ReplicatedRev);

    /// The resumable checkpoint advanced.
    fn checkpoint_changed(&self, checkpoint: &Checkpoint);

    fn status_changed(&self, status: PullStatus);
}
