#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod repl;
pub mod store;
pub mod test_harness;
pub mod wire;

pub use error::{Error, Transience};
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the session surface at the crate root for convenience
pub use crate::config::{PullMode, PullOptions};
pub use crate::core::{
    BlobDigest, Checkpoint, Direction, DocId, ErrorDomain, ErrorPayload, Limits, LocalSequence,
    Progress, RemoteSequence, ReplicatedRev, RevDescriptor, RevFlags, RevId, RevToInsert,
};
pub use crate::repl::{ActivityLevel, PullDelegate, PullStatus, Puller};
pub use crate::store::{MemoryStore, ProposedOutcome, RevCheck, Store, StoreError};
pub use crate::wire::{IncomingMessage, OutgoingMessage, Profile, Wire, WireError, WireResponse};
