//! Core data model shared across the pull pipeline.

pub mod checkpoint;
pub mod error;
pub mod limits;
pub mod progress;
pub mod rev;
pub mod sequence;

pub use checkpoint::Checkpoint;
pub use error::{
    CODE_BAD_REQUEST, CODE_CONFLICT, CODE_FORBIDDEN, CODE_INTERNAL, CODE_NOT_FOUND, CODE_TIMEOUT,
    CODE_TOO_MANY_REQUESTS, CODE_UNAVAILABLE, ErrorDomain, ErrorPayload,
};
pub use limits::Limits;
pub use progress::Progress;
pub use rev::{
    BlobDigest, Direction, DocId, LocalSequence, ReplicatedRev, RevDescriptor, RevFlags, RevId,
    RevToInsert,
};
pub use sequence::RemoteSequence;
