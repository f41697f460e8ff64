//! Wire transport seam.
//!
//! The framed RPC transport lives outside this crate; the pull pipeline sees
//! it only through [`Wire`]. Incoming requests are delivered to the puller's
//! mailbox as [`IncomingMessage`] values; replies to our own requests come
//! back on a caller-supplied channel.

pub mod changes;
pub mod message;

use bytes::Bytes;
use crossbeam::channel::Sender;
use thiserror::Error;

use crate::core::{BlobDigest, ErrorPayload};
use crate::error::Transience;

pub use changes::{
    ChangesBody, ChangesParseError, ProposedStatus, RevRequestAnswer, encode_changes_reply,
    encode_propose_reply, parse_changes_body,
};
pub use message::{BodyParseError, IncomingMessage, OutgoingMessage, Profile, WireResponse};

/// Channel on which the wire delivers the reply to one of our requests.
pub type ReplySender = Sender<WireResponse>;

#[derive(Clone, Debug, Error)]
pub enum WireError {
    #[error("connection closed")]
    Disconnected,
    #[error("request timed out")]
    Timeout,
    #[error("peer error: {0}")]
    Peer(ErrorPayload),
}

impl WireError {
    pub fn transience(&self) -> Transience {
        match self {
            WireError::Disconnected | WireError::Timeout => Transience::Retryable,
            WireError::Peer(payload) => payload.transience(),
        }
    }

    pub fn to_payload(&self) -> ErrorPayload {
        match self {
            WireError::Disconnected => ErrorPayload::new(
                crate::core::ErrorDomain::Blip,
                crate::core::CODE_UNAVAILABLE,
                "connection closed",
            ),
            WireError::Timeout => ErrorPayload::new(
                crate::core::ErrorDomain::Blip,
                crate::core::CODE_TIMEOUT,
                "request timed out",
            ),
            WireError::Peer(payload) => payload.clone(),
        }
    }
}

/// Contract the surrounding connection must satisfy.
///
/// Implementations own framing, per-request timeouts, and delivery order.
/// All methods may be called from any pipeline thread.
pub trait Wire: Send + Sync {
    /// Send a request. When `reply` is supplied the wire delivers exactly one
    /// [`WireResponse`] on it, or drops the sender on disconnect.
    fn send_request(
        &self,
        msg: OutgoingMessage,
        reply: Option<ReplySender>,
    ) -> Result<(), WireError>;

    /// Answer an incoming request by its wire number.
    fn respond(&self, request: u64, response: WireResponse);

    /// Fetch a blob body via a `getAttachment` sub-request. Blocks the
    /// calling worker until the wire's own timeout.
    fn fetch_blob(&self, digest: &BlobDigest) -> Result<Bytes, WireError>;

    fn connected(&self) -> bool;
}
