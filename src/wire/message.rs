//! Message envelopes exchanged with the wire.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;

use crate::core::{ErrorDomain, ErrorPayload};

/// Well-known request profiles of the sync protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Profile {
    SubChanges,
    Changes,
    ProposeChanges,
    Rev,
    NoRev,
    GetAttachment,
}

impl Profile {
    pub fn as_str(self) -> &'static str {
        match self {
            Profile::SubChanges => "subChanges",
            Profile::Changes => "changes",
            Profile::ProposeChanges => "proposeChanges",
            Profile::Rev => "rev",
            Profile::NoRev => "norev",
            Profile::GetAttachment => "getAttachment",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "subChanges" => Some(Profile::SubChanges),
            "changes" => Some(Profile::Changes),
            "proposeChanges" => Some(Profile::ProposeChanges),
            "rev" => Some(Profile::Rev),
            "norev" => Some(Profile::NoRev),
            "getAttachment" => Some(Profile::GetAttachment),
            _ => None,
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request delivered by the wire.
#[derive(Clone, Debug)]
pub struct IncomingMessage {
    /// Wire-assigned request number; used to address the reply.
    pub number: u64,
    pub profile: Profile,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
    /// Peer asked for no reply frame.
    pub no_reply: bool,
}

#[derive(Debug, Error)]
#[error("invalid JSON body: {0}")]
pub struct BodyParseError(#[from] serde_json::Error);

impl IncomingMessage {
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    pub fn json_body(&self) -> Result<serde_json::Value, BodyParseError> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// A request built by this side for the wire to send.
#[derive(Clone, Debug, Default)]
pub struct OutgoingMessage {
    pub profile: Option<Profile>,
    pub properties: BTreeMap<String, String>,
    pub body: Bytes,
    pub no_reply: bool,
}

impl OutgoingMessage {
    pub fn request(profile: Profile) -> Self {
        Self {
            profile: Some(profile),
            ..Self::default()
        }
    }

    pub fn property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }

    pub fn json_body(mut self, body: &impl Serialize) -> Self {
        // Serialization of plain maps/arrays cannot fail.
        let encoded = serde_json::to_vec(body).unwrap_or_default();
        self.body = Bytes::from(encoded);
        self
    }
}

/// Reply content for an incoming request, or a reply received for one of
/// ours.
#[derive(Clone, Debug, PartialEq)]
pub enum WireResponse {
    /// Empty acknowledgement.
    Ok,
    Json(serde_json::Value),
    Error(ErrorPayload),
}

impl WireResponse {
    pub fn error(domain: ErrorDomain, code: u16, message: impl Into<String>) -> Self {
        WireResponse::Error(ErrorPayload::new(domain, code, message))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, WireResponse::Error(_))
    }

    pub fn as_error(&self) -> Option<&ErrorPayload> {
        match self {
            WireResponse::Error(payload) => Some(payload),
            _ => None,
        }
    }
}
