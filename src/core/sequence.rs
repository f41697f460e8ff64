//! Opaque remote sequence tokens.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A position token in a remote change feed.
///
/// Tokens are opaque: peers encode them as integers, strings, or composites.
/// Only equality and per-source arrival order are meaningful; there is no
/// total order across tokens.
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct RemoteSequence(Bytes);

// Tokens originate in JSON text, so they persist as strings.
impl Serialize for RemoteSequence {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

impl<'de> Deserialize<'de> for RemoteSequence {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let token = String::deserialize(deserializer)?;
        Ok(Self(Bytes::from(token)))
    }
}

impl RemoteSequence {
    pub fn new(token: impl Into<Bytes>) -> Self {
        Self(token.into())
    }

    /// The token as it appeared in the advertisement.
    ///
    /// String tokens keep their content (peers echo them back as plain
    /// property strings); other values keep their compact JSON text.
    /// `null` and absent tokens map to the empty sequence.
    pub fn from_json_token(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::none(),
            serde_json::Value::String(token) => Self(Bytes::from(token.clone())),
            other => Self(Bytes::from(other.to_string())),
        }
    }

    pub fn none() -> Self {
        Self(Bytes::new())
    }

    pub fn is_none(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for RemoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("(none)");
        }
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for RemoteSequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RemoteSequence({self})")
    }
}
