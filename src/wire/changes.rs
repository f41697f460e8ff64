//! Advertisement bodies and their replies.
//!
//! A `changes`/`proposeChanges` body is a JSON array of
//! `[sequence, docID, revID, deleted?, bodySize?]` tuples. The reply to
//! `changes` is a parallel array of ancestor arrays (`[]` = don't want); the
//! reply to `proposeChanges` is a parallel array of status codes.

use serde_json::Value;
use thiserror::Error;

use crate::core::{DocId, RemoteSequence, RevDescriptor, RevFlags, RevId};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChangesBody {
    /// Empty advertisement: the peer has no further historical changes.
    CaughtUp,
    Advertisements(Vec<RevDescriptor>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChangesParseError {
    #[error("body is not a JSON array")]
    NotAnArray,
    #[error("entry {index} is not an array")]
    EntryNotAnArray { index: usize },
    #[error("entry {index} is missing {field}")]
    MissingField { index: usize, field: &'static str },
}

/// Parse an advertisement body. A literal `null` body counts as caught up.
pub fn parse_changes_body(body: &[u8]) -> Result<ChangesBody, ChangesParseError> {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(_) => return Err(ChangesParseError::NotAnArray),
    };
    let entries = match parsed {
        Value::Null => return Ok(ChangesBody::CaughtUp),
        Value::Array(entries) => entries,
        _ => return Err(ChangesParseError::NotAnArray),
    };
    if entries.is_empty() {
        return Ok(ChangesBody::CaughtUp);
    }

    let mut out = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let Value::Array(fields) = entry else {
            return Err(ChangesParseError::EntryNotAnArray { index });
        };
        let sequence = fields
            .first()
            .map(RemoteSequence::from_json_token)
            .unwrap_or_default();
        let doc_id = fields
            .get(1)
            .and_then(Value::as_str)
            .ok_or(ChangesParseError::MissingField {
                index,
                field: "docID",
            })?;
        let rev_id = fields
            .get(2)
            .and_then(Value::as_str)
            .ok_or(ChangesParseError::MissingField {
                index,
                field: "revID",
            })?;
        let mut flags = RevFlags::empty();
        if fields.get(3).is_some_and(truthy) {
            flags.insert(RevFlags::DELETED);
        }
        out.push(RevDescriptor {
            sequence,
            doc_id: DocId::from(doc_id),
            rev_id: RevId::from(rev_id),
            flags,
            body_size: fields.get(4).and_then(Value::as_u64).unwrap_or(0),
        });
    }
    Ok(ChangesBody::Advertisements(out))
}

// Peers encode the deleted marker as a bool or a nonzero int.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_u64().unwrap_or(0) != 0,
        _ => false,
    }
}

/// Per-descriptor answer in a `changes` reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevRequestAnswer {
    /// `[]`: the revision is already known or filtered out.
    DontWant,
    /// Request the revision; ancestors let the peer delta-encode or trim
    /// history.
    Want { ancestors: Vec<RevId> },
}

pub fn encode_changes_reply(answers: &[RevRequestAnswer]) -> Value {
    let entries: Vec<Value> = answers
        .iter()
        .map(|answer| match answer {
            RevRequestAnswer::DontWant => Value::Array(Vec::new()),
            RevRequestAnswer::Want { ancestors } => Value::Array(
                ancestors
                    .iter()
                    .map(|ancestor| Value::String(ancestor.to_string()))
                    .collect(),
            ),
        })
        .collect();
    Value::Array(entries)
}

/// Per-descriptor status in a `proposeChanges` reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProposedStatus {
    Accept,
    AlreadyExists,
    Conflict,
    Failure,
}

impl ProposedStatus {
    pub fn code(self) -> u64 {
        match self {
            ProposedStatus::Accept => 0,
            ProposedStatus::AlreadyExists => 304,
            ProposedStatus::Conflict => 409,
            ProposedStatus::Failure => 500,
        }
    }
}

/// Trailing accepts are omitted; the peer treats absent entries as status 0.
pub fn encode_propose_reply(statuses: &[ProposedStatus]) -> Value {
    let keep = statuses
        .iter()
        .rposition(|status| *status != ProposedStatus::Accept)
        .map_or(0, |last| last + 1);
    Value::Array(
        statuses[..keep]
            .iter()
            .map(|status| Value::Number(status.code().into()))
            .collect(),
    )
}
