//! Per-revision download, validation, and handoff.
//!
//! An `IncomingRev` owns one revision from `rev` message arrival until its
//! terminal notification: parse the metadata, fetch blobs the store lacks,
//! hand the revision to the inserter, and report back through the finish
//! queue. Instances are pooled by the puller and reset between uses.

use std::collections::HashSet;
use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};
use serde_json::Value;

use crate::core::{
    BlobDigest, CODE_BAD_REQUEST, CODE_INTERNAL, CODE_UNAVAILABLE, DocId, ErrorDomain,
    ErrorPayload, Limits, LocalSequence, RemoteSequence, ReplicatedRev, RevFlags, RevId,
    RevToInsert,
};
use crate::store::Store;
use crate::wire::{IncomingMessage, Wire};

use super::doc_ids::DocIdSet;
use super::inserter::InserterMsg;
use super::puller::PullerEvent;
use super::returning::ReturningQueue;

/// One in-flight revision.
#[derive(Debug, Default)]
pub(crate) struct IncomingRev {
    pub rev: RevToInsert,
    pub error: Option<ErrorPayload>,
    pub error_is_transient: bool,
    pub local_sequence: Option<LocalSequence>,
    provisionally_inserted: bool,
}

impl IncomingRev {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepare a pooled instance for reuse.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn remote_sequence(&self) -> &RemoteSequence {
        &self.rev.remote_sequence
    }

    pub fn set_error(&mut self, payload: ErrorPayload) {
        self.error_is_transient = payload.retryable;
        self.error = Some(payload);
    }

    pub fn mark_provisionally_inserted(&mut self) {
        self.provisionally_inserted = true;
    }

    /// True iff the revision reached the staged-in-transaction state,
    /// whatever happened afterwards.
    pub fn was_provisionally_inserted(&self) -> bool {
        self.provisionally_inserted
    }

    pub fn replicated(&self) -> ReplicatedRev {
        ReplicatedRev {
            doc_id: self.rev.doc_id.clone(),
            rev_id: self.rev.rev_id.clone(),
            flags: self.rev.flags,
            sequence: if self.error.is_none() {
                self.local_sequence
            } else {
                None
            },
            error: self.error.clone(),
            error_is_transient: self.error_is_transient,
            direction: crate::core::Direction::Pulling,
        }
    }

    /// Run the pre-insert stages: parse metadata, validate the body, fetch
    /// missing blobs. On success the revision is ready for the inserter.
    pub fn ingest(
        &mut self,
        msg: &IncomingMessage,
        ctx: &WorkerContext,
    ) -> Result<(), ErrorPayload> {
        // The sequence echo must survive even a failed parse, so the puller
        // can settle the pending set.
        if let Some(sequence) = msg.property("sequence") {
            self.rev.remote_sequence = RemoteSequence::new(sequence.to_string());
        }

        let doc_id = required_property(msg, "id")?;
        let rev_id = required_property(msg, "rev")?;
        self.rev.doc_id = DocId::from(doc_id);
        self.rev.rev_id = RevId::from(rev_id);
        self.rev.history = msg
            .property("history")
            .map(|history| {
                history
                    .split(',')
                    .filter(|ancestor| !ancestor.is_empty())
                    .map(RevId::from)
                    .collect()
            })
            .unwrap_or_default();
        if msg
            .property("deleted")
            .is_some_and(|value| value != "false" && value != "0")
        {
            self.rev.flags.insert(RevFlags::DELETED);
        }
        self.rev.no_conflicts = ctx.no_conflicts;

        if msg.body.len() > ctx.limits.max_rev_body_bytes {
            return Err(ErrorPayload::new(
                ErrorDomain::Blip,
                CODE_BAD_REQUEST,
                format!("rev body of {} bytes exceeds limit", msg.body.len()),
            ));
        }
        let body: Value = serde_json::from_slice(&msg.body).map_err(|err| {
            ErrorPayload::new(
                ErrorDomain::Blip,
                CODE_BAD_REQUEST,
                format!("invalid rev body: {err}"),
            )
        })?;
        self.rev.body = msg.body.clone();

        let digests = blob_digests(&body);
        if !digests.is_empty() {
            self.rev.flags.insert(RevFlags::HAS_ATTACHMENTS);
            self.fetch_missing_blobs(&digests, ctx)?;
        }
        Ok(())
    }

    fn fetch_missing_blobs(
        &self,
        digests: &[BlobDigest],
        ctx: &WorkerContext,
    ) -> Result<(), ErrorPayload> {
        let missing: Vec<&BlobDigest> = digests
            .iter()
            .filter(|digest| !ctx.store.has_blob(digest))
            .collect();
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(
            doc = %self.rev.doc_id,
            rev = %self.rev.rev_id,
            count = missing.len(),
            "fetching missing blobs"
        );

        for chunk in missing.chunks(ctx.limits.max_concurrent_blob_fetches.max(1)) {
            let outcomes: Vec<Result<(), ErrorPayload>> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|digest| {
                        scope.spawn(move || {
                            let body = ctx
                                .wire
                                .fetch_blob(digest)
                                .map_err(|err| err.to_payload())?;
                            ctx.store
                                .store_blob(digest, body)
                                .map_err(|err| err.to_payload())
                        })
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle.join().unwrap_or_else(|_| {
                            Err(ErrorPayload::new(
                                ErrorDomain::Blip,
                                CODE_INTERNAL,
                                "blob fetch worker panicked",
                            ))
                        })
                    })
                    .collect()
            });
            for outcome in outcomes {
                outcome?;
            }
        }
        Ok(())
    }
}

fn required_property<'m>(msg: &'m IncomingMessage, name: &str) -> Result<&'m str, ErrorPayload> {
    msg.property(name)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| {
            ErrorPayload::new(
                ErrorDomain::Blip,
                CODE_BAD_REQUEST,
                format!("rev message is missing '{name}'"),
            )
        })
}

/// Digests of all blob references in a body, in encounter order.
fn blob_digests(body: &Value) -> Vec<BlobDigest> {
    fn walk(value: &Value, seen: &mut HashSet<String>, out: &mut Vec<BlobDigest>) {
        match value {
            Value::Object(map) => {
                if map.get("@type").and_then(Value::as_str) == Some("blob")
                    && let Some(digest) = map.get("digest").and_then(Value::as_str)
                    && seen.insert(digest.to_string())
                {
                    out.push(BlobDigest::new(digest));
                }
                for child in map.values() {
                    walk(child, seen, out);
                }
            }
            Value::Array(children) => {
                for child in children {
                    walk(child, seen, out);
                }
            }
            _ => {}
        }
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    walk(body, &mut seen, &mut out);
    out
}

/// Shared sink for finished revisions; producers are workers and the
/// inserter, the consumer is the puller.
#[derive(Clone)]
pub(crate) struct FinishSink {
    pub doc_ids: DocIdSet,
    pub returning: Arc<ReturningQueue<Box<IncomingRev>>>,
    pub events: Sender<PullerEvent>,
}

impl FinishSink {
    pub fn finish(&self, inc: Box<IncomingRev>) {
        self.doc_ids.remove(&inc.rev.doc_id);
        if let Some(generation) = self.returning.push(inc) {
            let _ = self.events.send(PullerEvent::RevsFinished { generation });
        }
    }
}

#[derive(Clone)]
pub(crate) struct WorkerContext {
    pub wire: Arc<dyn Wire>,
    pub store: Arc<dyn Store>,
    pub limits: Limits,
    pub no_conflicts: bool,
    pub inserter: Sender<InserterMsg>,
    pub finish: FinishSink,
}

pub(crate) struct RevJob {
    pub inc: Box<IncomingRev>,
    pub msg: IncomingMessage,
}

/// Worker loop. The puller routes all revisions of one document to the same
/// worker, so per-document submission order is preserved.
pub(crate) fn run_rev_worker(jobs: Receiver<RevJob>, ctx: WorkerContext) {
    while let Ok(RevJob { mut inc, msg }) = jobs.recv() {
        match inc.ingest(&msg, &ctx) {
            Ok(()) => {
                if let Err(rejected) = ctx.inserter.send(InserterMsg::Insert(inc)) {
                    let InserterMsg::Insert(mut inc) = rejected.0;
                    inc.set_error(ErrorPayload::new(
                        ErrorDomain::Blip,
                        CODE_UNAVAILABLE,
                        "session shutting down",
                    ));
                    ctx.finish.finish(inc);
                }
            }
            Err(payload) => {
                tracing::debug!(
                    doc = %inc.rev.doc_id,
                    rev = %inc.rev.rev_id,
                    error = %payload,
                    "incoming revision failed before insert"
                );
                inc.set_error(payload);
                ctx.finish.finish(inc);
            }
        }
    }
}
