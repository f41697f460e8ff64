//! Advertisement filtering against the local store.
//!
//! For each advertised revision the finder decides whether the store needs
//! it and answers the `changes`/`proposeChanges` message in one reply,
//! preserving descriptor order. The reply is the rev request: a non-empty
//! answer tells the peer to send the revision body.

use std::sync::Arc;

use crossbeam::channel::{Receiver, Sender};

use crate::core::{DocId, RevDescriptor, RevId};
use crate::store::{ProposedOutcome, RevCheck, Store};
use crate::wire::{
    ProposedStatus, RevRequestAnswer, Wire, WireResponse, encode_changes_reply,
    encode_propose_reply,
};

use super::doc_ids::DocIdSet;
use super::puller::PullerEvent;

pub(crate) struct FindRequest {
    pub message_number: u64,
    pub proposed: bool,
    pub skip_deleted: bool,
    pub entries: Vec<RevDescriptor>,
}

pub(crate) struct FinderContext {
    pub wire: Arc<dyn Wire>,
    pub store: Arc<dyn Store>,
    pub doc_ids: DocIdSet,
    pub events: Sender<PullerEvent>,
}

pub(crate) fn run_rev_finder(requests: Receiver<FindRequest>, ctx: FinderContext) {
    while let Ok(request) = requests.recv() {
        let (which, response) = if request.proposed {
            answer_proposed(&ctx, &request)
        } else {
            answer_changes(&ctx, &request)
        };
        // The puller must learn the outcome before the peer does: anything
        // the peer sends after seeing the reply races our own bookkeeping
        // otherwise.
        let message_number = request.message_number;
        let _ = ctx.events.send(PullerEvent::RevsFound {
            entries: request.entries,
            which,
        });
        ctx.wire.respond(message_number, response);
    }
}

fn answer_changes(ctx: &FinderContext, request: &FindRequest) -> (Vec<bool>, WireResponse) {
    let pairs: Vec<(DocId, RevId)> = request
        .entries
        .iter()
        .map(|entry| (entry.doc_id.clone(), entry.rev_id.clone()))
        .collect();

    let checks = match ctx.store.check_revs(&pairs) {
        Ok(checks) => checks,
        Err(err) => {
            tracing::warn!(error = %err, "store lookup for changes batch failed");
            return (
                vec![false; request.entries.len()],
                WireResponse::Error(err.to_payload()),
            );
        }
    };

    let mut which = Vec::with_capacity(request.entries.len());
    let mut answers = Vec::with_capacity(request.entries.len());
    for (entry, check) in request.entries.iter().zip(checks) {
        let answer = match check {
            RevCheck::Present => RevRequestAnswer::DontWant,
            RevCheck::Missing { .. } if entry.flags.deleted() && request.skip_deleted => {
                RevRequestAnswer::DontWant
            }
            RevCheck::Missing { ancestors } => RevRequestAnswer::Want { ancestors },
        };
        let requesting = matches!(answer, RevRequestAnswer::Want { .. });
        if requesting {
            ctx.doc_ids.insert(entry.doc_id.clone());
        }
        which.push(requesting);
        answers.push(answer);
    }

    tracing::debug!(
        requested = which.iter().filter(|wanted| **wanted).count(),
        advertised = which.len(),
        "answered changes batch"
    );
    (which, WireResponse::Json(encode_changes_reply(&answers)))
}

fn answer_proposed(ctx: &FinderContext, request: &FindRequest) -> (Vec<bool>, WireResponse) {
    let mut which = Vec::with_capacity(request.entries.len());
    let mut statuses = Vec::with_capacity(request.entries.len());
    for entry in &request.entries {
        let (requesting, status) = match ctx.store.check_proposed(&entry.doc_id, &entry.rev_id) {
            Ok(ProposedOutcome::Accept) => (true, ProposedStatus::Accept),
            Ok(ProposedOutcome::AlreadyExists) => (false, ProposedStatus::AlreadyExists),
            Ok(ProposedOutcome::Conflict) => (false, ProposedStatus::Conflict),
            Err(err) => {
                tracing::warn!(
                    doc = %entry.doc_id,
                    error = %err,
                    "store lookup for proposed revision failed"
                );
                (false, ProposedStatus::Failure)
            }
        };
        if requesting {
            ctx.doc_ids.insert(entry.doc_id.clone());
        }
        which.push(requesting);
        statuses.push(status);
    }

    (which, WireResponse::Json(encode_propose_reply(&statuses)))
}
