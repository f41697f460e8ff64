//! Batched transactional insertion.
//!
//! The inserter is the only writer on the store's insert path. It gathers
//! validated revisions into bounded batches, stages each inside one
//! transaction, and commits. Staging unblocks the puller's active window
//! before the commit lands; commit failure turns the whole batch transient
//! unless the store says otherwise.

use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender};

use crate::core::Limits;
use crate::store::Store;

use super::incoming::{FinishSink, IncomingRev};
use super::puller::PullerEvent;

pub(crate) enum InserterMsg {
    Insert(Box<IncomingRev>),
}

pub(crate) struct InserterContext {
    pub store: std::sync::Arc<dyn Store>,
    pub limits: Limits,
    pub events: Sender<PullerEvent>,
    pub finish: FinishSink,
}

pub(crate) fn run_inserter(msgs: Receiver<InserterMsg>, ctx: InserterContext) {
    let latency = Duration::from_millis(ctx.limits.insert_batch_latency_ms);
    while let Ok(InserterMsg::Insert(first)) = msgs.recv() {
        let mut batch = vec![first];
        let deadline = Instant::now() + latency;
        while batch.len() < ctx.limits.insert_batch_revs {
            match msgs.recv_deadline(deadline) {
                Ok(InserterMsg::Insert(inc)) => batch.push(inc),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        insert_batch(&ctx, batch);
    }
}

fn insert_batch(ctx: &InserterContext, mut batch: Vec<Box<IncomingRev>>) {
    tracing::debug!(revs = batch.len(), "inserting revision batch");

    let mut txn = match ctx.store.begin_transaction() {
        Ok(txn) => txn,
        Err(err) => {
            tracing::warn!(error = %err, "could not open insert transaction");
            let payload = err.to_payload();
            for mut inc in batch {
                inc.set_error(payload.clone());
                ctx.finish.finish(inc);
            }
            return;
        }
    };

    let mut staged = 0usize;
    for inc in batch.iter_mut() {
        match txn.stage(&inc.rev) {
            Ok(sequence) => {
                inc.local_sequence = Some(sequence);
                inc.rev.trim();
                inc.mark_provisionally_inserted();
                staged += 1;
                let _ = ctx.events.send(PullerEvent::RevProvisionallyHandled);
            }
            Err(err) => {
                tracing::debug!(
                    doc = %inc.rev.doc_id,
                    rev = %inc.rev.rev_id,
                    error = %err,
                    "staging revision failed"
                );
                inc.set_error(err.to_payload());
            }
        }
    }

    match txn.commit() {
        Ok(()) => {
            tracing::debug!(revs = staged, "insert batch committed");
        }
        Err(err) => {
            tracing::warn!(error = %err, revs = staged, "insert batch commit failed");
            let payload = err.to_payload();
            for inc in batch.iter_mut() {
                if inc.error.is_none() && inc.was_provisionally_inserted() {
                    inc.local_sequence = None;
                    inc.set_error(payload.clone());
                }
            }
        }
    }

    for inc in batch {
        ctx.finish.finish(inc);
    }
}
