//! Pull coordinator.
//!
//! Owns every piece of protocol state for the pull direction. All mutation
//! happens on the puller's own thread; the wire, the rev finder, the
//! workers, and the inserter communicate with it purely through the event
//! mailbox.

use std::collections::VecDeque;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel::{Receiver, Sender, bounded, unbounded};
use uuid::Uuid;

use crate::config::{PullMode, PullOptions};
use crate::core::{
    CODE_BAD_REQUEST, CODE_CONFLICT, CODE_UNAVAILABLE, Checkpoint, DocId, ErrorDomain, Limits,
    Progress, RemoteSequence, RevDescriptor,
};
use crate::store::Store;
use crate::wire::{
    ChangesBody, IncomingMessage, OutgoingMessage, Profile, Wire, WireResponse,
    parse_changes_body,
};

use super::doc_ids::DocIdSet;
use super::incoming::{FinishSink, IncomingRev, RevJob, WorkerContext, run_rev_worker};
use super::inserter::{InserterContext, InserterMsg, run_inserter};
use super::missing::MissingSequences;
use super::returning::ReturningQueue;
use super::rev_finder::{FindRequest, FinderContext, run_rev_finder};
use super::{ActivityLevel, PullDelegate, PullStatus};

#[derive(Debug)]
pub(crate) enum PullerEvent {
    Start { since: Option<RemoteSequence> },
    Message(IncomingMessage),
    SubChangesReply(WireResponse),
    RevsFound { entries: Vec<RevDescriptor>, which: Vec<bool> },
    RevProvisionallyHandled,
    RevsFinished { generation: u64 },
    Disconnected,
    Stop,
}

/// Handle to a running pull session.
///
/// The session runs on its own actor thread from [`Puller::spawn`] until
/// [`Puller::stop`] (or, for a one-shot pull, natural completion). The wire
/// feeds requests in through [`Puller::deliver`].
pub struct Puller {
    events: Sender<PullerEvent>,
    status: Arc<Mutex<PullStatus>>,
    join: Option<JoinHandle<()>>,
}

impl Puller {
    pub fn spawn(
        wire: Arc<dyn Wire>,
        store: Arc<dyn Store>,
        delegate: Arc<dyn PullDelegate>,
        options: PullOptions,
        limits: Limits,
    ) -> Puller {
        let session = Uuid::new_v4();
        if options.no_incoming_conflicts && options.active() {
            tracing::warn!(
                session = %session,
                "no_incoming_conflicts is not compatible with an active pull"
            );
        }

        let (events_tx, events_rx) = unbounded();
        let status = Arc::new(Mutex::new(PullStatus::default()));
        let returning = Arc::new(ReturningQueue::new());
        let doc_ids = DocIdSet::new();
        let finish = FinishSink {
            doc_ids: doc_ids.clone(),
            returning: returning.clone(),
            events: events_tx.clone(),
        };

        let (inserter_tx, inserter_rx) = unbounded();
        {
            let ctx = InserterContext {
                store: store.clone(),
                limits: limits.clone(),
                events: events_tx.clone(),
                finish: finish.clone(),
            };
            std::thread::spawn(move || run_inserter(inserter_rx, ctx));
        }

        let worker_count = limits.incoming_rev_workers.max(1);
        let mut workers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (jobs_tx, jobs_rx) = unbounded();
            let ctx = WorkerContext {
                wire: wire.clone(),
                store: store.clone(),
                limits: limits.clone(),
                no_conflicts: options.no_incoming_conflicts,
                inserter: inserter_tx.clone(),
                finish: finish.clone(),
            };
            std::thread::spawn(move || run_rev_worker(jobs_rx, ctx));
            workers.push(jobs_tx);
        }

        let (finder_tx, finder_rx) = unbounded();
        {
            let ctx = FinderContext {
                wire: wire.clone(),
                store: store.clone(),
                doc_ids: doc_ids.clone(),
                events: events_tx.clone(),
            };
            std::thread::spawn(move || run_rev_finder(finder_rx, ctx));
        }

        let fingerprint = options.fingerprint();
        let state = PullerState {
            session,
            wire,
            store,
            delegate,
            options,
            limits,
            events_tx: events_tx.clone(),
            finder_tx,
            workers,
            returning,
            doc_ids,
            missing: MissingSequences::new(),
            last_sequence: RemoteSequence::none(),
            checkpoint_key: Checkpoint::storage_key(&fingerprint),
            fingerprint,
            caught_up: false,
            skip_deleted: false,
            fatal_error: false,
            disconnected: false,
            stopping: false,
            started: false,
            pending_rev_messages: 0,
            active_incoming_revs: 0,
            unfinished_incoming_revs: 0,
            pending_rev_finder_calls: 0,
            waiting_changes: VecDeque::new(),
            waiting_revs: VecDeque::new(),
            spare: Vec::new(),
            progress: Progress::default(),
            status: status.clone(),
            published: PullStatus::default(),
        };
        let join = std::thread::spawn(move || state.run(events_rx));

        Puller {
            events: events_tx,
            status,
            join: Some(join),
        }
    }

    /// Subscribe to the peer's change feed, resuming from the persisted
    /// checkpoint if one matches this configuration.
    pub fn start(&self) {
        let _ = self.events.send(PullerEvent::Start { since: None });
    }

    /// Subscribe starting at an explicit sequence instead of the stored
    /// checkpoint.
    pub fn start_from(&self, since: RemoteSequence) {
        let _ = self.events.send(PullerEvent::Start { since: Some(since) });
    }

    /// Wire ingress for `changes`, `proposeChanges`, `rev`, and `norev`.
    pub fn deliver(&self, msg: IncomingMessage) {
        let _ = self.events.send(PullerEvent::Message(msg));
    }

    /// The wire lost its connection.
    pub fn disconnected(&self) {
        let _ = self.events.send(PullerEvent::Disconnected);
    }

    /// Idempotent. In-flight revisions run to a terminal state before the
    /// session ends.
    pub fn stop(&self) {
        let _ = self.events.send(PullerEvent::Stop);
    }

    pub fn status(&self) -> PullStatus {
        *self.status.lock().expect("status cell poisoned")
    }

    /// Wait for the session thread to exit.
    pub fn join(mut self) {
        if let Some(handle) = self.join.take() {
            let _ = handle.join();
        }
    }
}

struct PullerState {
    session: Uuid,
    wire: Arc<dyn Wire>,
    store: Arc<dyn Store>,
    delegate: Arc<dyn PullDelegate>,
    options: PullOptions,
    limits: Limits,
    events_tx: Sender<PullerEvent>,
    finder_tx: Sender<FindRequest>,
    workers: Vec<Sender<RevJob>>,
    returning: Arc<ReturningQueue<Box<IncomingRev>>>,
    doc_ids: DocIdSet,

    missing: MissingSequences,
    last_sequence: RemoteSequence,
    checkpoint_key: String,
    fingerprint: String,

    caught_up: bool,
    skip_deleted: bool,
    fatal_error: bool,
    disconnected: bool,
    stopping: bool,
    started: bool,

    pending_rev_messages: u32,
    active_incoming_revs: u32,
    unfinished_incoming_revs: u32,
    pending_rev_finder_calls: u32,

    waiting_changes: VecDeque<IncomingMessage>,
    waiting_revs: VecDeque<IncomingMessage>,
    spare: Vec<Box<IncomingRev>>,

    progress: Progress,
    status: Arc<Mutex<PullStatus>>,
    published: PullStatus,
}

impl PullerState {
    fn run(mut self, events: Receiver<PullerEvent>) {
        self.publish_status();
        while let Ok(event) = events.recv() {
            self.handle_event(event);
            self.publish_status();
            if self.finished() {
                break;
            }
        }
        self.teardown();
    }

    fn handle_event(&mut self, event: PullerEvent) {
        match event {
            PullerEvent::Start { since } => self.handle_start(since),
            PullerEvent::Message(msg) => self.handle_message(msg),
            PullerEvent::SubChangesReply(reply) => {
                if let Some(err) = reply.as_error() {
                    tracing::error!(session = %self.session, error = %err, "subChanges failed");
                    self.fatal_error = true;
                }
            }
            PullerEvent::RevsFound { entries, which } => self.on_revs_found(entries, which),
            PullerEvent::RevProvisionallyHandled => self.rev_provisionally_handled(),
            PullerEvent::RevsFinished { generation } => self.on_revs_finished(generation),
            PullerEvent::Disconnected => {
                tracing::info!(session = %self.session, "wire disconnected");
                self.disconnected = true;
            }
            PullerEvent::Stop => {
                if !self.stopping {
                    tracing::info!(session = %self.session, "stopping pull session");
                    self.stopping = true;
                }
            }
        }
    }

    // Subscribing to the remote change feed.

    fn handle_start(&mut self, since: Option<RemoteSequence>) {
        if self.started {
            tracing::warn!(session = %self.session, "pull session started twice");
            return;
        }
        self.started = true;
        self.skip_deleted = self.options.skip_deleted;
        if !self.options.active() {
            tracing::info!(session = %self.session, "passive pull session open");
            return;
        }

        let since = since.or_else(|| self.stored_checkpoint());
        self.last_sequence = since.unwrap_or_default();
        self.missing.clear(self.last_sequence.clone());
        tracing::info!(
            session = %self.session,
            since = %self.last_sequence,
            "starting pull from remote"
        );

        let mut msg = OutgoingMessage::request(Profile::SubChanges)
            .property("batch", self.limits.changes_batch_size.to_string());
        if !self.last_sequence.is_none() {
            msg = msg.property(
                "since",
                String::from_utf8_lossy(self.last_sequence.as_bytes()).into_owned(),
            );
        }
        if self.options.continuous() {
            msg = msg.property("continuous", "true");
        }
        if self.skip_deleted {
            msg = msg.property("activeOnly", "true");
        }
        if !self.options.channels.is_empty() {
            msg = msg
                .property("filter", "sync_gateway/bychannel")
                .property("channels", self.options.channels.join(","));
        } else if let Some(filter) = &self.options.filter {
            msg = msg.property("filter", filter.clone());
            for (name, value) in &self.options.filter_params {
                msg = msg.property(name, value.clone());
            }
        }
        if !self.options.doc_ids.is_empty() {
            msg = msg.json_body(&serde_json::json!({ "docIDs": self.options.doc_ids }));
        }

        let (reply_tx, reply_rx) = bounded(1);
        let events = self.events_tx.clone();
        std::thread::spawn(move || {
            if let Ok(reply) = reply_rx.recv() {
                let _ = events.send(PullerEvent::SubChangesReply(reply));
            }
        });
        if let Err(err) = self.wire.send_request(msg, Some(reply_tx)) {
            tracing::error!(session = %self.session, error = %err, "could not subscribe");
            self.fatal_error = true;
        }
    }

    fn stored_checkpoint(&self) -> Option<RemoteSequence> {
        match self.store.read_checkpoint(&self.checkpoint_key) {
            Ok(Some(checkpoint)) if checkpoint.config_fingerprint == self.fingerprint => {
                Some(checkpoint.last_sequence)
            }
            Ok(Some(_)) => {
                tracing::warn!(session = %self.session, "checkpoint fingerprint mismatch; starting over");
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(session = %self.session, error = %err, "checkpoint read failed");
                None
            }
        }
    }

    // Incoming change lists.

    fn handle_message(&mut self, msg: IncomingMessage) {
        if self.stopping || self.fatal_error {
            if !msg.no_reply {
                self.wire.respond(
                    msg.number,
                    WireResponse::error(ErrorDomain::Blip, CODE_UNAVAILABLE, "session stopping"),
                );
            }
            return;
        }
        match msg.profile {
            Profile::Changes | Profile::ProposeChanges => self.handle_changes(msg),
            Profile::Rev => self.handle_rev(msg),
            Profile::NoRev => self.handle_no_rev(msg),
            other => {
                tracing::warn!(session = %self.session, profile = %other, "unexpected request");
                if !msg.no_reply {
                    self.wire.respond(
                        msg.number,
                        WireResponse::error(
                            ErrorDomain::Blip,
                            CODE_BAD_REQUEST,
                            "unexpected profile",
                        ),
                    );
                }
            }
        }
    }

    fn handle_changes(&mut self, msg: IncomingMessage) {
        tracing::trace!(
            session = %self.session,
            profile = %msg.profile,
            queued = self.waiting_changes.len(),
            pending_revs = self.pending_rev_messages,
            active = self.active_incoming_revs,
            unfinished = self.unfinished_incoming_revs,
            "received change list"
        );
        self.waiting_changes.push_back(msg);
        self.drain_waiting_changes();
    }

    fn drain_waiting_changes(&mut self) {
        while self.pending_rev_messages < self.limits.max_pending_revs {
            let Some(msg) = self.waiting_changes.pop_front() else {
                break;
            };
            self.handle_changes_now(msg);
        }
    }

    fn handle_changes_now(&mut self, msg: IncomingMessage) {
        let proposed = msg.profile == Profile::ProposeChanges;
        match parse_changes_body(&msg.body) {
            Err(err) => {
                tracing::warn!(session = %self.session, error = %err, "invalid changes body");
                if !msg.no_reply {
                    self.wire.respond(
                        msg.number,
                        WireResponse::error(
                            ErrorDomain::Blip,
                            CODE_BAD_REQUEST,
                            "Invalid JSON body",
                        ),
                    );
                }
            }
            Ok(ChangesBody::CaughtUp) => {
                tracing::info!(session = %self.session, "caught up with remote changes");
                self.caught_up = true;
                self.skip_deleted = false;
                if !msg.no_reply {
                    self.wire.respond(msg.number, WireResponse::Ok);
                }
            }
            Ok(ChangesBody::Advertisements(entries)) => {
                if msg.no_reply {
                    tracing::warn!(session = %self.session, "ignoring noreply change list");
                    return;
                }
                if self.options.no_incoming_conflicts && !proposed {
                    // Conflict-free sessions require the proposeChanges form.
                    self.wire.respond(
                        msg.number,
                        WireResponse::error(
                            ErrorDomain::Blip,
                            CODE_CONFLICT,
                            "proposeChanges required",
                        ),
                    );
                    return;
                }
                self.pending_rev_finder_calls += 1;
                let _ = self.finder_tx.send(FindRequest {
                    message_number: msg.number,
                    proposed,
                    skip_deleted: self.skip_deleted,
                    entries,
                });
            }
        }
    }

    fn on_revs_found(&mut self, entries: Vec<RevDescriptor>, which: Vec<bool>) {
        self.pending_rev_finder_calls = self.pending_rev_finder_calls.saturating_sub(1);

        if self.options.active() {
            for (entry, requesting) in entries.iter().zip(&which) {
                let body_size = if *requesting { entry.body_size.max(1) } else { 0 };
                if entry.sequence.is_none() {
                    // Untracked: the body still counts toward progress, the
                    // watermark ignores it.
                    tracing::warn!(
                        session = %self.session,
                        doc = %entry.doc_id,
                        "empty sequence in changes entry"
                    );
                    self.progress += Progress::new(body_size, body_size);
                } else {
                    self.missing.add(entry.sequence.clone(), body_size);
                    self.progress += Progress::new(0, body_size);
                    if !*requesting {
                        let sequence = entry.sequence.clone();
                        self.completed_sequence(&sequence, false, true);
                    }
                }
            }
        }

        let requested = which.iter().filter(|wanted| **wanted).count() as u32;
        self.pending_rev_messages += requested;
        if self.options.active() {
            tracing::debug!(
                session = %self.session,
                awaiting = self.pending_rev_messages,
                pending = self.missing.len(),
                "requested revisions from change list"
            );
        }
        self.drain_waiting_changes();
    }

    // Incoming revision bodies.

    fn handle_rev(&mut self, msg: IncomingMessage) {
        if self.active_incoming_revs < self.limits.max_active_incoming_revs
            && self.unfinished_incoming_revs < self.limits.max_unfinished_incoming_revs
        {
            self.start_incoming_rev(msg);
        } else {
            tracing::debug!(
                session = %self.session,
                waiting = self.waiting_revs.len() + 1,
                "delaying rev message"
            );
            self.waiting_revs.push_back(msg);
        }
    }

    fn start_incoming_rev(&mut self, msg: IncomingMessage) {
        self.pending_rev_messages = self.pending_rev_messages.saturating_sub(1);
        self.active_incoming_revs += 1;
        self.unfinished_incoming_revs += 1;

        let inc = match self.spare.pop() {
            Some(mut inc) => {
                inc.reset();
                inc
            }
            None => Box::new(IncomingRev::new()),
        };

        // Same document, same worker: preserves per-document ordering.
        let worker = &self.workers[self.worker_index(msg.property("id"))];
        let _ = worker.send(RevJob { inc, msg });
        self.drain_waiting_changes();
    }

    fn worker_index(&self, doc_id: Option<&str>) -> usize {
        let mut hasher = DefaultHasher::new();
        doc_id.unwrap_or_default().hash(&mut hasher);
        (hasher.finish() % self.workers.len() as u64) as usize
    }

    fn handle_no_rev(&mut self, msg: IncomingMessage) {
        self.pending_rev_messages = self.pending_rev_messages.saturating_sub(1);
        if let Some(id) = msg.property("id") {
            self.doc_ids.remove(&DocId::from(id));
        }
        if let Some(error) = msg.property("error") {
            tracing::debug!(
                session = %self.session,
                doc = msg.property("id").unwrap_or_default(),
                error,
                "peer cannot send revision"
            );
        }
        if self.options.active()
            && let Some(sequence) = msg.property("sequence")
        {
            let sequence = RemoteSequence::new(sequence.to_string());
            self.completed_sequence(&sequence, false, true);
        }
        if !msg.no_reply {
            self.wire.respond(msg.number, WireResponse::Ok);
        }
        self.drain_waiting_changes();
    }

    /// A revision was staged (or failed before staging); its active slot
    /// frees up and one parked rev message may be admitted.
    fn rev_provisionally_handled(&mut self) {
        self.active_incoming_revs = self.active_incoming_revs.saturating_sub(1);
        if self.active_incoming_revs < self.limits.max_active_incoming_revs
            && self.unfinished_incoming_revs < self.limits.max_unfinished_incoming_revs
            && let Some(msg) = self.waiting_revs.pop_front()
        {
            self.start_incoming_rev(msg);
        }
    }

    fn on_revs_finished(&mut self, generation: u64) {
        let batch = self.returning.pop(generation);
        let count = batch.len() as u32;
        let mut recyclable = Vec::with_capacity(batch.len());
        for inc in batch {
            if !inc.was_provisionally_inserted() {
                self.rev_provisionally_handled();
            }
            if self.options.active() {
                let sequence = inc.remote_sequence().clone();
                self.completed_sequence(&sequence, inc.error_is_transient, false);
            }
            let rev = inc.replicated();
            if let Some(error) = &rev.error {
                tracing::debug!(
                    session = %self.session,
                    doc = %rev.doc_id,
                    rev = %rev.rev_id,
                    transient = rev.error_is_transient,
                    error = %error,
                    "pulled revision failed"
                );
            }
            self.delegate.document_ended(rev);
            recyclable.push(inc);
        }
        self.unfinished_incoming_revs = self.unfinished_incoming_revs.saturating_sub(count);

        if self.options.active() {
            self.update_last_sequence();
        }

        let capacity = (self.limits.max_active_incoming_revs as usize)
            .saturating_sub(self.spare.len());
        self.spare.extend(recyclable.into_iter().take(capacity));
    }

    // Checkpoint bookkeeping.

    fn completed_sequence(
        &mut self,
        sequence: &RemoteSequence,
        with_transient_error: bool,
        should_update_last_sequence: bool,
    ) {
        if sequence.is_none() {
            // Settled at advertisement time; nothing to remove or credit.
            return;
        }
        let body_size = if with_transient_error {
            // Keep the sequence pending so a later pull re-requests it, but
            // credit its bytes so progress can converge.
            self.missing.body_size_of(sequence)
        } else {
            let (was_earliest, body_size) = self.missing.remove(sequence);
            if was_earliest && should_update_last_sequence {
                self.update_last_sequence();
            }
            body_size
        };
        self.progress += Progress::new(body_size, 0);
    }

    fn update_last_sequence(&mut self) {
        if self.missing.since() == &self.last_sequence {
            return;
        }
        self.last_sequence = self.missing.since().clone();
        tracing::debug!(
            session = %self.session,
            checkpoint = %self.last_sequence,
            "checkpoint advanced"
        );
        let checkpoint = self.checkpoint();
        if let Err(err) = self.store.write_checkpoint(&self.checkpoint_key, &checkpoint) {
            tracing::warn!(session = %self.session, error = %err, "checkpoint write failed");
        }
        self.delegate.checkpoint_changed(&checkpoint);
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            last_sequence: self.last_sequence.clone(),
            config_fingerprint: self.fingerprint.clone(),
        }
    }

    // Status and lifecycle.

    fn compute_activity(&mut self) -> ActivityLevel {
        if self.fatal_error || self.disconnected || !self.wire.connected() {
            ActivityLevel::Stopped
        } else if (self.options.active() && self.started && !self.caught_up)
            || self.pending_rev_messages > 0
            || self.unfinished_incoming_revs > 0
            || self.pending_rev_finder_calls > 0
        {
            ActivityLevel::Busy
        } else if self.options.active() && !self.started {
            ActivityLevel::Connecting
        } else if self.options.continuous() || !self.options.active() {
            self.spare.clear();
            ActivityLevel::Idle
        } else {
            ActivityLevel::Stopped
        }
    }

    fn publish_status(&mut self) {
        let status = PullStatus {
            level: self.compute_activity(),
            progress: self.progress,
        };
        if status != self.published {
            tracing::debug!(
                session = %self.session,
                level = ?status.level,
                completed = status.progress.completed,
                total = status.progress.total,
                "pull status changed"
            );
            self.published = status;
            *self.status.lock().expect("status cell poisoned") = status;
            self.delegate.status_changed(status);
        }
    }

    fn finished(&self) -> bool {
        let drained = self.unfinished_incoming_revs == 0 && self.pending_rev_finder_calls == 0;
        if self.stopping || self.fatal_error || self.disconnected {
            return drained;
        }
        // A one-shot pull ends on its own once everything settled.
        self.started
            && self.options.mode == PullMode::OneShot
            && self.caught_up
            && drained
            && self.pending_rev_messages == 0
            && self.waiting_changes.is_empty()
            && self.waiting_revs.is_empty()
    }

    fn teardown(&mut self) {
        if self.options.active() && self.started {
            self.update_last_sequence();
            let checkpoint = self.checkpoint();
            if let Err(err) = self.store.write_checkpoint(&self.checkpoint_key, &checkpoint) {
                tracing::warn!(session = %self.session, error = %err, "final checkpoint write failed");
            }
        }

        // Answer anything still parked so the peer is not left hanging.
        let parked: Vec<IncomingMessage> = self
            .waiting_revs
            .drain(..)
            .chain(self.waiting_changes.drain(..))
            .collect();
        for msg in parked {
            if !msg.no_reply {
                self.wire.respond(
                    msg.number,
                    WireResponse::error(ErrorDomain::Blip, CODE_UNAVAILABLE, "session stopped"),
                );
            }
        }
        self.spare.clear();

        let status = PullStatus {
            level: ActivityLevel::Stopped,
            progress: self.progress,
        };
        if status != self.published {
            self.published = status;
            *self.status.lock().expect("status cell poisoned") = status;
            self.delegate.status_changed(status);
        }
        tracing::info!(
            session = %self.session,
            completed = self.progress.completed,
            total = self.progress.total,
            "pull session ended"
        );
    }
}
